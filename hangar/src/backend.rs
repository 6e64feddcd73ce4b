//! The blob-backend collaborator contract. The core never hashes or stores
//! tensor bytes itself: it hands payloads to a backend, records the digest
//! the backend produced, and treats that hash as an opaque identifier from
//! then on.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{CResult, Error};

/// Storage collaborator holding the actual array bytes, addressed by
/// content hash.
pub trait BlobBackend: Send + Sync {
    /// Content hash of a payload, as produced by this blob writer.
    fn digest(&self, data: &[u8]) -> String;

    /// Stores a payload under its hash, returning the backend-owned
    /// location string. Re-putting an existing hash is a no-op.
    fn put(&self, hash: &str, data: &[u8]) -> CResult<String>;

    /// Retrieves the payload for a hash.
    fn get(&self, hash: &str) -> CResult<Vec<u8>>;

    fn exists(&self, hash: &str) -> CResult<bool>;

    /// Promotes blobs ingested during the current writer session into
    /// permanent storage; called after a successful commit.
    fn persist_staged(&self) -> CResult<()> {
        Ok(())
    }

    /// Discards blobs ingested during the current writer session; called on
    /// staging reset.
    fn purge_staged(&self) -> CResult<()> {
        Ok(())
    }
}

/// A filesystem blob store: committed blobs under `store/<hh>/<hash>`
/// (append-only), in-flight blobs flat under the stage scratch directory
/// until the session commits.
pub struct FsBlobStore {
    store_dir: PathBuf,
    stage_dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(store_dir: &Path, stage_dir: &Path) -> CResult<Self> {
        std::fs::create_dir_all(store_dir)?;
        std::fs::create_dir_all(stage_dir)?;
        Ok(Self { store_dir: store_dir.to_path_buf(), stage_dir: stage_dir.to_path_buf() })
    }

    fn store_path(&self, hash: &str) -> PathBuf {
        let fanout = hash.get(..2).unwrap_or("xx");
        self.store_dir.join(fanout).join(hash)
    }

    fn stage_path(&self, hash: &str) -> PathBuf {
        self.stage_dir.join(hash)
    }
}

impl BlobBackend for FsBlobStore {
    fn digest(&self, data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn put(&self, hash: &str, data: &[u8]) -> CResult<String> {
        if !self.exists(hash)? {
            std::fs::write(self.stage_path(hash), data)?;
        }
        Ok(format!("00:{}", hash))
    }

    fn get(&self, hash: &str) -> CResult<Vec<u8>> {
        let committed = self.store_path(hash);
        if committed.exists() {
            return Ok(std::fs::read(committed)?);
        }
        let staged = self.stage_path(hash);
        if staged.exists() {
            return Ok(std::fs::read(staged)?);
        }
        Err(Error::EnvError(format!("blob not found: {}", hash)))
    }

    fn exists(&self, hash: &str) -> CResult<bool> {
        Ok(self.store_path(hash).exists() || self.stage_path(hash).exists())
    }

    fn persist_staged(&self) -> CResult<()> {
        for entry in std::fs::read_dir(&self.stage_dir)? {
            let entry = entry?;
            let hash = entry.file_name().to_string_lossy().into_owned();
            let target = self.store_path(&hash);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(entry.path(), target)?;
        }
        Ok(())
    }

    fn purge_staged(&self) -> CResult<()> {
        for entry in std::fs::read_dir(&self.stage_dir)? {
            std::fs::remove_file(entry?.path())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> CResult<FsBlobStore> {
        FsBlobStore::new(&dir.join("store"), &dir.join("stage_data"))
    }

    #[test]
    fn digest_is_deterministic() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let s = store(dir.path())?;
        assert_eq!(s.digest(b"abc"), s.digest(b"abc"));
        assert_ne!(s.digest(b"abc"), s.digest(b"abd"));
        assert_eq!(s.digest(b"abc").len(), 64);
        Ok(())
    }

    #[test]
    fn put_get_exists_roundtrip() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let s = store(dir.path())?;
        let hash = s.digest(b"payload");

        assert!(!s.exists(&hash)?);
        assert!(s.get(&hash).is_err());

        s.put(&hash, b"payload")?;
        assert!(s.exists(&hash)?);
        assert_eq!(s.get(&hash)?, b"payload".to_vec());

        // Idempotent re-put.
        s.put(&hash, b"payload")?;
        assert_eq!(s.get(&hash)?, b"payload".to_vec());
        Ok(())
    }

    #[test]
    fn persist_moves_staged_blobs_into_store() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let s = store(dir.path())?;
        let hash = s.digest(b"payload");
        s.put(&hash, b"payload")?;

        assert!(dir.path().join("stage_data").join(&hash).exists());
        s.persist_staged()?;
        assert!(!dir.path().join("stage_data").join(&hash).exists());
        assert!(dir.path().join("store").join(&hash[..2]).join(&hash).exists());
        assert_eq!(s.get(&hash)?, b"payload".to_vec());
        Ok(())
    }

    #[test]
    fn purge_discards_staged_blobs() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let s = store(dir.path())?;
        let hash = s.digest(b"payload");
        s.put(&hash, b"payload")?;

        s.purge_staged()?;
        assert!(!s.exists(&hash)?);
        Ok(())
    }
}
