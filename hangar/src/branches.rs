//! The branch & head store: branch name to head commit mappings, the
//! `STAGING` pointer naming the branch the staging area is based on, and the
//! persisted writer lock serializing all mutation sessions.
//!
//! Every operation runs in its own write transaction on the branch
//! environment, so check-and-set sequences are atomic against concurrent
//! writers; the environment's exclusive file lock extends the guarantee
//! across processes.

use crate::error::{CResult, Error};
use crate::records::validate_name;
use crate::storage::env::Environment;

/// Branch record key prefix.
const BRANCH_PREFIX: &str = "branch:";
/// Names the branch whose head the staging area is based on.
const STAGING_KEY: &[u8] = b"STAGING";
/// Holds either [`LOCK_AVAILABLE`] or a writer token.
const WRITER_LOCK_KEY: &[u8] = b"WRITER_LOCK";
/// Sentinel meaning no writer session holds the repository.
pub const LOCK_AVAILABLE: &str = "LOCK_AVAILABLE";
/// Committer identity recorded at repository init.
const USER_NAME_KEY: &[u8] = b"USER_NAME";
const USER_EMAIL_KEY: &[u8] = b"USER_EMAIL";

pub struct BranchStore {
    branchenv: Environment,
}

impl BranchStore {
    pub fn new(branchenv: Environment) -> Self {
        Self { branchenv }
    }

    fn branch_key(name: &str) -> Vec<u8> {
        format!("{}{}", BRANCH_PREFIX, name).into_bytes()
    }

    /// Seeds a fresh branch environment: the default branch unborn, staging
    /// pointed at it, the writer lock available.
    pub fn initialize(&self, default_branch: &str, head: &str) -> CResult<()> {
        validate_name(default_branch)?;
        let mut txn = self.branchenv.begin_write()?;
        txn.set(&Self::branch_key(default_branch), head.as_bytes().to_vec());
        txn.set(STAGING_KEY, default_branch.as_bytes().to_vec());
        txn.set(WRITER_LOCK_KEY, LOCK_AVAILABLE.as_bytes().to_vec());
        txn.commit()
    }

    pub fn set_identity(&self, name: &str, email: &str) -> CResult<()> {
        let mut txn = self.branchenv.begin_write()?;
        txn.set(USER_NAME_KEY, name.as_bytes().to_vec());
        txn.set(USER_EMAIL_KEY, email.as_bytes().to_vec());
        txn.commit()
    }

    /// The committer identity recorded at init: `(name, email)`.
    pub fn get_identity(&self) -> CResult<(String, String)> {
        let read = self.branchenv.begin_read()?;
        match (read.get(USER_NAME_KEY), read.get(USER_EMAIL_KEY)) {
            (Some(name), Some(email)) => {
                Ok((String::from_utf8(name)?, String::from_utf8(email)?))
            }
            _ => Err(Error::EnvError("branch store missing committer identity".to_string())),
        }
    }

    pub fn create_branch(&self, name: &str, at_hash: &str) -> CResult<()> {
        validate_name(name)?;
        let mut txn = self.branchenv.begin_write()?;
        if txn.get(&Self::branch_key(name))?.is_some() {
            return Err(Error::InvalidName(name.to_string()));
        }
        txn.set(&Self::branch_key(name), at_hash.as_bytes().to_vec());
        txn.commit()
    }

    /// All branch names, sorted.
    pub fn list_branches(&self) -> CResult<Vec<String>> {
        let read = self.branchenv.begin_read()?;
        let mut names = Vec::new();
        for (key, _) in read.snapshot().scan_prefix(BRANCH_PREFIX.as_bytes()) {
            let name = String::from_utf8(key[BRANCH_PREFIX.len()..].to_vec())?;
            names.push(name);
        }
        Ok(names)
    }

    /// Removes a branch head record. The branch named by `STAGING` cannot be
    /// deleted.
    pub fn delete_branch(&self, name: &str) -> CResult<()> {
        let mut txn = self.branchenv.begin_write()?;
        let staging = txn
            .get(STAGING_KEY)?
            .ok_or_else(|| Error::EnvError("branch store missing STAGING record".to_string()))?;
        if staging == name.as_bytes() {
            return Err(Error::InvalidName(format!(
                "cannot delete the staging area base branch: {}",
                name
            )));
        }
        if txn.get(&Self::branch_key(name))?.is_none() {
            return Err(Error::UnknownBranch(name.to_string()));
        }
        txn.delete(&Self::branch_key(name));
        txn.commit()
    }

    pub fn get_head(&self, name: &str) -> CResult<String> {
        let read = self.branchenv.begin_read()?;
        match read.get(&Self::branch_key(name)) {
            Some(hash) => Ok(String::from_utf8(hash)?),
            None => Err(Error::UnknownBranch(name.to_string())),
        }
    }

    pub fn set_head(&self, name: &str, hash: &str) -> CResult<()> {
        let mut txn = self.branchenv.begin_write()?;
        if txn.get(&Self::branch_key(name))?.is_none() {
            return Err(Error::UnknownBranch(name.to_string()));
        }
        txn.set(&Self::branch_key(name), hash.as_bytes().to_vec());
        txn.commit()
    }

    pub fn get_staging_branch(&self) -> CResult<String> {
        let read = self.branchenv.begin_read()?;
        match read.get(STAGING_KEY) {
            Some(name) => Ok(String::from_utf8(name)?),
            None => Err(Error::EnvError("branch store missing STAGING record".to_string())),
        }
    }

    pub fn set_staging_branch(&self, name: &str) -> CResult<()> {
        let mut txn = self.branchenv.begin_write()?;
        if txn.get(&Self::branch_key(name))?.is_none() {
            return Err(Error::UnknownBranch(name.to_string()));
        }
        txn.set(STAGING_KEY, name.as_bytes().to_vec());
        txn.commit()
    }

    /// Atomically takes the writer lock for `token`. Re-acquiring with the
    /// token already stored is a no-op success, so writer sessions can
    /// re-verify ownership through this path.
    pub fn acquire_writer_lock(&self, token: &str) -> CResult<()> {
        let mut txn = self.branchenv.begin_write()?;
        let current = txn
            .get(WRITER_LOCK_KEY)?
            .ok_or_else(|| Error::EnvError("branch store missing WRITER_LOCK record".to_string()))?;
        if current == token.as_bytes() {
            return Ok(());
        }
        if current != LOCK_AVAILABLE.as_bytes() {
            return Err(Error::LockHeld);
        }
        txn.set(WRITER_LOCK_KEY, token.as_bytes().to_vec());
        txn.commit()
    }

    /// Atomically returns the writer lock. Fails with `LockMismatch` when
    /// the stored value is not `token`.
    pub fn release_writer_lock(&self, token: &str) -> CResult<()> {
        let mut txn = self.branchenv.begin_write()?;
        let current = txn
            .get(WRITER_LOCK_KEY)?
            .ok_or_else(|| Error::EnvError("branch store missing WRITER_LOCK record".to_string()))?;
        if current != token.as_bytes() {
            return Err(Error::LockMismatch);
        }
        txn.set(WRITER_LOCK_KEY, LOCK_AVAILABLE.as_bytes().to_vec());
        txn.commit()
    }

    /// Unconditionally resets the writer lock. The recovery path after a
    /// crashed writer; loud on purpose.
    pub fn force_release_writer_lock(&self) -> CResult<()> {
        let mut txn = self.branchenv.begin_write()?;
        txn.set(WRITER_LOCK_KEY, LOCK_AVAILABLE.as_bytes().to_vec());
        txn.commit()?;
        log::warn!("writer lock forcibly released; any live writer checkout is now invalid");
        Ok(())
    }

    pub fn writer_lock_held(&self) -> CResult<bool> {
        let read = self.branchenv.begin_read()?;
        match read.get(WRITER_LOCK_KEY) {
            Some(value) => Ok(value != LOCK_AVAILABLE.as_bytes()),
            None => Err(Error::EnvError("branch store missing WRITER_LOCK record".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commits::UNBORN;

    fn store() -> CResult<BranchStore> {
        let store = BranchStore::new(Environment::memory("branch"));
        store.initialize("master", UNBORN)?;
        Ok(store)
    }

    #[test]
    fn initialize_seeds_defaults() -> CResult<()> {
        let s = store()?;
        assert_eq!(s.list_branches()?, vec!["master".to_string()]);
        assert_eq!(s.get_head("master")?, UNBORN);
        assert_eq!(s.get_staging_branch()?, "master");
        assert!(!s.writer_lock_held()?);
        Ok(())
    }

    #[test]
    fn branch_crud() -> CResult<()> {
        let s = store()?;
        s.create_branch("foo", "beef")?;
        assert_eq!(s.list_branches()?, vec!["foo".to_string(), "master".to_string()]);
        assert_eq!(s.get_head("foo")?, "beef");

        // Duplicate and invalid names rejected.
        assert!(matches!(s.create_branch("foo", "beef"), Err(Error::InvalidName(_))));
        assert!(matches!(s.create_branch("has space", "beef"), Err(Error::InvalidName(_))));

        s.set_head("foo", "cafe")?;
        assert_eq!(s.get_head("foo")?, "cafe");
        assert!(matches!(s.set_head("nope", "cafe"), Err(Error::UnknownBranch(_))));
        assert!(matches!(s.get_head("nope"), Err(Error::UnknownBranch(_))));

        s.delete_branch("foo")?;
        assert_eq!(s.list_branches()?, vec!["master".to_string()]);
        assert!(matches!(s.delete_branch("foo"), Err(Error::UnknownBranch(_))));
        Ok(())
    }

    #[test]
    fn staging_branch_cannot_be_deleted() -> CResult<()> {
        let s = store()?;
        assert!(matches!(s.delete_branch("master"), Err(Error::InvalidName(_))));

        s.create_branch("foo", UNBORN)?;
        s.set_staging_branch("foo")?;
        assert_eq!(s.get_staging_branch()?, "foo");
        // Now master is deletable, foo is not.
        s.delete_branch("master")?;
        assert!(matches!(s.delete_branch("foo"), Err(Error::InvalidName(_))));
        Ok(())
    }

    #[test]
    fn writer_lock_lifecycle() -> CResult<()> {
        let s = store()?;
        s.acquire_writer_lock("writer-1")?;
        assert!(s.writer_lock_held()?);

        // Exactly one concurrent acquirer wins; the holder may re-acquire.
        assert!(matches!(s.acquire_writer_lock("writer-2"), Err(Error::LockHeld)));
        s.acquire_writer_lock("writer-1")?;

        // Release requires the matching token.
        assert!(matches!(s.release_writer_lock("writer-2"), Err(Error::LockMismatch)));
        s.release_writer_lock("writer-1")?;
        assert!(!s.writer_lock_held()?);

        s.acquire_writer_lock("writer-2")?;
        Ok(())
    }

    #[test]
    fn concurrent_acquirers_exactly_one_wins() -> CResult<()> {
        use std::sync::Arc;

        let s = Arc::new(store()?);
        let mut handles = Vec::new();
        for i in 0..8 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || {
                s.acquire_writer_lock(&format!("writer-{}", i)).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
        assert!(s.writer_lock_held()?);
        Ok(())
    }

    #[test]
    fn force_release_recovers_a_leaked_lock() -> CResult<()> {
        let s = store()?;
        s.acquire_writer_lock("leaked")?;
        assert!(matches!(s.acquire_writer_lock("writer-2"), Err(Error::LockHeld)));

        s.force_release_writer_lock()?;
        assert!(!s.writer_lock_held()?);
        s.acquire_writer_lock("writer-2")?;
        Ok(())
    }
}
