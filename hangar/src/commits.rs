//! The commit store: immutable commit headers plus each commit's packed
//! record set, addressed by commit hash in the `ref` environment.
//!
//! A commit's record set is fully recoverable from its hash alone; there is
//! no delta encoding against other commits. The packed byte stream is also
//! the input of the record root hash, the commit's content fingerprint.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use chrono::Utc;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CResult, Error};
use crate::storage::env::Environment;

/// Head hash of a branch with no commits yet.
pub const UNBORN: &str = "";

/// A commit header. The record set is stored beside it but not part of the
/// header struct handed to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitSpec {
    /// Zero parents for a root commit, one for a normal commit, two for a
    /// merge commit (master first).
    pub parents: Vec<String>,
    pub author: String,
    pub email: String,
    pub message: String,
    /// Microseconds since the unix epoch.
    pub commit_time: i64,
    /// SHA-256 over the byte-sorted, length-framed record stream.
    pub record_root_hash: String,
}

/// On-disk form: header plus the sorted record set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct StoredCommit {
    spec: CommitSpec,
    records: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Frames a sorted record stream the way the storage log frames entries:
/// key length and value length as big-endian u32, then the raw bytes.
fn pack_records(records: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for (key, value) in records {
        buf.put_u32(key.len() as u32);
        buf.put_u32(value.len() as u32);
        buf.put(key.as_slice());
        buf.put(value.as_slice());
    }
    buf.to_vec()
}

/// The commit content fingerprint: SHA-256 of the packed record stream.
pub fn record_root_hash(records: &[(Vec<u8>, Vec<u8>)]) -> String {
    hex::encode(Sha256::digest(pack_records(records)))
}

/// The commit identity: SHA-256 over parents, record root, author identity,
/// and commit time, each terminated by a NUL so fields can never alias.
fn commit_digest(
    parents: &[String],
    root: &str,
    author: &str,
    email: &str,
    commit_time: i64,
) -> String {
    let mut hasher = Sha256::new();
    for parent in parents {
        hasher.update(parent.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(root.as_bytes());
    hasher.update([0u8]);
    hasher.update(author.as_bytes());
    hasher.update([0u8]);
    hasher.update(email.as_bytes());
    hasher.update([0u8]);
    hasher.update(commit_time.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// An unpacked commit record environment in a temp directory named by the
/// commit hash. Dropping the guard deletes the directory.
pub struct EphemeralEnv {
    env: Environment,
    dir: PathBuf,
}

impl EphemeralEnv {
    pub fn env(&self) -> &Environment {
        &self.env
    }
}

impl Drop for EphemeralEnv {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            log::error!("failed to remove ephemeral env {:?}: {}", self.dir, err);
        }
    }
}

/// Commit persistence and history traversal over the `ref` environment.
pub struct CommitStore {
    refenv: Environment,
    tmp_root: PathBuf,
}

impl CommitStore {
    pub fn new(refenv: Environment, tmp_root: &Path) -> Self {
        Self { refenv, tmp_root: tmp_root.to_path_buf() }
    }

    /// Persists the given sorted record stream as a new commit and returns
    /// its hash. Writing a commit which already exists is a no-op returning
    /// the same hash.
    pub fn write_commit(
        &self,
        parents: Vec<String>,
        author: &str,
        email: &str,
        message: &str,
        mut records: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> CResult<String> {
        // The root hash is defined over the byte-sorted stream.
        records.sort();
        let commit_time = Utc::now().timestamp_micros();
        let root = record_root_hash(&records);
        let hash = commit_digest(&parents, &root, author, email, commit_time);

        if self.check_in_history(&hash)? {
            return Ok(hash);
        }

        let stored = StoredCommit {
            spec: CommitSpec {
                parents,
                author: author.to_string(),
                email: email.to_string(),
                message: message.to_string(),
                commit_time,
                record_root_hash: root,
            },
            records,
        };
        let mut txn = self.refenv.begin_write()?;
        txn.set(hash.as_bytes(), bincode::serialize(&stored)?);
        txn.commit()?;
        log::debug!("wrote commit {}", hash);
        Ok(hash)
    }

    fn load(&self, hash: &str) -> CResult<StoredCommit> {
        let read = self.refenv.begin_read()?;
        match read.get(hash.as_bytes()) {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(Error::UnknownCommit(hash.to_string())),
        }
    }

    /// The commit header for a hash.
    pub fn get_commit(&self, hash: &str) -> CResult<CommitSpec> {
        Ok(self.load(hash)?.spec)
    }

    /// The sorted record stream of a commit. The unborn head resolves to the
    /// empty record set.
    pub fn get_records(&self, hash: &str) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if hash == UNBORN {
            return Ok(Vec::new());
        }
        Ok(self.load(hash)?.records)
    }

    pub fn check_in_history(&self, hash: &str) -> CResult<bool> {
        Ok(self.refenv.begin_read()?.get(hash.as_bytes()).is_some())
    }

    /// Unpacks a commit's record set into a fresh environment under
    /// `tmp/<hash>/`. The environment is fully populated before return; the
    /// returned guard deletes the directory on drop.
    pub fn materialize(&self, hash: &str) -> CResult<EphemeralEnv> {
        let records = self.get_records(hash)?;
        let dir = self.tmp_root.join(hash);
        if dir.exists() {
            // left behind by an interrupted merge
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        let env = Environment::open("tmp", &dir, true)?;
        let mut txn = env.begin_write()?;
        for (key, value) in records {
            txn.set(&key, value);
        }
        txn.commit()?;
        Ok(EphemeralEnv { env, dir })
    }

    /// Every ancestor of a commit (the commit itself included) mapped to its
    /// BFS depth from the head.
    pub fn ancestors(&self, hash: &str) -> CResult<HashMap<String, u32>> {
        let mut graph = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back((hash.to_string(), 0u32));
        while let Some((current, depth)) = queue.pop_front() {
            if graph.contains_key(&current) {
                continue;
            }
            let spec = self.get_commit(&current)?;
            graph.insert(current, depth);
            for parent in spec.parents {
                if !graph.contains_key(&parent) {
                    queue.push_back((parent, depth + 1));
                }
            }
        }
        Ok(graph)
    }

    /// The merge base of two commits: the common ancestor with the greatest
    /// commit time, ties broken by lexicographically smallest hash so the
    /// choice is deterministic across machines.
    pub fn lowest_common_ancestor(&self, a: &str, b: &str) -> CResult<String> {
        let a_graph = self.ancestors(a)?;
        let b_graph = self.ancestors(b)?;

        let mut candidates = Vec::new();
        for hash in a_graph.keys() {
            if b_graph.contains_key(hash) {
                let time = self.get_commit(hash)?.commit_time;
                candidates.push((time, hash.clone()));
            }
        }
        candidates
            .into_iter()
            .min_by(|(ta, ha), (tb, hb)| tb.cmp(ta).then_with(|| ha.cmp(hb)))
            .map(|(_, hash)| hash)
            .ok_or_else(|| {
                Error::UnknownCommit(format!("no common ancestor between {} and {}", a, b))
            })
    }

    /// True when `a` can fast-forward to `b`, i.e. `a` is an ancestor of `b`.
    pub fn can_fast_forward(&self, a: &str, b: &str) -> CResult<bool> {
        Ok(self.ancestors(b)?.contains_key(a))
    }

    /// First-parent history walk from a head, newest first.
    pub fn log(&self, head: &str) -> CResult<Vec<String>> {
        let mut out = Vec::new();
        let mut current = head.to_string();
        while current != UNBORN {
            let spec = self.get_commit(&current)?;
            out.push(current);
            current = spec.parents.first().cloned().unwrap_or_default();
        }
        Ok(out)
    }
}
