//! Named record environments over a storage engine.
//!
//! An [`Environment`] is an opened, shareable engine holding one ordered
//! record keyspace (branch records, commit refs, staged records, ...).
//! Reads go through point-in-time snapshots which are reference-counted per
//! environment: beginning a read while another read transaction is live
//! returns the same underlying snapshot. Writes go through a single buffered
//! write transaction per environment which applies atomically on commit and
//! discards everything on abort.

use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{CResult, Error};
use crate::storage::log_cask::LogCask;
use crate::storage::memory::Memory;
use crate::storage::RecordEngine;

/// File name of the record log inside an environment directory.
const RECORDS_FILE: &str = "records.db";

/// A frozen, fully-sorted copy of an environment's record stream.
pub struct Snapshot {
    records: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Snapshot {
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.records.get(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Vec<u8>, Vec<u8>> {
        self.records.iter()
    }

    /// Iterates over all records whose key starts with the given prefix.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> btree_map::Range<'a, Vec<u8>, Vec<u8>> {
        let start = Bound::Included(prefix.to_vec());
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => Bound::Excluded(
                prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect(),
            ),
            None => Bound::Unbounded,
        };
        self.records.range::<Vec<u8>, _>((start, end))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct EnvInner {
    name: String,
    path: Option<PathBuf>,
    engine: Mutex<Box<dyn RecordEngine>>,
    /// The live reader snapshot, shared by every read transaction begun
    /// while one is outstanding. Cleared on write commit so later readers
    /// observe the new state.
    live_reader: Mutex<Weak<Snapshot>>,
    /// Set while a write transaction is outstanding.
    writer_active: AtomicBool,
    writable: bool,
}

/// A named, opened record environment. Cloning shares the engine.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "env:{}", self.inner.name)
    }
}

impl Environment {
    /// Opens (or creates) a persistent environment rooted at the given
    /// directory. The record log takes an exclusive file lock for the
    /// lifetime of the environment.
    pub fn open(name: &str, dir: &Path, writable: bool) -> CResult<Self> {
        let cask = LogCask::new(dir.join(RECORDS_FILE))?;
        Ok(Self {
            inner: Arc::new(EnvInner {
                name: name.to_string(),
                path: Some(dir.to_path_buf()),
                engine: Mutex::new(Box::new(cask)),
                live_reader: Mutex::new(Weak::new()),
                writer_active: AtomicBool::new(false),
                writable,
            }),
        })
    }

    /// Creates an anonymous in-memory environment, always writable.
    pub fn memory(name: &str) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                name: name.to_string(),
                path: None,
                engine: Mutex::new(Box::new(Memory::new())),
                live_reader: Mutex::new(Weak::new()),
                writer_active: AtomicBool::new(false),
                writable: true,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    fn engine(&self) -> CResult<MutexGuard<'_, Box<dyn RecordEngine>>> {
        self.inner
            .engine
            .lock()
            .map_err(|_| Error::EnvError(format!("engine mutex poisoned in {}", self)))
    }

    /// Begins a read transaction, sharing the live snapshot when one exists.
    pub fn begin_read(&self) -> CResult<ReadTxn> {
        let mut live = self
            .inner
            .live_reader
            .lock()
            .map_err(|_| Error::EnvError(format!("reader registry poisoned in {}", self)))?;
        if let Some(snapshot) = live.upgrade() {
            return Ok(ReadTxn { snapshot });
        }
        let mut engine = self.engine()?;
        let records: BTreeMap<Vec<u8>, Vec<u8>> = engine.stream()?.into_iter().collect();
        let snapshot = Arc::new(Snapshot { records });
        *live = Arc::downgrade(&snapshot);
        Ok(ReadTxn { snapshot })
    }

    /// Begins a buffered write transaction. Fails with `TxnError` when
    /// another write transaction is outstanding in this environment, and
    /// with `EnvError` when the environment is read-only.
    pub fn begin_write(&self) -> CResult<WriteTxn> {
        if !self.inner.writable {
            return Err(Error::EnvError(format!("{} is read-only", self)));
        }
        if self
            .inner
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::TxnError(format!("concurrent writer in {}", self)));
        }
        Ok(WriteTxn { env: self.clone(), pending: BTreeMap::new(), finished: false })
    }
}

/// A read transaction: an owned handle on a shared snapshot.
pub struct ReadTxn {
    snapshot: Arc<Snapshot>,
}

impl ReadTxn {
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.snapshot.get(key).cloned()
    }

    /// Sorted owned dump of the whole record stream.
    pub fn records(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.snapshot.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    #[cfg(test)]
    pub(crate) fn shares_snapshot(&self, other: &ReadTxn) -> bool {
        Arc::ptr_eq(&self.snapshot, &other.snapshot)
    }
}

/// A buffered write transaction. Mutations stage in memory and apply to the
/// engine atomically on [`WriteTxn::commit`]; dropping the transaction
/// without committing discards all of them.
pub struct WriteTxn {
    env: Environment,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    finished: bool,
}

impl WriteTxn {
    pub fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.pending.insert(key.to_vec(), Some(value));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    /// Reads through the pending buffer, falling back to the engine.
    pub fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        self.env.engine()?.get(key)
    }

    /// Applies every pending mutation to the engine and flushes. Later
    /// readers observe the new state; snapshots taken before remain intact.
    pub fn commit(mut self) -> CResult<()> {
        {
            let mut engine = self.env.engine()?;
            for (key, value) in std::mem::take(&mut self.pending) {
                match value {
                    Some(value) => engine.set(&key, value)?,
                    None => engine.delete(&key)?,
                }
            }
            engine.flush()?;
        }
        if let Ok(mut live) = self.env.inner.live_reader.lock() {
            *live = Weak::new();
        }
        self.finish();
        Ok(())
    }

    /// Discards all pending mutations.
    pub fn abort(mut self) {
        self.pending.clear();
        self.finish();
    }

    fn finish(&mut self) {
        self.finished = true;
        self.env.inner.writer_active.store(false, Ordering::Release);
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

/// A repository-owned table of opened environments keyed by path, so every
/// opener of the same path shares one engine (and one file lock).
pub struct EnvRegistry {
    envs: Mutex<HashMap<PathBuf, Environment>>,
}

impl EnvRegistry {
    pub fn new() -> Self {
        Self { envs: Mutex::new(HashMap::new()) }
    }

    pub fn open(&self, name: &str, dir: &Path, writable: bool) -> CResult<Environment> {
        let mut envs = self
            .envs
            .lock()
            .map_err(|_| Error::EnvError("environment registry poisoned".to_string()))?;
        if let Some(env) = envs.get(dir) {
            return Ok(env.clone());
        }
        let env = Environment::open(name, dir, writable)?;
        envs.insert(dir.to_path_buf(), env.clone());
        Ok(env)
    }
}

impl Default for EnvRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_readers_share_a_snapshot() -> CResult<()> {
        let env = Environment::memory("t");
        let mut txn = env.begin_write()?;
        txn.set(b"a", vec![1]);
        txn.commit()?;

        let r1 = env.begin_read()?;
        let r2 = env.begin_read()?;
        assert!(r1.shares_snapshot(&r2));

        // After both readers drop, a new reader re-snapshots.
        drop(r1);
        drop(r2);
        let r3 = env.begin_read()?;
        assert_eq!(r3.get(b"a"), Some(vec![1]));
        Ok(())
    }

    #[test]
    fn writes_invisible_until_new_reader() -> CResult<()> {
        let env = Environment::memory("t");
        let mut txn = env.begin_write()?;
        txn.set(b"a", vec![1]);
        txn.commit()?;

        let before = env.begin_read()?;
        let mut txn = env.begin_write()?;
        txn.set(b"a", vec![2]);
        txn.commit()?;

        assert_eq!(before.get(b"a"), Some(vec![1]));
        let after = env.begin_read()?;
        assert_eq!(after.get(b"a"), Some(vec![2]));
        assert!(!before.shares_snapshot(&after));
        Ok(())
    }

    #[test]
    fn concurrent_writers_rejected() -> CResult<()> {
        let env = Environment::memory("t");
        let txn = env.begin_write()?;
        assert!(matches!(env.begin_write(), Err(Error::TxnError(_))));
        txn.abort();
        assert!(env.begin_write().is_ok());
        Ok(())
    }

    #[test]
    fn abort_discards_pending() -> CResult<()> {
        let env = Environment::memory("t");
        let mut txn = env.begin_write()?;
        txn.set(b"a", vec![1]);
        txn.abort();

        let read = env.begin_read()?;
        assert_eq!(read.get(b"a"), None);
        Ok(())
    }

    #[test]
    fn drop_without_commit_discards_pending() -> CResult<()> {
        let env = Environment::memory("t");
        {
            let mut txn = env.begin_write()?;
            txn.set(b"a", vec![1]);
        }
        assert_eq!(env.begin_read()?.get(b"a"), None);
        // The writer slot is released as well.
        assert!(env.begin_write().is_ok());
        Ok(())
    }

    #[test]
    fn write_txn_reads_through_pending() -> CResult<()> {
        let env = Environment::memory("t");
        let mut txn = env.begin_write()?;
        txn.set(b"a", vec![1]);
        txn.commit()?;

        let mut txn = env.begin_write()?;
        assert_eq!(txn.get(b"a")?, Some(vec![1]));
        txn.delete(b"a");
        assert_eq!(txn.get(b"a")?, None);
        txn.set(b"b", vec![2]);
        assert_eq!(txn.get(b"b")?, Some(vec![2]));
        txn.abort();
        Ok(())
    }

    #[test]
    fn registry_shares_environments_per_path() -> CResult<()> {
        let dir = tempdir::TempDir::new("hangar")?;
        let registry = EnvRegistry::new();
        let a = registry.open("branch", dir.path(), true)?;
        let b = registry.open("branch", dir.path(), true)?;
        // Same underlying engine: a writer in one blocks a writer in the other.
        let txn = a.begin_write()?;
        assert!(matches!(b.begin_write(), Err(Error::TxnError(_))));
        txn.abort();
        Ok(())
    }
}
