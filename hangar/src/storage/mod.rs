pub mod env;
pub mod log;
pub mod log_cask;
pub mod memory;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// In-memory index mapping each live key to the position and length of its
/// value in the log file. A BTreeMap so that the record stream and
/// compaction can walk keys in lexicographic order.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// One ordered record keyspace. Keys and values are arbitrary byte strings
/// kept in lexicographic key order, which the record codec makes equal to
/// the natural order of arrayset, sample, and label names -- a family's
/// entries always come out of [`RecordEngine::stream`] contiguous. Writes
/// are only guaranteed durable after calling flush().
///
/// All methods take a mutable reference; serialized access can't be avoided
/// anyway, since every repository mutation funnels through a single writer.
pub trait RecordEngine: std::fmt::Display + Send + Sync {
    /// Gets the value recorded under a key, if any.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Records a value under a key, replacing the existing value if any.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    /// Removes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> CResult<()>;

    /// The full record stream as sorted `(key, value)` pairs: the shape the
    /// snapshot layer, the diff cursors, and the commit packer consume.
    fn stream(&mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> CResult<()>;

    /// Returns engine status.
    fn status(&mut self) -> CResult<Status>;
}

/// Point-in-time state of a record engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}
