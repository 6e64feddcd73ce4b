use std::path::PathBuf;

use crate::error::{CResult, Error};
use crate::storage::log::Log;
use crate::storage::{KeyDir, RecordEngine, Status};

/// A simple log-structured record keyspace.
///
/// LogCask writes key-value pairs to an append-only log file, and keeps a
/// mapping of keys to file positions in memory. All live keys must fit in
/// memory. Deletes write a tombstone value to the log file. To remove old
/// garbage, the log can be compacted by writing a new log containing only
/// live data, skipping replaced values and tombstones.
///
/// The structure of a log entry is:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes (max 2 GB).
/// - Value as raw bytes (max 2 GB).
pub struct LogCask {
    /// The active append-only log file.
    log: Log,

    /// Maps keys to a value position and length in the log file.
    keydir: KeyDir,
}

impl LogCask {
    /// Opens or creates a LogCask in the given file.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        let mut log = Log::new_with_lock(path, try_lock)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    pub fn get_path(&self) -> Option<&str> {
        self.log.path.to_str()
    }

    /// Compacts the current log file by writing out a new log file containing
    /// only live keys and replacing the current file with it.
    pub fn compact(&mut self) -> CResult<()> {
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");

        let (mut new_log, new_keydir) = self.write_log(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path).map_err(|err| {
            Error::EnvError(format!(
                "log compact rename from {:?} to {:?} failed: {}",
                new_log.path.to_str(),
                self.log.path.to_str(),
                err
            ))
        })?;
        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes out a new log file with the live entries of the current log
    /// file and returns it along with its keydir. Entries are written in key
    /// order.
    fn write_log(&mut self, path: PathBuf) -> CResult<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // truncate file if it exists
        for (key, (value_pos, value_len)) in self.keydir.iter() {
            let value = self.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(key, Some(&value))?;
            new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
        }
        Ok((new_log, new_keydir))
    }
}

impl std::fmt::Display for LogCask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "log cask")
    }
}

impl RecordEngine for LogCask {
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some((value_pos, value_len)) = self.keydir.get(key) {
            Ok(Some(self.log.read_value(*value_pos, *value_len)?))
        } else {
            Ok(None)
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some(&*value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.log.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    /// Walks the keydir in key order, reading each live value back from the
    /// log file.
    fn stream(&mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let Self { log, keydir } = self;
        let mut records = Vec::with_capacity(keydir.len());
        for (key, (value_pos, value_len)) in keydir.iter() {
            records.push((key.clone(), log.read_value(*value_pos, *value_len)?));
        }
        Ok(records)
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.log.file.sync_all()?)
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0, |size, (key, (_, value_len))| size + key.len() as u64 + *value_len as u64);
        let total_disk_size = self.log.file.metadata()?.len();
        let live_disk_size = size + 8 * keys; // account for length prefixes
        let garbage_disk_size = total_disk_size - live_disk_size;
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }
}

/// Attempt to flush the file when the LogCask is closed.
impl Drop for LogCask {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush file: {}", error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    super::super::tests::test_engine!({
        let path = tempdir::TempDir::new("hangar")?.path().join("records.db");
        LogCask::new(path)?
    });

    /// Writes values exercising replace, delete, and re-insert handling.
    fn setup_log(s: &mut LogCask) -> CResult<()> {
        s.set(b"b", vec![0x01])?;
        s.set(b"b", vec![0x02])?;

        s.set(b"e", vec![0x05])?;
        s.delete(b"e")?;

        s.set(b"c", vec![0x00])?;
        s.delete(b"c")?;
        s.set(b"c", vec![0x03])?;

        s.set(b"", vec![])?;
        s.set(b"a", vec![0x01])?;
        s.delete(b"f")?;
        s.delete(b"d")?;
        s.set(b"d", vec![0x04])?;

        assert_eq!(
            vec![
                (b"".to_vec(), vec![]),
                (b"a".to_vec(), vec![0x01]),
                (b"b".to_vec(), vec![0x02]),
                (b"c".to_vec(), vec![0x03]),
                (b"d".to_vec(), vec![0x04]),
            ],
            s.stream()?,
        );
        s.flush()?;

        Ok(())
    }

    #[test]
    /// Tests that writing and then reading a file yields the same results.
    fn reopen() -> CResult<()> {
        // NB: Don't drop the TempDir, the path would be removed.
        let dir = tempdir::TempDir::new("hangar")?;
        let path = dir.path().join("records.db");
        let mut s = LogCask::new(path.clone())?;
        setup_log(&mut s)?;

        let expect = s.stream()?;
        drop(s);
        let mut s = LogCask::new(path)?;
        assert_eq!(expect, s.stream()?);

        Ok(())
    }

    #[test]
    /// Tests that compaction removes all garbage while keeping live data.
    fn compact_removes_garbage() -> CResult<()> {
        let dir = tempdir::TempDir::new("hangar")?;
        let mut s = LogCask::new(dir.path().join("records.db"))?;
        setup_log(&mut s)?;

        let before = s.status()?;
        assert!(before.garbage_disk_size > 0);

        s.compact()?;
        let after = s.status()?;
        assert_eq!(after.keys, before.keys);
        assert_eq!(after.size, before.size);
        assert_eq!(after.garbage_disk_size, 0);
        assert_eq!(after.total_disk_size, after.live_disk_size);

        Ok(())
    }

    #[test]
    /// Tests that exclusive locks are taken out on log files, released when
    /// the cask is closed, and that an error is returned if a lock is
    /// already held.
    fn log_lock() -> CResult<()> {
        let dir = tempdir::TempDir::new("hangar")?;
        let path = dir.path().join("records.db");
        let s = LogCask::new(path.clone())?;

        assert!(LogCask::new(path.clone()).is_err());
        drop(s);
        assert!(LogCask::new(path.clone()).is_ok());

        Ok(())
    }

    #[test]
    /// Tests that an incomplete write at the end of the log file can be
    /// recovered by discarding the last entry.
    fn recovery() -> CResult<()> {
        // Create an initial log file with a few entries.
        let dir = tempdir::TempDir::new("hangar")?;
        let path = dir.path().join("complete");
        let truncpath = dir.path().join("truncated");

        let mut log = Log::new(path.clone())?;
        let mut ends = vec![];

        let (pos, len) = log.write_entry("deleted".as_bytes(), Some(&[1, 2, 3]))?;
        ends.push(pos + len as u64);
        let (pos, len) = log.write_entry("deleted".as_bytes(), None)?;
        ends.push(pos + len as u64);
        let (pos, len) = log.write_entry(&[], Some(&[]))?;
        ends.push(pos + len as u64);
        let (pos, len) = log.write_entry("key".as_bytes(), Some(&[1, 2, 3, 4, 5]))?;
        ends.push(pos + len as u64);
        drop(log);

        // Copy the file, and truncate it at each byte, then try to open it
        // and assert that we always retain a prefix of entries.
        let size = std::fs::metadata(&path)?.len();
        for pos in 0..=size {
            std::fs::copy(&path, &truncpath)?;
            let f = std::fs::OpenOptions::new().write(true).open(&truncpath)?;
            f.set_len(pos)?;
            drop(f);

            let mut expect = vec![];
            if pos >= ends[0] {
                expect.push((b"deleted".to_vec(), vec![1, 2, 3]))
            }
            if pos >= ends[1] {
                expect.pop(); // "deleted" key removed
            }
            if pos >= ends[2] {
                expect.push((b"".to_vec(), vec![]))
            }
            if pos >= ends[3] {
                expect.push((b"key".to_vec(), vec![1, 2, 3, 4, 5]))
            }

            let mut s = LogCask::new(truncpath.clone())?;
            assert_eq!(expect, s.stream()?);
        }

        Ok(())
    }
}
