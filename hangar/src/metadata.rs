//! Metadata label views over a record environment.
//!
//! A label record (`l:<key>`) references the content hash of a text value;
//! the text itself lives in the content-addressed label environment, which
//! is append-only and shared by staging and all commits.

use sha2::{Digest, Sha256};

use crate::checkout::HandleToken;
use crate::error::{CResult, Error};
use crate::records::{decode_count, encode_count, validate_name, LabelSpec, RecordKey};
use crate::storage::env::Environment;

fn label_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn get_label(records: &Environment, label: &Environment, key: &str) -> CResult<String> {
    let record_key = RecordKey::Label { key: key.to_string() }.encode();
    let spec = match records.begin_read()?.get(&record_key) {
        Some(value) => LabelSpec::decode(&value)?,
        None => return Err(Error::InvalidName(format!("unknown metadata key: {}", key))),
    };
    match label.begin_read()?.get(spec.hash.as_bytes()) {
        Some(text) => Ok(String::from_utf8(text)?),
        None => Err(Error::CorruptRecord(format!(
            "label value missing for hash {} of key {:?}",
            spec.hash, key
        ))),
    }
}

fn list_labels(records: &Environment) -> CResult<Vec<String>> {
    let read = records.begin_read()?;
    let mut keys = Vec::new();
    for (record_key, _) in read.snapshot().scan_prefix(b"l:") {
        if let RecordKey::Label { key } = RecordKey::decode(record_key)? {
            keys.push(key);
        }
    }
    Ok(keys)
}

/// Read-only metadata view.
pub struct MetadataReader {
    records: Environment,
    label: Environment,
    token: HandleToken,
}

impl MetadataReader {
    pub(crate) fn new(records: Environment, label: Environment, token: HandleToken) -> Self {
        Self { records, label, token }
    }

    pub fn get(&self, key: &str) -> CResult<String> {
        self.token.check()?;
        get_label(&self.records, &self.label, key)
    }

    pub fn list(&self) -> CResult<Vec<String>> {
        self.token.check()?;
        list_labels(&self.records)
    }

    pub fn len(&self) -> CResult<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.list()?.is_empty())
    }

    pub fn contains(&self, key: &str) -> CResult<bool> {
        Ok(self.list()?.iter().any(|name| name == key))
    }
}

/// Write-enabled metadata view over the staging area.
pub struct MetadataWriter {
    stage: Environment,
    label: Environment,
    token: HandleToken,
}

impl MetadataWriter {
    pub(crate) fn new(stage: Environment, label: Environment, token: HandleToken) -> Self {
        Self { stage, label, token }
    }

    pub fn get(&self, key: &str) -> CResult<String> {
        self.token.check()?;
        get_label(&self.stage, &self.label, key)
    }

    pub fn list(&self) -> CResult<Vec<String>> {
        self.token.check()?;
        list_labels(&self.stage)
    }

    pub fn len(&self) -> CResult<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.list()?.is_empty())
    }

    pub fn contains(&self, key: &str) -> CResult<bool> {
        Ok(self.list()?.iter().any(|name| name == key))
    }

    /// Stages a label: persists the text content-addressed in the label
    /// store and records the reference. Returns the content hash.
    pub fn put(&self, key: &str, text: &str) -> CResult<String> {
        self.token.check()?;
        validate_name(key)?;
        let hash = label_hash(text);

        let mut txn = self.label.begin_write()?;
        txn.set(hash.as_bytes(), text.as_bytes().to_vec());
        txn.commit()?;

        let record_key = RecordKey::Label { key: key.to_string() }.encode();
        let count_key = RecordKey::LabelCount.encode();
        let mut txn = self.stage.begin_write()?;
        let fresh = txn.get(&record_key)?.is_none();
        txn.set(&record_key, LabelSpec { hash: hash.clone() }.encode());
        if fresh {
            let count = match txn.get(&count_key)? {
                Some(value) => decode_count(&value)?,
                None => 0,
            };
            txn.set(&count_key, encode_count(count + 1));
        }
        txn.commit()?;
        Ok(hash)
    }

    /// Removes a label reference from staging. The text stays in the label
    /// store; committed history may still reference it.
    pub fn delete(&self, key: &str) -> CResult<()> {
        self.token.check()?;
        let record_key = RecordKey::Label { key: key.to_string() }.encode();
        let count_key = RecordKey::LabelCount.encode();

        let mut txn = self.stage.begin_write()?;
        if txn.get(&record_key)?.is_none() {
            return Err(Error::InvalidName(format!("unknown metadata key: {}", key)));
        }
        txn.delete(&record_key);
        let count = match txn.get(&count_key)? {
            Some(value) => decode_count(&value)?,
            None => 0,
        };
        match count.saturating_sub(1) {
            0 => txn.delete(&count_key),
            remaining => txn.set(&count_key, encode_count(remaining)),
        }
        txn.commit()
    }
}
