//! Arrayset views over a record environment: named collections of
//! same-schema tensor samples, each sample a content hash plus shape.
//!
//! Readers operate over a materialized commit env; writers operate over the
//! staging env and keep the count sentinels and blob side-stores in step
//! with every mutation. All views carry a handle token and fail with
//! `InvalidHandle` once their checkout is closed, reset, or rebuilt.

use std::sync::Arc;

use crate::backend::BlobBackend;
use crate::checkout::HandleToken;
use crate::error::{CResult, Error};
use crate::records::{
    decode_count, encode_count, validate_name, DType, RecordKey, SampleSpec, SchemaSpec,
};
use crate::storage::env::Environment;

/// Arraysets may not exceed this rank.
const MAX_RANK: usize = 31;

fn load_schema(env: &Environment, aset: &str) -> CResult<SchemaSpec> {
    let key = RecordKey::Schema { aset: aset.to_string() }.encode();
    match env.begin_read()?.get(&key) {
        Some(value) => SchemaSpec::decode(&value),
        None => Err(Error::InvalidName(format!("unknown arrayset: {}", aset))),
    }
}

fn list_asets(env: &Environment) -> CResult<Vec<String>> {
    let read = env.begin_read()?;
    let mut names = Vec::new();
    for (key, _) in read.snapshot().scan_prefix(b"s:") {
        if let RecordKey::Schema { aset } = RecordKey::decode(key)? {
            names.push(aset);
        }
    }
    Ok(names)
}

fn list_samples(env: &Environment, aset: &str) -> CResult<Vec<String>> {
    let prefix = format!("a:{}:", aset).into_bytes();
    let read = env.begin_read()?;
    let mut names = Vec::new();
    for (key, _) in read.snapshot().scan_prefix(&prefix) {
        if let RecordKey::Sample { sample, .. } = RecordKey::decode(key)? {
            names.push(sample);
        }
    }
    Ok(names)
}

fn sample_spec(env: &Environment, aset: &str, sample: &str) -> CResult<SampleSpec> {
    let key =
        RecordKey::Sample { aset: aset.to_string(), sample: sample.to_string() }.encode();
    match env.begin_read()?.get(&key) {
        Some(value) => SampleSpec::decode(&value),
        None => Err(Error::InvalidName(format!("unknown sample: {}/{}", aset, sample))),
    }
}

// ---------------------------------------------------------------------------
// Read-only views

/// Collection view over the arraysets of one record environment.
pub struct DatasetReader {
    env: Environment,
    backend: Arc<dyn BlobBackend>,
    token: HandleToken,
}

impl DatasetReader {
    pub(crate) fn new(
        env: Environment,
        backend: Arc<dyn BlobBackend>,
        token: HandleToken,
    ) -> Self {
        Self { env, backend, token }
    }

    pub fn list(&self) -> CResult<Vec<String>> {
        self.token.check()?;
        list_asets(&self.env)
    }

    pub fn len(&self) -> CResult<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.list()?.is_empty())
    }

    pub fn contains(&self, name: &str) -> CResult<bool> {
        Ok(self.list()?.iter().any(|aset| aset == name))
    }

    pub fn get(&self, name: &str) -> CResult<ArraysetReader> {
        self.token.check()?;
        let schema = load_schema(&self.env, name)?;
        Ok(ArraysetReader {
            env: self.env.clone(),
            backend: self.backend.clone(),
            token: self.token.clone(),
            aset: name.to_string(),
            schema,
        })
    }
}

/// Read-only view of one arrayset.
pub struct ArraysetReader {
    env: Environment,
    backend: Arc<dyn BlobBackend>,
    token: HandleToken,
    aset: String,
    schema: SchemaSpec,
}

impl ArraysetReader {
    pub fn name(&self) -> &str {
        &self.aset
    }

    pub fn schema(&self) -> &SchemaSpec {
        &self.schema
    }

    pub fn shape(&self) -> &[u64] {
        &self.schema.shape
    }

    pub fn dtype(&self) -> DType {
        self.schema.dtype
    }

    pub fn list(&self) -> CResult<Vec<String>> {
        self.token.check()?;
        list_samples(&self.env, &self.aset)
    }

    pub fn len(&self) -> CResult<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.list()?.is_empty())
    }

    pub fn contains(&self, sample: &str) -> CResult<bool> {
        Ok(self.list()?.iter().any(|name| name == sample))
    }

    /// The content hash and shape referenced by a sample.
    pub fn sample_spec(&self, sample: &str) -> CResult<SampleSpec> {
        self.token.check()?;
        sample_spec(&self.env, &self.aset, sample)
    }

    /// Resolves a sample's payload bytes through the blob backend.
    pub fn get(&self, sample: &str) -> CResult<Vec<u8>> {
        let spec = self.sample_spec(sample)?;
        self.backend.get(&spec.hash)
    }
}

// ---------------------------------------------------------------------------
// Write-enabled views

/// Collection view over the arraysets of the staging area.
pub struct DatasetWriter {
    stage: Environment,
    stage_hash: Environment,
    hash: Environment,
    backend: Arc<dyn BlobBackend>,
    token: HandleToken,
}

impl DatasetWriter {
    pub(crate) fn new(
        stage: Environment,
        stage_hash: Environment,
        hash: Environment,
        backend: Arc<dyn BlobBackend>,
        token: HandleToken,
    ) -> Self {
        Self { stage, stage_hash, hash, backend, token }
    }

    pub fn list(&self) -> CResult<Vec<String>> {
        self.token.check()?;
        list_asets(&self.stage)
    }

    pub fn len(&self) -> CResult<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.list()?.is_empty())
    }

    pub fn contains(&self, name: &str) -> CResult<bool> {
        Ok(self.list()?.iter().any(|aset| aset == name))
    }

    /// Creates an arrayset with a fixed sample shape.
    pub fn init_arrayset(
        &self,
        name: &str,
        shape: &[u64],
        dtype: DType,
    ) -> CResult<ArraysetWriter> {
        self.init(name, shape, dtype, false)
    }

    /// Creates an arrayset whose shape is a per-dimension upper bound.
    pub fn init_arrayset_variable(
        &self,
        name: &str,
        max_shape: &[u64],
        dtype: DType,
    ) -> CResult<ArraysetWriter> {
        self.init(name, max_shape, dtype, true)
    }

    fn init(
        &self,
        name: &str,
        shape: &[u64],
        dtype: DType,
        variable: bool,
    ) -> CResult<ArraysetWriter> {
        self.token.check()?;
        validate_name(name)?;
        if shape.is_empty() || shape.len() > MAX_RANK || shape.contains(&0) {
            return Err(Error::InvalidName(format!(
                "arrayset shape must have 1..={} non-zero dimensions, got {:?}",
                MAX_RANK, shape
            )));
        }

        let schema = SchemaSpec {
            dtype,
            variable,
            shape: shape.to_vec(),
            backend: "00".to_string(),
        };
        let schema_key = RecordKey::Schema { aset: name.to_string() }.encode();
        let count_key = RecordKey::SchemaCount.encode();

        let mut txn = self.stage.begin_write()?;
        if txn.get(&schema_key)?.is_some() {
            return Err(Error::InvalidName(format!("arrayset already exists: {}", name)));
        }
        let count = match txn.get(&count_key)? {
            Some(value) => decode_count(&value)?,
            None => 0,
        };
        txn.set(&schema_key, schema.encode());
        txn.set(&count_key, encode_count(count + 1));
        txn.commit()?;
        log::debug!("initialized arrayset {:?} with schema {:?}", name, schema);

        self.get(name)
    }

    /// Drops an arrayset: its schema, every sample record, and its count
    /// sentinel.
    pub fn remove_arrayset(&self, name: &str) -> CResult<()> {
        self.token.check()?;
        let schema_key = RecordKey::Schema { aset: name.to_string() }.encode();
        let samples = list_samples(&self.stage, name)?;

        let mut txn = self.stage.begin_write()?;
        if txn.get(&schema_key)?.is_none() {
            return Err(Error::InvalidName(format!("unknown arrayset: {}", name)));
        }
        txn.delete(&schema_key);
        for sample in samples {
            txn.delete(&RecordKey::Sample { aset: name.to_string(), sample }.encode());
        }
        txn.delete(&RecordKey::SampleCount { aset: name.to_string() }.encode());

        let count_key = RecordKey::SchemaCount.encode();
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

    pub fn get(&self, name: &str) -> CResult<ArraysetWriter> {
        self.token.check()?;
        let schema = load_schema(&self.stage, name)?;
        Ok(ArraysetWriter {
            stage: self.stage.clone(),
            stage_hash: self.stage_hash.clone(),
            hash: self.hash.clone(),
            backend: self.backend.clone(),
            token: self.token.clone(),
            aset: name.to_string(),
            schema,
        })
    }
}

/// Write-enabled view of one arrayset in the staging area.
pub struct ArraysetWriter {
    stage: Environment,
    stage_hash: Environment,
    hash: Environment,
    backend: Arc<dyn BlobBackend>,
    token: HandleToken,
    aset: String,
    schema: SchemaSpec,
}

impl ArraysetWriter {
    pub fn name(&self) -> &str {
        &self.aset
    }

    pub fn schema(&self) -> &SchemaSpec {
        &self.schema
    }

    pub fn list(&self) -> CResult<Vec<String>> {
        self.token.check()?;
        list_samples(&self.stage, &self.aset)
    }

    pub fn len(&self) -> CResult<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.list()?.is_empty())
    }

    pub fn contains(&self, sample: &str) -> CResult<bool> {
        Ok(self.list()?.iter().any(|name| name == sample))
    }

    pub fn sample_spec(&self, sample: &str) -> CResult<SampleSpec> {
        self.token.check()?;
        sample_spec(&self.stage, &self.aset, sample)
    }

    pub fn get(&self, sample: &str) -> CResult<Vec<u8>> {
        let spec = self.sample_spec(sample)?;
        self.backend.get(&spec.hash)
    }

    /// Stages a sample: the backend digests and stores the payload, the
    /// record references the resulting hash. The shape must satisfy the
    /// schema bound and the payload length must match it exactly. Returns
    /// the content hash.
    pub fn put(&self, sample: &str, data: &[u8], shape: &[u64]) -> CResult<String> {
        self.token.check()?;
        validate_name(sample)?;
        if !self.schema.bounds(shape) {
            return Err(Error::SchemaViolation(format!(
                "shape {:?} violates schema bound {:?} of arrayset {:?}",
                shape, self.schema.shape, self.aset
            )));
        }
        if data.len() as u64 != self.schema.payload_size(shape) {
            return Err(Error::SchemaViolation(format!(
                "payload of {} bytes does not match shape {:?} of dtype {}",
                data.len(),
                shape,
                self.schema.dtype
            )));
        }

        let digest = self.backend.digest(data);
        let loc = self.backend.put(&digest, data)?;

        // Register the blob location, and track it as staged so a reset can
        // roll the registration back. A hash already known to the repository
        // is referenced by history and must not be tracked for rollback.
        let mut txn = self.hash.begin_write()?;
        if txn.get(digest.as_bytes())?.is_none() {
            txn.set(digest.as_bytes(), loc.as_bytes().to_vec());
            txn.commit()?;
            let mut txn = self.stage_hash.begin_write()?;
            txn.set(digest.as_bytes(), loc.as_bytes().to_vec());
            txn.commit()?;
        } else {
            txn.abort();
        }

        let record_key =
            RecordKey::Sample { aset: self.aset.clone(), sample: sample.to_string() }.encode();
        let count_key = RecordKey::SampleCount { aset: self.aset.clone() }.encode();
        let spec = SampleSpec { hash: digest.clone(), shape: shape.to_vec() };

        let mut txn = self.stage.begin_write()?;
        let fresh = txn.get(&record_key)?.is_none();
        txn.set(&record_key, spec.encode());
        if fresh {
            let count = match txn.get(&count_key)? {
                Some(value) => decode_count(&value)?,
                None => 0,
            };
            txn.set(&count_key, encode_count(count + 1));
        }
        txn.commit()?;
        Ok(digest)
    }

    /// Removes a sample record from staging. The blob itself stays in the
    /// backend; committed history may still reference it.
    pub fn delete(&self, sample: &str) -> CResult<()> {
        self.token.check()?;
        let record_key =
            RecordKey::Sample { aset: self.aset.clone(), sample: sample.to_string() }.encode();
        let count_key = RecordKey::SampleCount { aset: self.aset.clone() }.encode();

        let mut txn = self.stage.begin_write()?;
        if txn.get(&record_key)?.is_none() {
            return Err(Error::InvalidName(format!(
                "unknown sample: {}/{}",
                self.aset, sample
            )));
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
