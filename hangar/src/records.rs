//! Record families and their byte codec.
//!
//! Every piece of repository state is one of three record families, stored
//! as ordered byte key/value entries:
//!
//! - `s:<asetName>` -- arrayset schema (dtype, shape, variable flag, backend)
//! - `a:<asetName>:<sampleKey>` -- sample reference (content hash + shape)
//! - `l:<labelKey>` -- metadata label reference (content hash)
//!
//! Keys are ASCII and order-preserving: lexicographic byte order equals the
//! natural order of names, and all entries of one arrayset are contiguous.
//! Count sentinel keys end in `:` and summarize family cardinality; they are
//! skipped by the diff cursor walk.
//!
//! Values are pipe-separated fields in a fixed order per family. Encoding is
//! total and deterministic; decoding is its left inverse and rejects unknown
//! family tags, truncated values, and trailing garbage with `CorruptRecord`.

use std::fmt;

use crate::error::{CResult, Error};

/// Tensor element types. Widths validate sample payload sizes against the
/// schema shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Width of one element in bytes.
    pub fn width(&self) -> u64 {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u8" => Ok(DType::U8),
            "u16" => Ok(DType::U16),
            "u32" => Ok(DType::U32),
            "u64" => Ok(DType::U64),
            "i8" => Ok(DType::I8),
            "i16" => Ok(DType::I16),
            "i32" => Ok(DType::I32),
            "i64" => Ok(DType::I64),
            "f32" => Ok(DType::F32),
            "f64" => Ok(DType::F64),
            other => Err(Error::CorruptRecord(format!("unknown dtype: {:?}", other))),
        }
    }
}

/// Validates a user-chosen name (arrayset, sample, label, branch). Names are
/// restricted to ASCII alphanumerics plus `.`, `-`, `_` so they can never
/// collide with the key and value separators.
pub fn validate_name(name: &str) -> CResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::InvalidName(name.to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// True for count sentinel keys, which diff ignores.
pub fn is_count_key(key: &[u8]) -> bool {
    key.last() == Some(&b':')
}

/// A decoded record key from any family.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    /// `s:<aset>` -- schema of an arrayset.
    Schema { aset: String },
    /// `a:<aset>:<sample>` -- one sample reference.
    Sample { aset: String, sample: String },
    /// `l:<key>` -- one metadata label reference.
    Label { key: String },
    /// `s:` -- number of arraysets staged/committed.
    SchemaCount,
    /// `a:<aset>:` -- number of samples in one arrayset.
    SampleCount { aset: String },
    /// `l:` -- number of metadata labels.
    LabelCount,
}

impl RecordKey {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RecordKey::Schema { aset } => format!("s:{}", aset).into_bytes(),
            RecordKey::Sample { aset, sample } => format!("a:{}:{}", aset, sample).into_bytes(),
            RecordKey::Label { key } => format!("l:{}", key).into_bytes(),
            RecordKey::SchemaCount => b"s:".to_vec(),
            RecordKey::SampleCount { aset } => format!("a:{}:", aset).into_bytes(),
            RecordKey::LabelCount => b"l:".to_vec(),
        }
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::CorruptRecord(format!("non-utf8 record key: {:?}", bytes)))?;
        let (family, rest) = text
            .split_once(':')
            .ok_or_else(|| Error::CorruptRecord(format!("untagged record key: {:?}", text)))?;
        match family {
            "s" => {
                if rest.is_empty() {
                    Ok(RecordKey::SchemaCount)
                } else {
                    Ok(RecordKey::Schema { aset: rest.to_string() })
                }
            }
            "a" => {
                let (aset, sample) = rest.split_once(':').ok_or_else(|| {
                    Error::CorruptRecord(format!("sample key missing name: {:?}", text))
                })?;
                if aset.is_empty() {
                    return Err(Error::CorruptRecord(format!("empty arrayset name: {:?}", text)));
                }
                if sample.is_empty() {
                    Ok(RecordKey::SampleCount { aset: aset.to_string() })
                } else {
                    Ok(RecordKey::Sample { aset: aset.to_string(), sample: sample.to_string() })
                }
            }
            "l" => {
                if rest.is_empty() {
                    Ok(RecordKey::LabelCount)
                } else {
                    Ok(RecordKey::Label { key: rest.to_string() })
                }
            }
            other => Err(Error::CorruptRecord(format!("unknown record family: {:?}", other))),
        }
    }
}

/// Schema record value: `dtype|variable|shape|backend`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaSpec {
    pub dtype: DType,
    /// When set, the shape is a per-dimension upper bound instead of an
    /// exact requirement.
    pub variable: bool,
    pub shape: Vec<u64>,
    /// Hint naming the blob backend which stores this arrayset's payloads.
    pub backend: String,
}

impl SchemaSpec {
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}",
            self.dtype,
            self.variable,
            encode_shape(&self.shape),
            self.backend
        )
        .into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        let fields = split_fields(bytes, 4)?;
        Ok(Self {
            dtype: fields[0].parse()?,
            variable: parse_bool(fields[1])?,
            shape: decode_shape(fields[2])?,
            backend: parse_token(fields[3], "backend")?,
        })
    }

    /// Whether a sample of the given shape satisfies this schema: exact
    /// match for fixed schemas, equal rank with per-dimension `<=` for
    /// variable ones.
    pub fn bounds(&self, shape: &[u64]) -> bool {
        if self.variable {
            shape.len() == self.shape.len()
                && shape.iter().zip(self.shape.iter()).all(|(dim, max)| dim <= max)
        } else {
            shape == self.shape.as_slice()
        }
    }

    /// Exact payload size in bytes for a sample of the given shape.
    pub fn payload_size(&self, shape: &[u64]) -> u64 {
        shape.iter().product::<u64>() * self.dtype.width()
    }
}

/// Sample record value: `hash|shape`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleSpec {
    pub hash: String,
    pub shape: Vec<u64>,
}

impl SampleSpec {
    pub fn encode(&self) -> Vec<u8> {
        format!("{}|{}", self.hash, encode_shape(&self.shape)).into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        let fields = split_fields(bytes, 2)?;
        Ok(Self { hash: parse_hash(fields[0])?, shape: decode_shape(fields[1])? })
    }
}

/// Label record value: `hash`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSpec {
    pub hash: String,
}

impl LabelSpec {
    pub fn encode(&self) -> Vec<u8> {
        self.hash.clone().into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        let fields = split_fields(bytes, 1)?;
        Ok(Self { hash: parse_hash(fields[0])? })
    }
}

/// Count sentinel value: an ASCII decimal.
pub fn encode_count(count: u64) -> Vec<u8> {
    count.to_string().into_bytes()
}

pub fn decode_count(bytes: &[u8]) -> CResult<u64> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::CorruptRecord("non-utf8 count value".to_string()))?;
    text.parse::<u64>()
        .map_err(|_| Error::CorruptRecord(format!("bad count value: {:?}", text)))
}

/// Rebuilds every count sentinel from a member record stream (count keys in
/// the input are discarded). Sentinels are present exactly when their count
/// is non-zero, so identical member sets always produce identical streams.
pub fn with_rebuilt_counts(records: &[(Vec<u8>, Vec<u8>)]) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = std::collections::BTreeMap::new();
    let mut schemas = 0u64;
    let mut labels = 0u64;
    let mut samples = std::collections::BTreeMap::new();

    for (key, value) in records {
        if is_count_key(key) {
            continue;
        }
        match RecordKey::decode(key)? {
            RecordKey::Schema { .. } => schemas += 1,
            RecordKey::Label { .. } => labels += 1,
            RecordKey::Sample { aset, .. } => *samples.entry(aset).or_insert(0u64) += 1,
            RecordKey::SchemaCount | RecordKey::SampleCount { .. } | RecordKey::LabelCount => {}
        }
        out.insert(key.clone(), value.clone());
    }

    if schemas > 0 {
        out.insert(RecordKey::SchemaCount.encode(), encode_count(schemas));
    }
    if labels > 0 {
        out.insert(RecordKey::LabelCount.encode(), encode_count(labels));
    }
    for (aset, count) in samples {
        out.insert(RecordKey::SampleCount { aset }.encode(), encode_count(count));
    }
    Ok(out.into_iter().collect())
}

fn encode_shape(shape: &[u64]) -> String {
    shape.iter().map(|dim| dim.to_string()).collect::<Vec<_>>().join(" ")
}

fn decode_shape(field: &str) -> CResult<Vec<u64>> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(' ')
        .map(|dim| {
            dim.parse::<u64>()
                .map_err(|_| Error::CorruptRecord(format!("bad shape dimension: {:?}", dim)))
        })
        .collect()
}

/// Splits a value into exactly `count` pipe-separated fields. A wrong field
/// count means the value was truncated or grew trailing garbage.
fn split_fields(bytes: &[u8], count: usize) -> CResult<Vec<&str>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::CorruptRecord("non-utf8 record value".to_string()))?;
    let fields: Vec<&str> = text.split('|').collect();
    if fields.len() != count {
        return Err(Error::CorruptRecord(format!(
            "expected {} value fields, found {} in {:?}",
            count,
            fields.len(),
            text
        )));
    }
    Ok(fields)
}

fn parse_bool(field: &str) -> CResult<bool> {
    match field {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::CorruptRecord(format!("bad bool field: {:?}", other))),
    }
}

fn parse_hash(field: &str) -> CResult<String> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(Error::CorruptRecord(format!("bad content hash: {:?}", field)));
    }
    Ok(field.to_string())
}

fn parse_token(field: &str, what: &str) -> CResult<String> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::CorruptRecord(format!("bad {} field: {:?}", what, field)));
    }
    Ok(field.to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn schema() -> SchemaSpec {
        SchemaSpec {
            dtype: DType::F64,
            variable: false,
            shape: vec![5, 7],
            backend: "00".to_string(),
        }
    }

    #[test]
    fn key_roundtrip_all_families() -> CResult<()> {
        let keys = vec![
            RecordKey::Schema { aset: "aset".into() },
            RecordKey::Sample { aset: "aset".into(), sample: "k1".into() },
            RecordKey::Label { key: "note".into() },
            RecordKey::SchemaCount,
            RecordKey::SampleCount { aset: "aset".into() },
            RecordKey::LabelCount,
        ];
        for key in keys {
            assert_eq!(RecordKey::decode(&key.encode())?, key);
        }
        Ok(())
    }

    #[test]
    fn key_bytes_preserve_name_order() {
        let mut names = vec!["zeta", "alpha", "alpha2", "m.n", "m-n"];
        names.sort_unstable();

        let mut encoded: Vec<Vec<u8>> = names
            .iter()
            .map(|name| RecordKey::Schema { aset: (*name).into() }.encode())
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn arrayset_entries_are_contiguous() {
        // All sample keys of one arrayset fall between its count sentinel
        // and any other arrayset's records.
        let count = RecordKey::SampleCount { aset: "aa".into() }.encode();
        let s1 = RecordKey::Sample { aset: "aa".into(), sample: "k1".into() }.encode();
        let s2 = RecordKey::Sample { aset: "aa".into(), sample: "k2".into() }.encode();
        let other = RecordKey::Sample { aset: "ab".into(), sample: "a".into() }.encode();
        assert!(count < s1 && s1 < s2 && s2 < other);
    }

    #[test]
    fn unknown_family_rejected() {
        assert!(matches!(RecordKey::decode(b"x:foo"), Err(Error::CorruptRecord(_))));
        assert!(matches!(RecordKey::decode(b"nocolon"), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn schema_value_roundtrip() -> CResult<()> {
        let spec = schema();
        assert_eq!(spec.encode(), b"f64|false|5 7|00".to_vec());
        assert_eq!(SchemaSpec::decode(&spec.encode())?, spec);

        let variable = SchemaSpec { variable: true, ..schema() };
        assert_eq!(SchemaSpec::decode(&variable.encode())?, variable);
        Ok(())
    }

    #[test]
    fn sample_value_roundtrip() -> CResult<()> {
        let spec = SampleSpec { hash: "0123abcd".into(), shape: vec![5, 7] };
        assert_eq!(spec.encode(), b"0123abcd|5 7".to_vec());
        assert_eq!(SampleSpec::decode(&spec.encode())?, spec);
        Ok(())
    }

    #[test]
    fn label_value_roundtrip() -> CResult<()> {
        let spec = LabelSpec { hash: "deadbeef".into() };
        assert_eq!(LabelSpec::decode(&spec.encode())?, spec);
        Ok(())
    }

    #[test]
    fn truncated_and_padded_values_rejected() {
        // Dropped field.
        assert!(matches!(SchemaSpec::decode(b"f64|false|5 7"), Err(Error::CorruptRecord(_))));
        // Extra field.
        assert!(matches!(
            SchemaSpec::decode(b"f64|false|5 7|00|junk"),
            Err(Error::CorruptRecord(_))
        ));
        // Trailing garbage inside the last field.
        assert!(matches!(SchemaSpec::decode(b"f64|false|5 7|0 0"), Err(Error::CorruptRecord(_))));
        // Truncated hash charset.
        assert!(matches!(SampleSpec::decode(b"xyz|5 7"), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn count_sentinels_detected() {
        assert!(is_count_key(b"s:"));
        assert!(is_count_key(b"a:aset:"));
        assert!(is_count_key(b"l:"));
        assert!(!is_count_key(b"s:aset"));
        assert!(!is_count_key(b"a:aset:k1"));
    }

    #[test]
    fn shape_bounds() {
        let fixed = schema();
        assert!(fixed.bounds(&[5, 7]));
        assert!(!fixed.bounds(&[5, 6]));
        assert!(!fixed.bounds(&[5]));

        let variable = SchemaSpec { variable: true, ..schema() };
        assert!(variable.bounds(&[5, 7]));
        assert!(variable.bounds(&[1, 7]));
        assert!(!variable.bounds(&[6, 7]));
        assert!(!variable.bounds(&[5]));

        assert_eq!(fixed.payload_size(&[5, 7]), 5 * 7 * 8);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("aset").is_ok());
        assert!(validate_name("a.b-c_d2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("has:colon").is_err());
        assert!(validate_name("has|pipe").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }
}
