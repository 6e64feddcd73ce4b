//! `hangar` is a git-like version control core for numeric tensor datasets
//! and metadata, built atop an embedded ordered key-value store. Dataset
//! contents are content-addressed blobs held by a pluggable backend; the core
//! versions the *records* which reference them: arrayset schemas, sample
//! references, and metadata labels, serialized into ordered byte key/value
//! entries whose lexicographic ordering drives diff and merge.
//!
//! ## Getting started
//!
//! ```no_run
//! use hangar::error::CResult;
//! use hangar::records::DType;
//! use hangar::repository::Repository;
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> CResult<()> {
//!     let repo = Repository::init("/tmp/demo", "tester", "foo@test.bar")?;
//!
//!     let mut co = repo.checkout_writer("master")?;
//!     let datasets = co.datasets()?;
//!     datasets.init_arrayset("aset", &[5, 7], DType::F64)?;
//!     let commit = co.commit("first commit")?;
//!     co.close()?;
//!
//!     let mut reader = repo.checkout_reader_branch("master")?;
//!     assert_eq!(reader.commit_hash()?, commit);
//!     reader.close()?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod branches;
pub mod checkout;
pub mod commits;
pub mod dataset;
pub mod diff;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod records;
pub mod repository;
pub mod staging;
pub mod storage;
