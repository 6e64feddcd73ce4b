use std::fmt;

use crate::diff::Conflicts;

/// Result alias used throughout the crate.
pub type CResult<T> = std::result::Result<T, Error>;

/// Repository error taxonomy. Every variant carries a machine-readable kind
/// (see [`Error::kind`]) plus enough context to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A commit hash which does not exist in the ref store.
    UnknownCommit(String),

    /// A branch name with no head record.
    UnknownBranch(String),

    /// A user-supplied name which fails validation (empty, reserved
    /// separator characters, or whitespace).
    InvalidName(String),

    /// A sample whose dtype, shape, or payload size does not satisfy its
    /// arrayset schema.
    SchemaViolation(String),

    /// Commit requested with a clean staging area.
    EmptyCommit,

    /// Staging reset requested with a clean staging area.
    NoResetNeeded,

    /// The operation requires a clean staging area.
    DirtyStaging(String),

    /// Writer checkout of a branch while uncommitted changes exist on
    /// another branch's staging area.
    DirtyBranchSwitch { staged: String, requested: String },

    /// Operation on a checkout which has already been closed.
    SessionClosed,

    /// Operation through a handle whose owning session has been closed,
    /// reset, or rebuilt by a merge.
    InvalidHandle,

    /// The persisted writer lock is held by another writer.
    LockHeld,

    /// The persisted writer lock value does not match the releasing token.
    LockMismatch,

    /// Divergent branches touched the same records; carries the full
    /// conflict classification.
    MergeConflict(Conflicts),

    /// Merge of two identical heads.
    NoOpMerge,

    /// Environment open or I/O failure.
    EnvError(String),

    /// Transaction failure, e.g. a concurrent writer in the environment.
    TxnError(String),

    /// A record or commit which failed to decode.
    CorruptRecord(String),

    /// The on-disk repository format is not readable by this build.
    UnsupportedRepositoryVersion(String),
}

impl Error {
    /// Stable machine-readable tag for the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownCommit(_) => "unknown_commit",
            Error::UnknownBranch(_) => "unknown_branch",
            Error::InvalidName(_) => "invalid_name",
            Error::SchemaViolation(_) => "schema_violation",
            Error::EmptyCommit => "empty_commit",
            Error::NoResetNeeded => "no_reset_needed",
            Error::DirtyStaging(_) => "dirty_staging",
            Error::DirtyBranchSwitch { .. } => "dirty_branch_switch",
            Error::SessionClosed => "session_closed",
            Error::InvalidHandle => "invalid_handle",
            Error::LockHeld => "lock_held",
            Error::LockMismatch => "lock_mismatch",
            Error::MergeConflict(_) => "merge_conflict",
            Error::NoOpMerge => "no_op_merge",
            Error::EnvError(_) => "env_error",
            Error::TxnError(_) => "txn_error",
            Error::CorruptRecord(_) => "corrupt_record",
            Error::UnsupportedRepositoryVersion(_) => "unsupported_repository_version",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownCommit(hash) => write!(f, "commit does not exist: {}", hash),
            Error::UnknownBranch(name) => write!(f, "branch does not exist: {}", name),
            Error::InvalidName(name) => write!(f, "invalid name: {:?}", name),
            Error::SchemaViolation(msg) => write!(f, "schema violation: {}", msg),
            Error::EmptyCommit => write!(f, "no changes made in staging area, cannot commit"),
            Error::NoResetNeeded => write!(f, "no changes made in staging area, no reset necessary"),
            Error::DirtyStaging(branch) => {
                write!(f, "staging area has uncommitted changes on branch: {}", branch)
            }
            Error::DirtyBranchSwitch { staged, requested } => write!(
                f,
                "unable to check out branch: {} for writing, staging area has \
                 uncommitted changes on branch: {}",
                requested, staged
            ),
            Error::SessionClosed => {
                write!(f, "unable to operate on a checkout which has been closed")
            }
            Error::InvalidHandle => {
                write!(f, "handle invalidated by close, reset, or merge of its checkout")
            }
            Error::LockHeld => write!(f, "writer lock is held by another writer"),
            Error::LockMismatch => {
                write!(f, "writer lock value does not match the provided token")
            }
            Error::MergeConflict(conflicts) => {
                write!(f, "merge conflicts found: {}", conflicts.summary())
            }
            Error::NoOpMerge => write!(f, "branch heads are identical, nothing to merge"),
            Error::EnvError(msg) => write!(f, "environment failure: {}", msg),
            Error::TxnError(msg) => write!(f, "transaction failure: {}", msg),
            Error::CorruptRecord(msg) => write!(f, "corrupt record: {}", msg),
            Error::UnsupportedRepositoryVersion(v) => {
                write!(f, "repository format version {} is not supported", v)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::EnvError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::CorruptRecord(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::CorruptRecord(err.to_string())
    }
}
