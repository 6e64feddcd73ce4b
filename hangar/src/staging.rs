//! The staging area: the writable record environment tracking uncommitted
//! changes relative to the staging branch's head commit, plus the side
//! stores cleaned up on commit and reset.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::BlobBackend;
use crate::branches::BranchStore;
use crate::commits::CommitStore;
use crate::error::CResult;
use crate::storage::env::Environment;

/// Whether the staged record stream differs from its base commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageStatus {
    Clean,
    Dirty,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Clean => write!(f, "CLEAN"),
            StageStatus::Dirty => write!(f, "DIRTY"),
        }
    }
}

/// Owns the writable stage environment and the staged-blob bookkeeping.
pub struct StagingArea {
    stage: Environment,
    /// Content hashes ingested since the last commit, mapped to their blob
    /// locations. Cleared on commit, rolled back out of the hash env on
    /// reset.
    stage_hash: Environment,
    /// Content hash to blob location, for all committed and staged blobs.
    hash: Environment,
    commits: Arc<CommitStore>,
    branches: Arc<BranchStore>,
    /// In-process blob scratch directory, purged on reset.
    stage_data_dir: PathBuf,
}

impl StagingArea {
    pub fn new(
        stage: Environment,
        stage_hash: Environment,
        hash: Environment,
        commits: Arc<CommitStore>,
        branches: Arc<BranchStore>,
        stage_data_dir: &Path,
    ) -> Self {
        Self {
            stage,
            stage_hash,
            hash,
            commits,
            branches,
            stage_data_dir: stage_data_dir.to_path_buf(),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.stage
    }

    pub fn stage_hash_env(&self) -> &Environment {
        &self.stage_hash
    }

    pub fn hash_env(&self) -> &Environment {
        &self.hash
    }

    /// Head commit of the branch the staging area is based on.
    pub fn base_head(&self) -> CResult<String> {
        let branch = self.branches.get_staging_branch()?;
        self.branches.get_head(&branch)
    }

    /// Clears the stage environment and streams the given commit's record
    /// set into it. Afterwards the staging area is byte-identical to the
    /// commit, i.e. CLEAN against it.
    pub fn initialize_from_commit(&self, hash: &str) -> CResult<()> {
        let records = self.commits.get_records(hash)?;
        self.replace_records(records)?;
        log::debug!("staging area initialized from commit {:?}", hash);
        Ok(())
    }

    /// Atomically replaces the whole staged record stream.
    pub fn replace_records(&self, records: Vec<(Vec<u8>, Vec<u8>)>) -> CResult<()> {
        let current = self.stage.begin_read()?.records();
        let mut txn = self.stage.begin_write()?;
        for (key, _) in current {
            txn.delete(&key);
        }
        for (key, value) in records {
            txn.set(&key, value);
        }
        txn.commit()
    }

    /// Compares the staged record stream to the parent commit's records in
    /// sorted order: CLEAN iff byte-equal.
    pub fn status(&self) -> CResult<StageStatus> {
        let base = self.commits.get_records(&self.base_head()?)?;
        let staged = self.stage.begin_read()?.records();
        if base == staged {
            Ok(StageStatus::Clean)
        } else {
            Ok(StageStatus::Dirty)
        }
    }

    /// Drops the staged-blob side records after a successful commit. The
    /// hash env keeps its entries: those blobs are now referenced by
    /// history.
    pub fn clear_stage_hash(&self) -> CResult<()> {
        let staged = self.stage_hash.begin_read()?.records();
        let mut txn = self.stage_hash.begin_write()?;
        for (key, _) in staged {
            txn.delete(&key);
        }
        txn.commit()
    }

    /// Hard reset to the staging branch's head commit. Un-registers every
    /// blob ingested since that commit, purges the in-process blob scratch,
    /// and re-initializes the record env. Returns the head commit hash.
    pub fn hard_reset(&self, backend: &dyn BlobBackend) -> CResult<String> {
        // Blobs staged since the base commit are unreachable after the
        // reset; drop their hash registrations before clearing the tracker.
        let staged = self.stage_hash.begin_read()?.records();
        let mut txn = self.hash.begin_write()?;
        for (key, _) in &staged {
            txn.delete(key);
        }
        txn.commit()?;
        self.clear_stage_hash()?;

        backend.purge_staged()?;
        if self.stage_data_dir.exists() {
            std::fs::remove_dir_all(&self.stage_data_dir)?;
            std::fs::create_dir_all(&self.stage_data_dir)?;
        }

        let head = self.base_head()?;
        self.initialize_from_commit(&head)?;
        log::info!("hard reset completed, staging area head commit: {:?}", head);
        Ok(head)
    }
}
