//! Reader and writer checkout facades.
//!
//! A reader checkout pins one commit's record set; a writer checkout owns
//! the staging area of one branch under the repository-wide writer lock.
//! Every view handed out (`datasets`, `metadata`, `diff`) carries a
//! generation token checked against its owning session on each operation:
//! close, reset, and merge bump the generation, so stale handles
//! deterministically fail with `InvalidHandle` instead of observing freed
//! or rebuilt state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;

use crate::backend::BlobBackend;
use crate::branches::BranchStore;
use crate::commits::{CommitStore, EphemeralEnv, UNBORN};
use crate::dataset::{DatasetReader, DatasetWriter};
use crate::diff::{self, DiffAndConflicts};
use crate::error::{CResult, Error};
use crate::merge::select_merge_algorithm;
use crate::metadata::{MetadataReader, MetadataWriter};
use crate::staging::{StageStatus, StagingArea};
use crate::storage::env::Environment;

/// Monotone counter owned by a checkout; bumped whenever handed-out views
/// must become invalid.
pub(crate) struct Generation {
    counter: Arc<AtomicU64>,
}

impl Generation {
    fn new() -> Self {
        Self { counter: Arc::new(AtomicU64::new(0)) }
    }

    fn bump(&self) {
        self.counter.fetch_add(1, Ordering::AcqRel);
    }

    fn token(&self) -> HandleToken {
        HandleToken {
            counter: self.counter.clone(),
            expected: self.counter.load(Ordering::Acquire),
        }
    }
}

/// The validity witness carried by every handed-out view.
#[derive(Clone)]
pub struct HandleToken {
    counter: Arc<AtomicU64>,
    expected: u64,
}

impl HandleToken {
    pub(crate) fn check(&self) -> CResult<()> {
        if self.counter.load(Ordering::Acquire) == self.expected {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }
}

fn new_writer_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Takes the writer lock, retrying a transient `TxnError` (another branch
/// store transaction in flight) with bounded backoff. `LockHeld` is never
/// retried here; that decision belongs to the caller.
fn acquire_with_retry(branches: &BranchStore, token: &str) -> CResult<()> {
    let mut attempts = 0;
    loop {
        match branches.acquire_writer_lock(token) {
            Err(Error::TxnError(reason)) if attempts < 3 => {
                attempts += 1;
                log::debug!("writer lock acquire retry {}: {}", attempts, reason);
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Reader checkout

/// A read-only checkout of the repository as it existed at one commit.
pub struct ReaderCheckout {
    commits: Arc<CommitStore>,
    branches: Arc<BranchStore>,
    backend: Arc<dyn BlobBackend>,
    label: Environment,
    commit_hash: String,
    records_env: EphemeralEnv,
    generation: Generation,
    closed: bool,
}

impl ReaderCheckout {
    pub(crate) fn new(
        commits: Arc<CommitStore>,
        branches: Arc<BranchStore>,
        backend: Arc<dyn BlobBackend>,
        label: Environment,
        commit_hash: &str,
    ) -> CResult<Self> {
        if !commits.check_in_history(commit_hash)? {
            return Err(Error::UnknownCommit(commit_hash.to_string()));
        }
        let records_env = commits.materialize(commit_hash)?;
        Ok(Self {
            commits,
            branches,
            backend,
            label,
            commit_hash: commit_hash.to_string(),
            records_env,
            generation: Generation::new(),
            closed: false,
        })
    }

    fn ensure_open(&self) -> CResult<()> {
        if self.closed {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Commit hash this checkout's data is read from.
    pub fn commit_hash(&self) -> CResult<String> {
        self.ensure_open()?;
        Ok(self.commit_hash.clone())
    }

    pub fn datasets(&self) -> CResult<DatasetReader> {
        self.ensure_open()?;
        Ok(DatasetReader::new(
            self.records_env.env().clone(),
            self.backend.clone(),
            self.generation.token(),
        ))
    }

    pub fn metadata(&self) -> CResult<MetadataReader> {
        self.ensure_open()?;
        Ok(MetadataReader::new(
            self.records_env.env().clone(),
            self.label.clone(),
            self.generation.token(),
        ))
    }

    pub fn diff(&self) -> CResult<ReaderDiff> {
        self.ensure_open()?;
        Ok(ReaderDiff {
            commits: self.commits.clone(),
            branches: self.branches.clone(),
            commit_hash: self.commit_hash.clone(),
            token: self.generation.token(),
        })
    }

    /// Invalidates every handed-out view and drops the materialized record
    /// environment. Operating on a closed checkout fails with
    /// `SessionClosed`.
    pub fn close(&mut self) -> CResult<()> {
        self.ensure_open()?;
        self.generation.bump();
        self.closed = true;
        Ok(())
    }
}

/// Diff surface of a reader checkout: this checkout's commit as master.
pub struct ReaderDiff {
    commits: Arc<CommitStore>,
    branches: Arc<BranchStore>,
    commit_hash: String,
    token: HandleToken,
}

impl ReaderDiff {
    /// Diff against another commit.
    pub fn commit(&self, dev_commit: &str) -> CResult<DiffAndConflicts> {
        self.token.check()?;
        diff::commit_to_commit(&self.commits, &self.commit_hash, dev_commit)
    }

    /// Diff against another branch's head.
    pub fn branch(&self, dev_branch: &str) -> CResult<DiffAndConflicts> {
        self.token.check()?;
        let dev_head = self.branches.get_head(dev_branch)?;
        diff::commit_to_commit(&self.commits, &self.commit_hash, &dev_head)
    }
}

// ---------------------------------------------------------------------------
// Writer checkout

/// The write-enabled checkout: the single entry point for mutating the
/// repository. Holds the persisted writer lock from construction until
/// close (or merge failure), and bases the staging area on its branch head.
pub struct WriterCheckout {
    branches: Arc<BranchStore>,
    commits: Arc<CommitStore>,
    staging: Arc<StagingArea>,
    backend: Arc<dyn BlobBackend>,
    label: Environment,
    author: String,
    email: String,
    branch: String,
    writer_token: String,
    generation: Generation,
    closed: bool,
}

impl WriterCheckout {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        branches: Arc<BranchStore>,
        commits: Arc<CommitStore>,
        staging: Arc<StagingArea>,
        backend: Arc<dyn BlobBackend>,
        label: Environment,
        author: String,
        email: String,
        branch: &str,
    ) -> CResult<Self> {
        // Resolve before locking so an unknown branch does not take the lock.
        branches.get_head(branch)?;

        let writer_token = new_writer_token();
        acquire_with_retry(&branches, &writer_token)?;

        // The staging area may be based on some other branch. Re-pointing it
        // is only legal when it carries no uncommitted changes.
        let setup = || -> CResult<()> {
            let current = branches.get_staging_branch()?;
            if current != branch {
                if staging.status()? == StageStatus::Dirty {
                    return Err(Error::DirtyBranchSwitch {
                        staged: current,
                        requested: branch.to_string(),
                    });
                }
                branches.set_staging_branch(branch)?;
                let head = branches.get_head(branch)?;
                staging.initialize_from_commit(&head)?;
            }
            Ok(())
        };
        if let Err(err) = setup() {
            if let Err(release_err) = branches.release_writer_lock(&writer_token) {
                log::error!("failed to release writer lock on aborted checkout: {}", release_err);
            }
            return Err(err);
        }

        Ok(Self {
            branches,
            commits,
            staging,
            backend,
            label,
            author,
            email,
            branch: branch.to_string(),
            writer_token,
            generation: Generation::new(),
            closed: false,
        })
    }

    /// Confirms the session is open and still owns the persisted writer
    /// lock (re-acquiring with our token is a no-op when we do).
    fn verify_lock(&self) -> CResult<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        acquire_with_retry(&self.branches, &self.writer_token)
    }

    /// Branch this write-enabled checkout's staging area is based on.
    pub fn branch_name(&self) -> CResult<String> {
        self.verify_lock()?;
        Ok(self.branch.clone())
    }

    /// Head commit of the checkout branch.
    pub fn commit_hash(&self) -> CResult<String> {
        self.verify_lock()?;
        self.branches.get_head(&self.branch)
    }

    pub fn status(&self) -> CResult<StageStatus> {
        self.verify_lock()?;
        self.staging.status()
    }

    pub fn datasets(&self) -> CResult<DatasetWriter> {
        self.verify_lock()?;
        Ok(DatasetWriter::new(
            self.staging.env().clone(),
            self.staging.stage_hash_env().clone(),
            self.staging.hash_env().clone(),
            self.backend.clone(),
            self.generation.token(),
        ))
    }

    pub fn metadata(&self) -> CResult<MetadataWriter> {
        self.verify_lock()?;
        Ok(MetadataWriter::new(
            self.staging.env().clone(),
            self.label.clone(),
            self.generation.token(),
        ))
    }

    pub fn diff(&self) -> CResult<WriterDiff> {
        self.verify_lock()?;
        Ok(WriterDiff {
            commits: self.commits.clone(),
            branches: self.branches.clone(),
            staging: self.staging.clone(),
            branch: self.branch.clone(),
            token: self.generation.token(),
        })
    }

    /// Commits the staged changes on the checkout branch and advances its
    /// head. Staging is left byte-identical to the new head, so outstanding
    /// dataset and metadata handles remain valid.
    pub fn commit(&mut self, message: &str) -> CResult<String> {
        self.verify_lock()?;
        log::info!("commit requested with message: {:?}", message);

        if self.staging.status()? == StageStatus::Clean {
            return Err(Error::EmptyCommit);
        }

        let records = self.staging.env().begin_read()?.records();
        let head = self.branches.get_head(&self.branch)?;
        let parents = if head == UNBORN { vec![] } else { vec![head] };
        let hash =
            self.commits
                .write_commit(parents, &self.author, &self.email, message, records)?;
        self.branches.set_head(&self.branch, &hash)?;

        self.backend.persist_staged()?;
        self.staging.clear_stage_hash()?;

        log::info!("commit completed: {}", hash);
        Ok(hash)
    }

    /// Hard reset of the staging area to the branch head. Irreversible;
    /// every handed-out handle becomes invalid. Returns the head commit.
    pub fn reset_staging_area(&mut self) -> CResult<String> {
        self.verify_lock()?;
        log::info!("hard reset requested on branch {:?}", self.branch);

        if self.staging.status()? == StageStatus::Clean {
            return Err(Error::NoResetNeeded);
        }

        let head = self.staging.hard_reset(self.backend.as_ref())?;
        self.generation.bump();
        Ok(head)
    }

    /// Merges `dev_branch` into this checkout's branch. On success the
    /// staging area is rebuilt, so handed-out handles become invalid. On
    /// failure (conflicts included) the session closes and the writer lock
    /// is released before the error surfaces.
    pub fn merge(&mut self, message: &str, dev_branch: &str) -> CResult<String> {
        self.verify_lock()?;
        let result = select_merge_algorithm(
            &self.branches,
            &self.commits,
            &self.staging,
            &self.branch,
            dev_branch,
            message,
            &self.author,
            &self.email,
        );
        match result {
            Ok(hash) => {
                self.generation.bump();
                Ok(hash)
            }
            Err(err) => {
                if let Err(close_err) = self.close_internal() {
                    log::error!("failed to close checkout after merge error: {}", close_err);
                }
                Err(err)
            }
        }
    }

    fn close_internal(&mut self) -> CResult<()> {
        self.generation.bump();
        self.closed = true;
        self.branches.release_writer_lock(&self.writer_token)
    }

    /// Closes the checkout and releases the writer lock. The lock is
    /// released exactly when the persisted value matches our token;
    /// otherwise the session still tears down and `LockMismatch` surfaces,
    /// leaving `force_release_writer_lock` as the recovery path.
    pub fn close(&mut self) -> CResult<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        log::info!("writer checkout of {:?} closed", self.branch);
        self.close_internal()
    }
}

impl Drop for WriterCheckout {
    fn drop(&mut self) {
        if !self.closed {
            self.generation.bump();
            self.closed = true;
            if let Err(err) = self.branches.release_writer_lock(&self.writer_token) {
                log::error!("writer checkout dropped without close: {}", err);
            }
        }
    }
}

/// Diff surface of a writer checkout: the live staging area as master.
pub struct WriterDiff {
    commits: Arc<CommitStore>,
    branches: Arc<BranchStore>,
    staging: Arc<StagingArea>,
    branch: String,
    token: HandleToken,
}

impl WriterDiff {
    /// DIRTY when the staged record stream differs from the branch head.
    pub fn status(&self) -> CResult<StageStatus> {
        self.token.check()?;
        self.staging.status()
    }

    /// Diff of the staging area against its base commit.
    pub fn staged(&self) -> CResult<DiffAndConflicts> {
        self.token.check()?;
        let head = self.branches.get_head(&self.branch)?;
        diff::staged(&self.commits, self.staging.env(), &head)
    }

    /// Diff of the staging area against another commit.
    pub fn commit(&self, dev_commit: &str) -> CResult<DiffAndConflicts> {
        self.token.check()?;
        let head = self.branches.get_head(&self.branch)?;
        diff::stage_to_commit(&self.commits, self.staging.env(), &head, dev_commit)
    }

    /// Diff of the staging area against another branch's head.
    pub fn branch(&self, dev_branch: &str) -> CResult<DiffAndConflicts> {
        self.token.check()?;
        let head = self.branches.get_head(&self.branch)?;
        let dev_head = self.branches.get_head(dev_branch)?;
        diff::stage_to_commit(&self.commits, self.staging.env(), &head, &dev_head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_tokens_expire_on_bump() {
        let generation = Generation::new();
        let token = generation.token();
        assert!(token.check().is_ok());

        generation.bump();
        assert!(matches!(token.check(), Err(Error::InvalidHandle)));

        // A token minted after the bump is valid.
        assert!(generation.token().check().is_ok());
    }
}
