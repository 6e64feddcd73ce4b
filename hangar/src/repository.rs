//! The repository root object: on-disk layout, the environment table, the
//! format version gate, and the entry points for checkouts, branches, and
//! merges.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{BlobBackend, FsBlobStore};
use crate::branches::BranchStore;
use crate::checkout::{ReaderCheckout, WriterCheckout};
use crate::commits::{CommitStore, UNBORN};
use crate::error::{CResult, Error};
use crate::staging::{StageStatus, StagingArea};
use crate::storage::env::{EnvRegistry, Environment};

/// Repository directory created inside the user-provided path.
const REPO_DIR: &str = ".hangar";
/// Default branch created at init.
const DEFAULT_BRANCH: &str = "master";
/// Repository format version written at init, checked on open.
const VERSION_FILE: &str = "VERSION";

const DIR_BRANCH: &str = "branch";
const DIR_REF: &str = "ref";
const DIR_HASH: &str = "hash";
const DIR_LABEL: &str = "label";
const DIR_STAGE: &str = "stage";
const DIR_STAGE_HASH: &str = "stage_hash";
const DIR_STORE: &str = "store";
const DIR_STAGE_DATA: &str = "stage_data";
const DIR_TMP: &str = "tmp";

fn parse_version(text: &str) -> CResult<(u64, u64, u64)> {
    let mut parts = text.trim().splitn(3, '.');
    let mut next = || -> CResult<u64> {
        parts
            .next()
            .and_then(|part| part.parse::<u64>().ok())
            .ok_or_else(|| Error::UnsupportedRepositoryVersion(text.trim().to_string()))
    };
    Ok((next()?, next()?, next()?))
}

/// A hangar repository. Owns the environment table and every store; hands
/// out reader and writer checkouts.
pub struct Repository {
    root: PathBuf,
    branches: Arc<BranchStore>,
    commits: Arc<CommitStore>,
    staging: Arc<StagingArea>,
    backend: Arc<dyn BlobBackend>,
    label: Environment,
}

impl Repository {
    /// Creates a repository at `<path>/.hangar`: the directory layout, the
    /// `VERSION` record, the unborn default branch with staging based on
    /// it, and the available writer lock.
    pub fn init(path: impl AsRef<Path>, user_name: &str, user_email: &str) -> CResult<Self> {
        let root = path.as_ref().join(REPO_DIR);
        if root.join(VERSION_FILE).exists() {
            return Err(Error::EnvError(format!(
                "repository already initialized at {:?}",
                root
            )));
        }
        for dir in [
            DIR_BRANCH,
            DIR_REF,
            DIR_HASH,
            DIR_LABEL,
            DIR_STAGE,
            DIR_STAGE_HASH,
            DIR_STORE,
            DIR_STAGE_DATA,
            DIR_TMP,
        ] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        std::fs::write(root.join(VERSION_FILE), env!("CARGO_PKG_VERSION"))?;

        let repo = Self::build(&root)?;
        repo.branches.initialize(DEFAULT_BRANCH, UNBORN)?;
        repo.branches.set_identity(user_name, user_email)?;
        log::info!("initialized repository at {:?}", repo.root);
        Ok(repo)
    }

    /// Opens an existing repository at `<path>/.hangar`, enforcing the
    /// format version gate: only a stored version with this build's
    /// major+minor is readable (patch differences are fine).
    pub fn open(path: impl AsRef<Path>) -> CResult<Self> {
        let root = path.as_ref().join(REPO_DIR);
        let version_file = root.join(VERSION_FILE);
        if !version_file.exists() {
            return Err(Error::EnvError(format!(
                "no repository initialized at {:?}",
                root
            )));
        }
        let stored = std::fs::read_to_string(version_file)?;
        let (stored_major, stored_minor, _) = parse_version(&stored)?;
        let (major, minor, _) = parse_version(env!("CARGO_PKG_VERSION"))?;
        if (stored_major, stored_minor) != (major, minor) {
            return Err(Error::UnsupportedRepositoryVersion(stored.trim().to_string()));
        }
        Self::build(&root)
    }

    /// Opens every environment and assembles the stores.
    fn build(root: &Path) -> CResult<Self> {
        let registry = EnvRegistry::new();
        let branchenv = registry.open(DIR_BRANCH, &root.join(DIR_BRANCH), true)?;
        let refenv = registry.open(DIR_REF, &root.join(DIR_REF), true)?;
        let hashenv = registry.open(DIR_HASH, &root.join(DIR_HASH), true)?;
        let label = registry.open(DIR_LABEL, &root.join(DIR_LABEL), true)?;
        let stage = registry.open(DIR_STAGE, &root.join(DIR_STAGE), true)?;
        let stage_hash = registry.open(DIR_STAGE_HASH, &root.join(DIR_STAGE_HASH), true)?;

        let branches = Arc::new(BranchStore::new(branchenv));
        let commits = Arc::new(CommitStore::new(refenv, &root.join(DIR_TMP)));
        let backend: Arc<dyn BlobBackend> = Arc::new(FsBlobStore::new(
            &root.join(DIR_STORE),
            &root.join(DIR_STAGE_DATA),
        )?);
        let staging = Arc::new(StagingArea::new(
            stage,
            stage_hash,
            hashenv,
            commits.clone(),
            branches.clone(),
            &root.join(DIR_STAGE_DATA),
        ));

        Ok(Self { root: root.to_path_buf(), branches, commits, staging, backend, label })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The stored repository format version.
    pub fn version(&self) -> CResult<String> {
        Ok(std::fs::read_to_string(self.root.join(VERSION_FILE))?.trim().to_string())
    }

    // -- branches -----------------------------------------------------------

    pub fn list_branches(&self) -> CResult<Vec<String>> {
        self.branches.list_branches()
    }

    /// Creates a branch at the staging branch's current head.
    pub fn create_branch(&self, name: &str) -> CResult<()> {
        let staging_branch = self.branches.get_staging_branch()?;
        let head = self.branches.get_head(&staging_branch)?;
        self.branches.create_branch(name, &head)
    }

    /// Creates a branch at an explicit commit.
    pub fn create_branch_at(&self, name: &str, hash: &str) -> CResult<()> {
        if !self.commits.check_in_history(hash)? {
            return Err(Error::UnknownCommit(hash.to_string()));
        }
        self.branches.create_branch(name, hash)
    }

    pub fn remove_branch(&self, name: &str) -> CResult<()> {
        self.branches.delete_branch(name)
    }

    pub fn branch_head(&self, name: &str) -> CResult<String> {
        self.branches.get_head(name)
    }

    /// First-parent commit history of a branch, newest first.
    pub fn log(&self, branch: &str) -> CResult<Vec<String>> {
        let head = self.branches.get_head(branch)?;
        self.commits.log(&head)
    }

    // -- checkouts ----------------------------------------------------------

    /// Read-only checkout of one commit.
    pub fn checkout_reader(&self, commit_hash: &str) -> CResult<ReaderCheckout> {
        ReaderCheckout::new(
            self.commits.clone(),
            self.branches.clone(),
            self.backend.clone(),
            self.label.clone(),
            commit_hash,
        )
    }

    /// Read-only checkout of a branch's head commit.
    pub fn checkout_reader_branch(&self, branch: &str) -> CResult<ReaderCheckout> {
        let head = self.branches.get_head(branch)?;
        if head == UNBORN {
            return Err(Error::UnknownCommit(format!(
                "branch {:?} has no commits to read",
                branch
            )));
        }
        self.checkout_reader(&head)
    }

    /// Write-enabled checkout of a branch; takes the repository-wide writer
    /// lock.
    pub fn checkout_writer(&self, branch: &str) -> CResult<WriterCheckout> {
        let (author, email) = self.branches.get_identity()?;
        WriterCheckout::new(
            self.branches.clone(),
            self.commits.clone(),
            self.staging.clone(),
            self.backend.clone(),
            self.label.clone(),
            author,
            email,
            branch,
        )
    }

    /// Staging status against its base branch head.
    pub fn status(&self) -> CResult<StageStatus> {
        self.staging.status()
    }

    /// Merges `dev_branch` into `master_branch` under a transient writer
    /// checkout.
    pub fn merge(&self, message: &str, master_branch: &str, dev_branch: &str) -> CResult<String> {
        let mut writer = self.checkout_writer(master_branch)?;
        let hash = writer.merge(message, dev_branch)?;
        writer.close()?;
        Ok(hash)
    }

    // -- writer lock --------------------------------------------------------

    pub fn writer_lock_held(&self) -> CResult<bool> {
        self.branches.writer_lock_held()
    }

    /// Recovery path after a crashed writer: unconditionally resets the
    /// persisted writer lock, with a loud warning.
    pub fn force_release_writer_lock(&self) -> CResult<()> {
        self.branches.force_release_writer_lock()
    }
}
