//! The merge engine: fast-forward when history allows it, otherwise a
//! linear three-way merge over materialized commit environments.

use crate::branches::BranchStore;
use crate::commits::{CommitStore, UNBORN};
use crate::diff::{apply_diff, diff3};
use crate::error::{CResult, Error};
use crate::records::with_rebuilt_counts;
use crate::staging::{StageStatus, StagingArea};

/// Merges `dev_branch` into `master_branch`, whose staging area must be
/// CLEAN. Returns the new master head: the dev head for a fast-forward (the
/// message is discarded), a fresh two-parent commit for a three-way merge.
///
/// The caller must hold the writer lock. Ephemeral environments are dropped
/// on every exit path, including conflict aborts.
#[allow(clippy::too_many_arguments)]
pub fn select_merge_algorithm(
    branches: &BranchStore,
    commits: &CommitStore,
    staging: &StagingArea,
    master_branch: &str,
    dev_branch: &str,
    message: &str,
    author: &str,
    email: &str,
) -> CResult<String> {
    if staging.status()? == StageStatus::Dirty {
        return Err(Error::DirtyStaging(master_branch.to_string()));
    }

    let master_head = branches.get_head(master_branch)?;
    let dev_head = branches.get_head(dev_branch)?;
    if master_head == dev_head || dev_head == UNBORN {
        return Err(Error::NoOpMerge);
    }

    // An unborn master trivially fast-forwards to any dev history.
    let can_ff = if master_head == UNBORN {
        true
    } else {
        commits.can_fast_forward(&master_head, &dev_head)?
    };

    if can_ff {
        log::info!(
            "fast-forward merge of {:?} into {:?}: {} (commit message discarded)",
            dev_branch,
            master_branch,
            dev_head
        );
        branches.set_head(master_branch, &dev_head)?;
        staging.initialize_from_commit(&dev_head)?;
        return Ok(dev_head);
    }

    let ancestor = commits.lowest_common_ancestor(&master_head, &dev_head)?;
    let a_env = commits.materialize(&ancestor)?;
    let m_env = commits.materialize(&master_head)?;
    let d_env = commits.materialize(&dev_head)?;

    let a_records = a_env.env().begin_read()?.records();
    let m_records = m_env.env().begin_read()?.records();
    let d_records = d_env.env().begin_read()?.records();

    let three = diff3(&a_records, &m_records, &d_records);
    if three.conflicts.conflict() {
        log::warn!(
            "merge of {:?} into {:?} aborted: {}",
            dev_branch,
            master_branch,
            three.conflicts.summary()
        );
        return Err(Error::MergeConflict(three.conflicts));
    }

    // Staging equals master's records; fold dev's changes against the
    // ancestor into them and regenerate the count sentinels diff ignores.
    let merged = with_rebuilt_counts(&apply_diff(&m_records, &three.dev))?;
    staging.replace_records(merged.clone())?;

    let hash = commits.write_commit(
        vec![master_head, dev_head],
        author,
        email,
        message,
        merged,
    )?;
    branches.set_head(master_branch, &hash)?;
    log::info!("three-way merge commit {} on {:?}", hash, master_branch);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::records::{encode_count, RecordKey};
    use crate::staging::StagingArea;
    use crate::storage::env::Environment;

    struct Fixture {
        branches: Arc<BranchStore>,
        commits: Arc<CommitStore>,
        staging: StagingArea,
        _dir: tempdir::TempDir,
    }

    fn fixture() -> CResult<Fixture> {
        let dir = tempdir::TempDir::new("hangar")?;
        let commits =
            Arc::new(CommitStore::new(Environment::memory("ref"), &dir.path().join("tmp")));
        let branches = Arc::new(BranchStore::new(Environment::memory("branch")));
        branches.initialize("master", UNBORN)?;
        let staging = StagingArea::new(
            Environment::memory("stage"),
            Environment::memory("stage_hash"),
            Environment::memory("hash"),
            commits.clone(),
            branches.clone(),
            &dir.path().join("stage_data"),
        );
        Ok(Fixture { branches, commits, staging, _dir: dir })
    }

    fn label_records(entries: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(key, hash)| {
                (
                    RecordKey::Label { key: (*key).to_string() }.encode(),
                    hash.as_bytes().to_vec(),
                )
            })
            .collect();
        out.push((RecordKey::LabelCount.encode(), encode_count(entries.len() as u64)));
        out.sort();
        out
    }

    /// Commits the given records onto a branch, advancing its head.
    fn commit_on(
        fx: &Fixture,
        branch: &str,
        records: Vec<(Vec<u8>, Vec<u8>)>,
        message: &str,
    ) -> CResult<String> {
        // Commit times order LCA selection; space them out.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let head = fx.branches.get_head(branch)?;
        let parents = if head == UNBORN { vec![] } else { vec![head] };
        let hash = fx.commits.write_commit(parents, "t", "t@t", message, records)?;
        fx.branches.set_head(branch, &hash)?;
        Ok(hash)
    }

    fn run_merge(fx: &Fixture, master: &str, dev: &str, message: &str) -> CResult<String> {
        select_merge_algorithm(
            &fx.branches,
            &fx.commits,
            &fx.staging,
            master,
            dev,
            message,
            "t",
            "t@t",
        )
    }

    #[test]
    fn fast_forward_advances_head_and_staging() -> CResult<()> {
        let fx = fixture()?;
        let c1 = commit_on(&fx, "master", label_records(&[("one", "aa")]), "c1")?;
        fx.staging.initialize_from_commit(&c1)?;
        fx.branches.create_branch("foo", &c1)?;

        let c2 = commit_on(&fx, "foo", label_records(&[("one", "aa"), ("two", "bb")]), "c2")?;

        let out = run_merge(&fx, "master", "foo", "msg")?;
        assert_eq!(out, c2);
        assert_eq!(fx.branches.get_head("master")?, c2);
        // Fast-forward discards the message: the head commit still carries
        // the dev-side message.
        assert_eq!(fx.commits.get_commit(&c2)?.message, "c2");
        assert_eq!(fx.staging.status()?, StageStatus::Clean);
        assert_eq!(fx.staging.env().begin_read()?.records(), fx.commits.get_records(&c2)?);
        Ok(())
    }

    #[test]
    fn three_way_clean_merge_unions_disjoint_changes() -> CResult<()> {
        let fx = fixture()?;
        let a = commit_on(&fx, "master", label_records(&[("k1", "aa")]), "ancestor")?;
        fx.staging.initialize_from_commit(&a)?;
        fx.branches.create_branch("dev", &a)?;

        let m = commit_on(&fx, "master", label_records(&[("k1", "aa"), ("k2", "bb")]), "m")?;
        let d = commit_on(&fx, "dev", label_records(&[("k1", "aa"), ("k3", "cc")]), "d")?;
        fx.staging.initialize_from_commit(&m)?;

        let merged = run_merge(&fx, "master", "dev", "merged")?;
        assert_ne!(merged, m);
        assert_ne!(merged, d);

        let spec = fx.commits.get_commit(&merged)?;
        assert_eq!(spec.parents, vec![m.clone(), d.clone()]);
        assert_eq!(spec.message, "merged");
        assert_eq!(fx.branches.get_head("master")?, merged);

        // The merged record set is the union {k1, k2, k3} with a rebuilt
        // label count, and staging equals it byte for byte.
        let expect = label_records(&[("k1", "aa"), ("k2", "bb"), ("k3", "cc")]);
        assert_eq!(fx.commits.get_records(&merged)?, expect);
        assert_eq!(fx.staging.env().begin_read()?.records(), expect);
        assert_eq!(fx.staging.status()?, StageStatus::Clean);
        Ok(())
    }

    #[test]
    fn conflicting_merge_aborts_without_commit() -> CResult<()> {
        let fx = fixture()?;
        let a = commit_on(&fx, "master", label_records(&[("k1", "aa")]), "ancestor")?;
        fx.staging.initialize_from_commit(&a)?;
        fx.branches.create_branch("dev", &a)?;

        let m = commit_on(&fx, "master", label_records(&[("k1", "bb")]), "m")?;
        commit_on(&fx, "dev", label_records(&[("k1", "cc")]), "d")?;
        fx.staging.initialize_from_commit(&m)?;

        let err = run_merge(&fx, "master", "dev", "boom").unwrap_err();
        match err {
            Error::MergeConflict(conflicts) => {
                assert_eq!(conflicts.t3.len(), 1);
                assert_eq!(conflicts.t3[0].0, RecordKey::Label { key: "k1".into() }.encode());
                assert!(conflicts.t1.is_empty());
                assert!(conflicts.t21.is_empty());
                assert!(conflicts.t22.is_empty());
            }
            other => panic!("expected MergeConflict, got {:?}", other),
        }

        // No commit was created, the head is unchanged, staging still holds
        // master's records.
        assert_eq!(fx.branches.get_head("master")?, m);
        assert_eq!(fx.staging.status()?, StageStatus::Clean);
        assert_eq!(fx.staging.env().begin_read()?.records(), fx.commits.get_records(&m)?);
        Ok(())
    }

    #[test]
    fn dirty_staging_rejected() -> CResult<()> {
        let fx = fixture()?;
        let a = commit_on(&fx, "master", label_records(&[("k1", "aa")]), "a")?;
        fx.staging.initialize_from_commit(&a)?;
        fx.branches.create_branch("dev", &a)?;
        commit_on(&fx, "dev", label_records(&[("k1", "aa"), ("k2", "bb")]), "d")?;

        let mut txn = fx.staging.env().begin_write()?;
        txn.set(b"l:dirty", b"ff".to_vec());
        txn.commit()?;

        assert!(matches!(
            run_merge(&fx, "master", "dev", "m"),
            Err(Error::DirtyStaging(_))
        ));
        Ok(())
    }

    #[test]
    fn identical_heads_are_a_noop() -> CResult<()> {
        let fx = fixture()?;
        let a = commit_on(&fx, "master", label_records(&[("k1", "aa")]), "a")?;
        fx.staging.initialize_from_commit(&a)?;
        fx.branches.create_branch("dev", &a)?;

        assert!(matches!(run_merge(&fx, "master", "dev", "m"), Err(Error::NoOpMerge)));
        Ok(())
    }
}
