//! The diff engine: a linear two-cursor walk over sorted record streams,
//! and the four-class conflict classifier used by three-way merges.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::commits::CommitStore;
use crate::error::{CResult, Error};
use crate::records::{is_count_key, LabelSpec, RecordKey, SampleSpec, SchemaSpec};
use crate::storage::env::Environment;

/// One record as raw bytes: `(key, value)`.
pub type RecordPair = (Vec<u8>, Vec<u8>);

/// Changes between a base and a head record stream. `added` and `mutated`
/// carry head values, `deleted` carries base values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffOut {
    pub added: BTreeSet<RecordPair>,
    pub deleted: BTreeSet<RecordPair>,
    pub mutated: BTreeSet<RecordPair>,
}

impl DiffOut {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.mutated.is_empty()
    }
}

/// Walks two sorted record streams in lockstep, classifying each key as
/// added, deleted, mutated, or unchanged. O(|base| + |head|) with no random
/// access; relies on the codec's order-preserving keys. Count sentinel keys
/// are skipped.
pub fn diff_streams(base: &[RecordPair], head: &[RecordPair]) -> DiffOut {
    let mut out = DiffOut::default();
    let mut base_iter = base.iter().filter(|(key, _)| !is_count_key(key)).peekable();
    let mut head_iter = head.iter().filter(|(key, _)| !is_count_key(key)).peekable();

    loop {
        match (base_iter.peek(), head_iter.peek()) {
            (None, None) => break,
            // base exhausted: drain head as added
            (None, Some(head_kv)) => {
                out.added.insert((*head_kv).clone());
                head_iter.next();
            }
            // head exhausted: drain base as deleted
            (Some(base_kv), None) => {
                out.deleted.insert((*base_kv).clone());
                base_iter.next();
            }
            (Some((base_key, base_val)), Some((head_key, head_val))) => {
                match base_key.cmp(head_key) {
                    std::cmp::Ordering::Greater => {
                        out.added.insert(((*head_key).clone(), (*head_val).clone()));
                        head_iter.next();
                    }
                    std::cmp::Ordering::Less => {
                        out.deleted.insert(((*base_key).clone(), (*base_val).clone()));
                        base_iter.next();
                    }
                    std::cmp::Ordering::Equal => {
                        if base_val != head_val {
                            out.mutated.insert(((*head_key).clone(), (*head_val).clone()));
                        }
                        base_iter.next();
                        head_iter.next();
                    }
                }
            }
        }
    }
    out
}

/// Diffs two live record environments through fresh-or-shared snapshots.
pub fn diff_envs(base: &Environment, head: &Environment) -> CResult<DiffOut> {
    let base_read = base.begin_read()?;
    let head_read = head.begin_read()?;
    Ok(diff_streams(&base_read.records(), &head_read.records()))
}

/// Replays a diff onto a base stream, yielding the head stream it was
/// computed against (count sentinels aside, which diff does not track).
pub fn apply_diff(base: &[RecordPair], diff: &DiffOut) -> Vec<RecordPair> {
    let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base
        .iter()
        .filter(|(key, _)| !is_count_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for (key, _) in &diff.deleted {
        merged.remove(key);
    }
    for (key, value) in diff.added.iter().chain(diff.mutated.iter()) {
        merged.insert(key.clone(), value.clone());
    }
    merged.into_iter().collect()
}

/// The four disjoint conflict classes between two divergent change sets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conflicts {
    /// Key added in master AND dev with different values.
    pub t1: Vec<RecordPair>,
    /// Key deleted in master, mutated in dev.
    pub t21: Vec<RecordPair>,
    /// Key deleted in dev, mutated in master.
    pub t22: Vec<RecordPair>,
    /// Key mutated in both master AND dev to different values.
    pub t3: Vec<RecordPair>,
}

impl Conflicts {
    /// True when any class is populated.
    pub fn conflict(&self) -> bool {
        !(self.t1.is_empty() && self.t21.is_empty() && self.t22.is_empty() && self.t3.is_empty())
    }

    /// Short human-readable account, used in error messages.
    pub fn summary(&self) -> String {
        let keys = |pairs: &[RecordPair]| -> String {
            pairs
                .iter()
                .map(|(key, _)| String::from_utf8_lossy(key).into_owned())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut parts = Vec::new();
        if !self.t1.is_empty() {
            parts.push(format!("both added [{}]", keys(&self.t1)));
        }
        if !self.t21.is_empty() {
            parts.push(format!("master deleted / dev mutated [{}]", keys(&self.t21)));
        }
        if !self.t22.is_empty() {
            parts.push(format!("dev deleted / master mutated [{}]", keys(&self.t22)));
        }
        if !self.t3.is_empty() {
            parts.push(format!("both mutated [{}]", keys(&self.t3)));
        }
        parts.join("; ")
    }
}

/// Finds all keys common to both pair sets which carry different values: a
/// symmetric difference of `(key, value)` pairs in which a key appearing
/// twice is a conflict, a key appearing once was touched by one side only.
fn symmetric_difference_keys(
    pair1: &BTreeSet<RecordPair>,
    pair2: &BTreeSet<RecordPair>,
) -> Vec<RecordPair> {
    let mut seen = HashSet::new();
    let mut conflict = Vec::new();
    for (key, value) in pair1.symmetric_difference(pair2) {
        if !seen.insert(key.clone()) {
            conflict.push((key.clone(), value.clone()));
        }
    }
    conflict
}

/// Classifies conflicting changes between two diffs computed against the
/// same ancestor.
pub fn find_conflicts(master_diff: &DiffOut, dev_diff: &DiffOut) -> Conflicts {
    Conflicts {
        t1: symmetric_difference_keys(&master_diff.added, &dev_diff.added),
        t21: symmetric_difference_keys(&master_diff.deleted, &dev_diff.mutated),
        t22: symmetric_difference_keys(&master_diff.mutated, &dev_diff.deleted),
        t3: symmetric_difference_keys(&master_diff.mutated, &dev_diff.mutated),
    }
}

/// The full three-way diff between an ancestor and two divergent heads.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreeWayDiff {
    /// `diff(ancestor, master)`.
    pub master: DiffOut,
    /// `diff(ancestor, dev)` -- the merge-applicable change set.
    pub dev: DiffOut,
    /// `diff(dev, master)` -- the reported change set.
    pub merge: DiffOut,
    pub conflicts: Conflicts,
}

pub fn diff3(a: &[RecordPair], m: &[RecordPair], d: &[RecordPair]) -> ThreeWayDiff {
    let master = diff_streams(a, m);
    let dev = diff_streams(a, d);
    let merge = diff_streams(d, m);
    let conflicts = find_conflicts(&master, &dev);
    ThreeWayDiff { master, dev, merge, conflicts }
}

// ---------------------------------------------------------------------------
// Decoded, per-family diff output for the checkout facades.

/// One side of a decoded diff, split by record family.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Changes {
    pub schemas: BTreeMap<String, SchemaSpec>,
    /// Keyed by `(arrayset, sample)`.
    pub samples: BTreeMap<(String, String), SampleSpec>,
    pub labels: BTreeMap<String, LabelSpec>,
}

fn decode_changes(pairs: &BTreeSet<RecordPair>) -> CResult<Changes> {
    let mut changes = Changes::default();
    for (key, value) in pairs {
        match RecordKey::decode(key)? {
            RecordKey::Schema { aset } => {
                changes.schemas.insert(aset, SchemaSpec::decode(value)?);
            }
            RecordKey::Sample { aset, sample } => {
                changes.samples.insert((aset, sample), SampleSpec::decode(value)?);
            }
            RecordKey::Label { key } => {
                changes.labels.insert(key, LabelSpec::decode(value)?);
            }
            // Count sentinels never reach diff output.
            RecordKey::SchemaCount | RecordKey::SampleCount { .. } | RecordKey::LabelCount => {}
        }
    }
    Ok(changes)
}

/// A decoded diff: added/deleted/mutated, each split by family.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedDiff {
    pub added: Changes,
    pub deleted: Changes,
    pub mutated: Changes,
}

/// The user-facing result of a facade diff: the decoded change set plus the
/// conflict report (only populated when a three-way comparison was needed).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffAndConflicts {
    pub diff: DecodedDiff,
    pub conflicts: Conflicts,
}

pub fn decode_diff(out: &DiffOut) -> CResult<DecodedDiff> {
    Ok(DecodedDiff {
        added: decode_changes(&out.added)?,
        deleted: decode_changes(&out.deleted)?,
        mutated: decode_changes(&out.mutated)?,
    })
}

/// History relationship between two heads, driving the fast-forward /
/// three-way decision.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryDiff {
    pub master_head: String,
    pub dev_head: String,
    pub ancestor: String,
    pub can_ff: bool,
}

/// Resolves the merge base and fast-forward eligibility of two heads.
pub fn determine_ancestors(
    commits: &CommitStore,
    master_head: &str,
    dev_head: &str,
) -> CResult<HistoryDiff> {
    let ancestor = commits.lowest_common_ancestor(master_head, dev_head)?;
    let can_ff = commits.can_fast_forward(master_head, dev_head)?;
    Ok(HistoryDiff {
        master_head: master_head.to_string(),
        dev_head: dev_head.to_string(),
        ancestor,
        can_ff,
    })
}

/// Diff of one commit (as master) against another, decoded for users. A
/// linear history diffs directly; divergent heads get the full three-way
/// treatment including conflict classification.
pub fn commit_to_commit(
    commits: &CommitStore,
    master_head: &str,
    dev_head: &str,
) -> CResult<DiffAndConflicts> {
    if !commits.check_in_history(dev_head)? {
        return Err(Error::UnknownCommit(dev_head.to_string()));
    }
    let hist = determine_ancestors(commits, master_head, dev_head)?;
    let m = commits.get_records(master_head)?;
    let d = commits.get_records(dev_head)?;
    if hist.can_ff {
        let out = diff_streams(&m, &d);
        Ok(DiffAndConflicts { diff: decode_diff(&out)?, conflicts: Conflicts::default() })
    } else {
        let a = commits.get_records(&hist.ancestor)?;
        let three = diff3(&a, &m, &d);
        Ok(DiffAndConflicts { diff: decode_diff(&three.merge)?, conflicts: three.conflicts })
    }
}

/// Diff of the live staging area (as master) against a commit, decoded for
/// users. `base_head` is the staging branch's head commit.
pub fn stage_to_commit(
    commits: &CommitStore,
    stage: &Environment,
    base_head: &str,
    dev_head: &str,
) -> CResult<DiffAndConflicts> {
    if !commits.check_in_history(dev_head)? {
        return Err(Error::UnknownCommit(dev_head.to_string()));
    }
    let hist = determine_ancestors(commits, base_head, dev_head)?;
    let staged = stage.begin_read()?.records();
    let d = commits.get_records(dev_head)?;
    if hist.can_ff {
        let out = diff_streams(&staged, &d);
        Ok(DiffAndConflicts { diff: decode_diff(&out)?, conflicts: Conflicts::default() })
    } else {
        let a = commits.get_records(&hist.ancestor)?;
        let three = diff3(&a, &staged, &d);
        Ok(DiffAndConflicts { diff: decode_diff(&three.merge)?, conflicts: three.conflicts })
    }
}

/// Diff of the staging area against its own base commit.
pub fn staged(
    commits: &CommitStore,
    stage: &Environment,
    base_head: &str,
) -> CResult<DiffAndConflicts> {
    let base = commits.get_records(base_head)?;
    let staged = stage.begin_read()?.records();
    let out = diff_streams(&base, &staged);
    Ok(DiffAndConflicts { diff: decode_diff(&out)?, conflicts: Conflicts::default() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(entries: &[(&str, &str)]) -> Vec<RecordPair> {
        let mut out: Vec<RecordPair> = entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        out.sort();
        out
    }

    fn pairs(entries: &[(&str, &str)]) -> BTreeSet<RecordPair> {
        entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn lockstep_classification() {
        let base = stream(&[("a:x:k1", "aa|5"), ("a:x:k2", "bb|5"), ("s:x", "f64|false|5|00")]);
        let head = stream(&[
            ("a:x:k2", "cc|5"),                 // mutated
            ("a:x:k3", "dd|5"),                 // added
            ("s:x", "f64|false|5|00"),          // unchanged
        ]);
        let out = diff_streams(&base, &head);
        assert_eq!(out.added, pairs(&[("a:x:k3", "dd|5")]));
        assert_eq!(out.deleted, pairs(&[("a:x:k1", "aa|5")]));
        assert_eq!(out.mutated, pairs(&[("a:x:k2", "cc|5")]));
    }

    #[test]
    fn exhausted_sides_drain() {
        let base = stream(&[("l:a", "aa"), ("l:b", "bb")]);
        let head = stream(&[("l:a", "aa"), ("l:b", "bb"), ("l:c", "cc"), ("l:d", "dd")]);
        let out = diff_streams(&base, &head);
        assert_eq!(out.added, pairs(&[("l:c", "cc"), ("l:d", "dd")]));
        assert!(out.deleted.is_empty());

        let out = diff_streams(&head, &base);
        assert_eq!(out.deleted, pairs(&[("l:c", "cc"), ("l:d", "dd")]));
        assert!(out.added.is_empty());
    }

    #[test]
    fn count_sentinels_ignored() {
        let base = stream(&[("a:x:", "1"), ("a:x:k1", "aa|5"), ("s:", "1")]);
        let head = stream(&[("a:x:", "2"), ("a:x:k1", "aa|5"), ("a:x:k2", "bb|5"), ("s:", "1")]);
        let out = diff_streams(&base, &head);
        assert_eq!(out.added, pairs(&[("a:x:k2", "bb|5")]));
        assert!(out.deleted.is_empty());
        assert!(out.mutated.is_empty());
    }

    #[test]
    fn diff_soundness_and_symmetry() {
        let base = stream(&[("l:a", "1"), ("l:b", "2"), ("l:c", "3"), ("l:d", "4")]);
        let head = stream(&[("l:b", "2"), ("l:c", "9"), ("l:e", "5"), ("l:f", "6")]);

        // Applying diff(B, H) to B yields H.
        let forward = diff_streams(&base, &head);
        assert_eq!(apply_diff(&base, &forward), head);

        // diff(B, H).added == diff(H, B).deleted and vice versa.
        let backward = diff_streams(&head, &base);
        assert_eq!(forward.added, backward.deleted);
        assert_eq!(forward.deleted, backward.added);
    }

    #[test]
    fn identical_streams_diff_empty() {
        let base = stream(&[("l:a", "1"), ("s:x", "f64|false|5|00")]);
        assert!(diff_streams(&base, &base).is_empty());
    }

    #[test]
    fn conflict_classes_are_disjoint_and_detected() {
        let ancestor = stream(&[("l:del_m", "0"), ("l:del_d", "0"), ("l:mut", "0"), ("l:keep", "0")]);
        let master = stream(&[
            ("l:add", "m"),     // t1: both add, different values
            ("l:del_d", "m"),   // t22: master mutates, dev deletes
            ("l:mut", "m"),     // t3: both mutate differently
            ("l:keep", "0"),
        ]);
        let dev = stream(&[
            ("l:add", "d"),
            ("l:del_m", "d"),   // t21: master deletes, dev mutates
            ("l:mut", "d"),
            ("l:keep", "0"),
        ]);

        let three = diff3(&ancestor, &master, &dev);
        let keys = |pairs: &[RecordPair]| {
            pairs.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>()
        };
        assert_eq!(keys(&three.conflicts.t1), vec![b"l:add".to_vec()]);
        assert_eq!(keys(&three.conflicts.t21), vec![b"l:del_m".to_vec()]);
        assert_eq!(keys(&three.conflicts.t22), vec![b"l:del_d".to_vec()]);
        assert_eq!(keys(&three.conflicts.t3), vec![b"l:mut".to_vec()]);
        assert!(three.conflicts.conflict());
    }

    #[test]
    fn one_sided_changes_do_not_conflict() {
        let ancestor = stream(&[("l:a", "0"), ("l:b", "0")]);
        let master = stream(&[("l:a", "0"), ("l:b", "0"), ("l:m", "1")]);
        let dev = stream(&[("l:a", "9"), ("l:b", "0")]);

        let three = diff3(&ancestor, &master, &dev);
        assert!(!three.conflicts.conflict());
        // Same-value additions on both sides are not conflicts either.
        let master2 = stream(&[("l:a", "0"), ("l:b", "0"), ("l:same", "s")]);
        let dev2 = stream(&[("l:a", "0"), ("l:b", "0"), ("l:same", "s")]);
        let three = diff3(&ancestor, &master2, &dev2);
        assert!(!three.conflicts.conflict());
    }

    #[test]
    fn decoded_diff_splits_families() -> CResult<()> {
        let base = stream(&[("s:x", "f64|false|5|00")]);
        let head = stream(&[
            ("s:x", "f64|false|5|00"),
            ("a:x:k1", "00ff|5"),
            ("l:note", "deadbeef"),
        ]);
        let decoded = decode_diff(&diff_streams(&base, &head))?;
        assert_eq!(decoded.added.samples.len(), 1);
        assert_eq!(decoded.added.labels.len(), 1);
        assert!(decoded.added.schemas.is_empty());
        assert!(decoded.deleted.samples.is_empty());
        Ok(())
    }
}
