// Reconciliation: turn one consistent observation of the world into work.
//
// Inputs are the four views of a cycle — local listing, remote listing,
// local index, remote index — plus plaintext hashes for the local files.
// Output is a set of disjoint work lists. No I/O happens here; given the
// same inputs the plan is byte-for-byte identical, which is what makes sync
// cycles auditable.
//
// Content hashes are the only notion of truth. mtimes never pick winners;
// they only feed the grace-window shortcut that decides whether a file needs
// re-hashing at all.

use crate::adapter::{RemoteKind, RemoteRecord};
use crate::hashing;
use crate::index::{IndexEntry, SyncIndex};
use crate::path_filter::PathFilter;
use crate::vault::LocalFile;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Grace window for filesystem mtime precision noise.
const MTIME_GRACE_MS: i64 = 2_000;
/// Orphan guard: refuse the pass when more than this many files would go.
const ORPHAN_GUARD_MIN_COUNT: usize = 10;

/// Verdict of the cheap local-change probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickCheck {
    /// Size matches and mtime is within the grace window: unchanged.
    Identical,
    /// Size differs: changed, no hash needed to know that.
    Changed,
    /// Cannot tell without hashing.
    Unknown,
}

/// Decide whether a local file can skip re-hashing.
///
/// Zero sizes disable the shortcut entirely: some mobile filesystems report
/// zero for freshly written files, and trusting that would mask edits.
pub fn quick_check(local_size: u64, local_mtime_ms: i64, indexed: &IndexEntry) -> QuickCheck {
    if local_size == 0 || indexed.size == 0 {
        return QuickCheck::Unknown;
    }
    if local_size != indexed.size {
        return QuickCheck::Changed;
    }
    if (local_mtime_ms - indexed.mtime_ms).abs() <= MTIME_GRACE_MS {
        return QuickCheck::Identical;
    }
    QuickCheck::Unknown
}

/// One adoption: a remote file found hash-equal to an unindexed local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adoption {
    pub path: String,
    pub plain_hash: String,
}

/// Work sets computed for one cycle. Paths are sorted within each set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub upload: Vec<String>,
    pub download: Vec<String>,
    pub merge: Vec<String>,
    /// Locally present, indexed, gone from the remote: remote delete wins.
    pub delete_local: Vec<String>,
    /// Remotely present, locally removed (or push-banned): delete remotely.
    pub delete_remote: Vec<String>,
    /// Unindexed but identical on both sides: record, transfer nothing.
    pub adopt: Vec<Adoption>,
    /// Indexed, changed on both sides to the same content: record only.
    pub reindex: Vec<Adoption>,
    /// True when the orphan pass was refused as a suspicious mass delete;
    /// `delete_local` is empty in that case.
    pub orphan_guard_tripped: bool,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.upload.is_empty()
            && self.download.is_empty()
            && self.merge.is_empty()
            && self.delete_local.is_empty()
            && self.delete_remote.is_empty()
            && self.adopt.is_empty()
            && self.reindex.is_empty()
    }
}

pub struct ReconcileInput<'a> {
    pub local_files: &'a [LocalFile],
    /// Plaintext digest per participating local path.
    pub local_hashes: &'a HashMap<String, String>,
    pub remote_files: &'a BTreeMap<String, RemoteRecord>,
    pub local_index: &'a SyncIndex,
    pub remote_index: &'a SyncIndex,
    pub filter: &'a PathFilter,
    /// Whether remote content digests are ciphertext-side.
    pub encrypted: bool,
}

impl<'a> ReconcileInput<'a> {
    /// Remote content identity for `path`: the listing hash when present,
    /// else the hash recorded in the shared index by the last pusher.
    fn remote_hash(&self, path: &str) -> Option<String> {
        let record = self.remote_files.get(path)?;
        if let Some(hash) = &record.hash {
            return Some(hashing::normalize_digest(hash));
        }
        self.remote_index
            .get(path)
            .map(|e| hashing::normalize_digest(&e.hash))
    }

    /// Plaintext digest of the remote content, when it can be known without
    /// downloading: directly for plaintext vaults, via a current shared-index
    /// entry for encrypted ones.
    fn remote_plain_hash(&self, path: &str) -> Option<String> {
        let remote_hash = self.remote_hash(path)?;
        if !self.encrypted {
            return Some(remote_hash);
        }
        let recorded = self.remote_index.get(path)?;
        if hashing::normalize_digest(&recorded.hash) == remote_hash {
            Some(hashing::normalize_digest(&recorded.plain_hash))
        } else {
            None
        }
    }

    fn remote_changed(&self, path: &str, indexed: &IndexEntry) -> bool {
        match self.remote_hash(path) {
            Some(remote_hash) => remote_hash != hashing::normalize_digest(&indexed.hash),
            // Hashless provider and no index record: size is all we have.
            None => self
                .remote_files
                .get(path)
                .map(|r| r.size != indexed.size)
                .unwrap_or(false),
        }
    }
}

/// Compute the work sets for one cycle.
pub fn reconcile(input: &ReconcileInput<'_>) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let mut orphan_candidates = Vec::new();
    let mut participating_local = 0usize;

    for file in self_sorted(input.local_files) {
        let path = file.path.as_str();
        if input.filter.should_ignore(path) {
            continue;
        }
        if input.filter.should_not_be_on_remote(path) {
            // Allowed locally; a stray remote copy is handled in the remote pass.
            continue;
        }
        participating_local += 1;

        let local_hash = match input.local_hashes.get(path) {
            Some(hash) => hashing::normalize_digest(hash),
            None => {
                warn!(path, "no local hash supplied; skipping");
                continue;
            }
        };

        let in_remote = matches!(
            input.remote_files.get(path),
            Some(record) if record.kind == RemoteKind::File
        );
        let indexed = input.local_index.get(path);

        // A path with a parked transfer is owned by the queue until that
        // item reaches a terminal state.
        if indexed.is_some_and(|e| e.pending_transfer.is_some()) {
            continue;
        }

        match (in_remote, indexed) {
            (false, None) => plan.upload.push(path.to_string()),
            (false, Some(entry)) => {
                // Only files the remote actually had can be orphans.
                if !entry.file_id.is_empty() {
                    orphan_candidates.push(path.to_string());
                }
            }
            (true, None) => {
                // Adoption: no baseline, but maybe nothing to transfer.
                match input.remote_plain_hash(path) {
                    Some(remote_plain) if remote_plain == local_hash => {
                        plan.adopt.push(Adoption {
                            path: path.to_string(),
                            plain_hash: local_hash,
                        });
                    }
                    _ => plan.download.push(path.to_string()),
                }
            }
            (true, Some(entry)) => {
                let local_changed = local_hash != hashing::normalize_digest(&entry.plain_hash);
                let remote_changed = input.remote_changed(path, entry);
                match (local_changed, remote_changed) {
                    (false, false) => {}
                    (true, false) => plan.upload.push(path.to_string()),
                    (false, true) => plan.download.push(path.to_string()),
                    (true, true) => {
                        // Both moved; identical results need no transfer.
                        match input.remote_plain_hash(path) {
                            Some(remote_plain) if remote_plain == local_hash => {
                                plan.reindex.push(Adoption {
                                    path: path.to_string(),
                                    plain_hash: local_hash,
                                });
                            }
                            _ => plan.merge.push(path.to_string()),
                        }
                    }
                }
            }
        }
    }

    // Remote-only paths.
    let local_paths: HashMap<&str, ()> = input
        .local_files
        .iter()
        .map(|f| (f.path.as_str(), ()))
        .collect();
    for (path, record) in input.remote_files {
        if record.kind != RemoteKind::File
            || local_paths.contains_key(path.as_str())
            || input.filter.should_ignore(path)
        {
            continue;
        }
        if input.filter.should_not_be_on_remote(path) {
            plan.delete_remote.push(path.clone());
            continue;
        }
        match input.local_index.get(path) {
            Some(entry) if entry.pending_transfer.is_some() => {}
            Some(_) => {
                // This device synced it before and has since removed it locally.
                plan.delete_remote.push(path.clone());
            }
            None => plan.download.push(path.clone()),
        }
    }

    // Orphan pass with the mass-delete guard.
    let tripped = orphan_candidates.len() > ORPHAN_GUARD_MIN_COUNT
        && orphan_candidates.len() * 2 >= participating_local;
    if tripped {
        warn!(
            orphans = orphan_candidates.len(),
            local = participating_local,
            "refusing suspicious mass delete of local files"
        );
        plan.orphan_guard_tripped = true;
    } else {
        plan.delete_local = orphan_candidates;
    }

    for set in [
        &mut plan.upload,
        &mut plan.download,
        &mut plan.merge,
        &mut plan.delete_local,
        &mut plan.delete_remote,
    ] {
        set.sort();
        set.dedup();
    }
    plan.adopt.sort_by(|a, b| a.path.cmp(&b.path));
    plan.reindex.sort_by(|a, b| a.path.cmp(&b.path));

    debug!(
        upload = plan.upload.len(),
        download = plan.download.len(),
        merge = plan.merge.len(),
        delete_local = plan.delete_local.len(),
        delete_remote = plan.delete_remote.len(),
        adopt = plan.adopt.len(),
        "reconciled"
    );
    plan
}

fn self_sorted(files: &[LocalFile]) -> Vec<&LocalFile> {
    let mut sorted: Vec<&LocalFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    sorted
}
