// Merge policy for paths changed on both sides.
//
// The decision layer is pure: given local bytes, remote bytes and an optional
// ancestor, pick what happens. Ancestor recovery (revision history, then the
// local baseline sidecar) and the conflict-rename naming live here too; lock
// handling and the actual transfers are wired by the orchestrator.

pub mod diff3;

use crate::config::SyncConfig;
use crate::encrypted_adapter::ContentStore;
use crate::hashing;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

/// Content above this size is never line-merged.
const TEXT_MERGE_CAP: usize = 5 * 1024 * 1024;
/// How many revisions to inspect while hunting for the ancestor.
const ANCESTOR_REVISION_PROBES: usize = 5;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to do with a both-sides-changed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Conflict-free three-way merge; write locally and push inline.
    CleanMerge(Vec<u8>),
    /// Local content is contained in remote; the remote version wins.
    AcceptRemote,
    /// Remote content is contained in local; push the local version.
    AcceptLocal,
    /// Keep both: move local aside under a conflict name, pull the remote.
    ConflictRename,
}

/// Decide the outcome for one path.
pub fn decide(local: &[u8], remote: &[u8], ancestor: Option<&[u8]>) -> MergeDecision {
    let local_text = as_mergeable_text(local);
    let remote_text = as_mergeable_text(remote);

    if let (Some(local_text), Some(remote_text)) = (local_text, remote_text) {
        if let Some(ancestor_text) = ancestor.and_then(as_mergeable_text) {
            let result = diff3::merge(ancestor_text, local_text, remote_text);
            if result.is_clean() {
                return MergeDecision::CleanMerge(result.text.into_bytes());
            }
            debug!(conflicts = result.conflicts, "line merge conflicted");
        }
        // No usable ancestor, or the merge conflicted: containment still
        // resolves one-sided growth without inventing content.
        if is_line_subset(local_text, remote_text) {
            return MergeDecision::AcceptRemote;
        }
        if is_line_subset(remote_text, local_text) {
            return MergeDecision::AcceptLocal;
        }
        return MergeDecision::ConflictRename;
    }

    // Binary (or oversized) content: only hash equality is defined, and the
    // caller already knows the hashes differ.
    MergeDecision::ConflictRename
}

fn as_mergeable_text(data: &[u8]) -> Option<&str> {
    if data.len() > TEXT_MERGE_CAP {
        return None;
    }
    std::str::from_utf8(data).ok()
}

/// True when every line of `needle` appears in `haystack` in order.
fn is_line_subset(needle: &str, haystack: &str) -> bool {
    let mut haystack_lines = haystack.lines();
    'outer: for needle_line in needle.lines() {
        for haystack_line in haystack_lines.by_ref() {
            if needle_line == haystack_line {
                continue 'outer;
            }
        }
        return false;
    }
    true
}

/// Sibling name that preserves the losing side of a conflict:
/// `notes/n.md` → `notes/n (Conflict 2024-01-01).md`.
pub fn conflict_rename_path(path: &str, date: NaiveDate) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(i) => (&path[..i + 1], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    format!("{dir}{stem} (Conflict {}){ext}", date.format("%Y-%m-%d"))
}

/// Recover the merge-base bytes for `path`.
///
/// Preference order: a remote revision whose plaintext digest matches the
/// recorded ancestor hash, then this device's baseline sidecar, then nothing.
pub async fn resolve_ancestor(
    store: &ContentStore,
    config: &SyncConfig,
    path: &str,
    ancestor_hash: Option<&str>,
) -> Option<Vec<u8>> {
    let ancestor_hash = hashing::normalize_digest(ancestor_hash?);

    if store.adapter().supports_history() {
        if let Ok(revisions) = store.list_revisions(path).await {
            for revision in revisions.iter().take(ANCESTOR_REVISION_PROBES) {
                let Ok(content) = store.get_revision_content(path, &revision.id).await else {
                    continue;
                };
                if hashing::content_hash(&content) == ancestor_hash {
                    debug!(path, revision = %revision.id, "ancestor found in revision history");
                    return Some(content);
                }
            }
        }
    }

    let sidecar = config.baseline_dir().join(&ancestor_hash);
    match tokio::fs::read(&sidecar).await {
        Ok(content) if hashing::content_hash(&content) == ancestor_hash => {
            debug!(path, "ancestor found in baseline sidecar");
            Some(content)
        }
        _ => None,
    }
}

/// Record `content` as a future merge base under its own digest.
pub async fn store_baseline(config: &SyncConfig, content: &[u8]) -> Result<(), MergeError> {
    let dir = config.baseline_dir();
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(hashing::content_hash(content));
    tokio::fs::write(&path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_merge_decision() {
        let decision = decide(b"A\nB1\nC\n", b"A\nB\nC2\n", Some(b"A\nB\nC\n"));
        assert_eq!(decision, MergeDecision::CleanMerge(b"A\nB1\nC2\n".to_vec()));
    }

    #[test]
    fn test_conflicting_edit_renames() {
        let decision = decide(b"A\nB2\nC\n", b"A\nB1\nC\n", Some(b"A\nB\nC\n"));
        assert_eq!(decision, MergeDecision::ConflictRename);
    }

    #[test]
    fn test_subset_without_ancestor() {
        // Remote extended the local note.
        assert_eq!(
            decide(b"A\nB\n", b"A\nB\nC\n", None),
            MergeDecision::AcceptRemote
        );
        // Local extended the remote note.
        assert_eq!(
            decide(b"A\nB\nC\n", b"A\nB\n", None),
            MergeDecision::AcceptLocal
        );
        // Divergence with no ancestor keeps both.
        assert_eq!(
            decide(b"A\nX\n", b"A\nY\n", None),
            MergeDecision::ConflictRename
        );
    }

    #[test]
    fn test_binary_content_always_renames() {
        let local = [0u8, 159, 146, 150];
        let remote = [0u8, 1, 2, 3];
        assert_eq!(
            decide(&local, &remote, Some(&[0u8, 1])),
            MergeDecision::ConflictRename
        );
    }

    #[test]
    fn test_subset_is_ordered() {
        assert!(is_line_subset("A\nC\n", "A\nB\nC\n"));
        assert!(!is_line_subset("C\nA\n", "A\nB\nC\n"));
    }

    #[test]
    fn test_conflict_rename_naming() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            conflict_rename_path("notes/n.md", date),
            "notes/n (Conflict 2024-01-01).md"
        );
        assert_eq!(
            conflict_rename_path("README", date),
            "README (Conflict 2024-01-01)"
        );
        assert_eq!(
            conflict_rename_path(".hidden", date),
            ".hidden (Conflict 2024-01-01)"
        );
    }
}
