// Path participation rules.
//
// Two predicates with different consequences:
// - `should_ignore`: the path does not take part in sync at all.
// - `should_not_be_on_remote`: the path may exist locally, but is never
//   pushed, and is deleted server-side when a stray copy is found there.

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

/// Remote area reserved for engine state (indices, locks, vault key).
const ENGINE_DATA_PREFIX: &str = "data/";
/// Remote area used by the encryption migration (shadow tree, dated backups).
const MIGRATION_PREFIX: &str = "migration/";
/// Local trash folder; never synced.
const TRASH_PREFIX: &str = ".trash/";
/// Staging suffix used by atomic writes.
const STAGING_SUFFIX: &str = ".sync-tmp";

/// Host configuration dot-folder. Most of it syncs (settings follow the user
/// across devices); the entries below are per-device transient state.
const CONFIG_DIR: &str = ".config";
const CONFIG_LOCAL_ONLY: &[&str] = &[
    "workspace.json",
    "workspace-mobile.json",
    "cache",
    "indexeddb",
];

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid exclusion pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
}

#[derive(Debug)]
pub struct PathFilter {
    user_globs: GlobSet,
}

impl PathFilter {
    /// Compile user exclusion patterns (`*`, `?`, `**`).
    pub fn new(user_patterns: &[String]) -> Result<Self, FilterError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in user_patterns {
            let glob = Glob::new(pattern).map_err(|source| FilterError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let user_globs = builder.build().map_err(|source| FilterError::Pattern {
            pattern: user_patterns.join(", "),
            source,
        })?;
        Ok(PathFilter { user_globs })
    }

    pub fn empty() -> Self {
        PathFilter {
            user_globs: GlobSet::empty(),
        }
    }

    /// The path takes no part in sync.
    pub fn should_ignore(&self, path: &str) -> bool {
        if path.starts_with(ENGINE_DATA_PREFIX)
            || path.starts_with(MIGRATION_PREFIX)
            || path.starts_with(TRASH_PREFIX)
            || path.ends_with(STAGING_SUFFIX)
        {
            return true;
        }
        self.user_globs.is_match(path)
    }

    /// The path is fine locally but must not exist on the remote.
    pub fn should_not_be_on_remote(&self, path: &str) -> bool {
        let Some(rest) = path
            .strip_prefix(CONFIG_DIR)
            .and_then(|r| r.strip_prefix('/'))
        else {
            return false;
        };
        CONFIG_LOCAL_ONLY
            .iter()
            .any(|entry| rest == *entry || rest.starts_with(&format!("{entry}/")))
    }

    /// Combined check used when building the push candidate list.
    pub fn participates(&self, path: &str) -> bool {
        !self.should_ignore(path) && !self.should_not_be_on_remote(path)
    }
}
