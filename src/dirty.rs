// Paths modified locally since the last successful push.
//
// The host feeds file events in; the orchestrator and transfer queue take
// paths out as pushes confirm. Shared freely across tasks.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    paths: Arc<Mutex<BTreeSet<String>>>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host event entry point: a file was created, modified or renamed.
    pub fn mark(&self, path: &str) {
        self.paths.lock().unwrap().insert(path.to_string());
    }

    /// Called after a successful push of `path`.
    pub fn clear(&self, path: &str) {
        self.paths.lock().unwrap().remove(path);
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.paths.lock().unwrap().contains(path)
    }

    /// Sorted snapshot of the current dirty set.
    pub fn snapshot(&self) -> Vec<String> {
        self.paths.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.paths.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_clear() {
        let dirty = DirtyTracker::new();
        dirty.mark("b.md");
        dirty.mark("a.md");
        dirty.mark("a.md");
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty.snapshot(), vec!["a.md", "b.md"]);

        dirty.clear("a.md");
        assert!(!dirty.is_dirty("a.md"));
        assert!(dirty.is_dirty("b.md"));
    }

    #[test]
    fn test_clones_share_state() {
        let dirty = DirtyTracker::new();
        let other = dirty.clone();
        other.mark("x.md");
        assert!(dirty.is_dirty("x.md"));
    }
}
