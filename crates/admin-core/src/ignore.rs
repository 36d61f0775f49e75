//! One-shot echo suppression.
//!
//! Before the sync engine writes or deletes a local file it marks the path
//! here together with the kind of change it is about to cause. The next
//! watcher report for that path is swallowed only if it is that same kind of
//! change. Any report consumes the entry: when the watcher coalesced our
//! write with a user's delete, the delete is the user's and must go out.

use std::collections::HashMap;
use std::sync::Mutex;

/// The change a sync write is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Write,
    Delete,
}

#[derive(Default)]
pub struct IgnoreSet {
    paths: Mutex<HashMap<String, Echo>>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress the next `echo` report for `path`. A later mark replaces an earlier one.
    pub fn insert(&self, path: &str, echo: Echo) {
        self.lock().insert(path.to_string(), echo);
    }

    /// Consume the entry for `path`.
    ///
    /// Returns true if the entry expected exactly this report, which must
    /// then be suppressed.
    pub fn take(&self, path: &str, reported: Echo) -> bool {
        self.lock().remove(path) == Some(reported)
    }

    /// Drop an entry without consuming a report, e.g. after a failed write.
    pub fn forget(&self, path: &str) {
        self.lock().remove(path);
    }

    /// The change currently expected for `path`, if any.
    pub fn expected(&self, path: &str) -> Option<Echo> {
        self.lock().get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Echo>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_suppresses_exactly_once() {
        let ignore = IgnoreSet::new();
        ignore.insert("/a.txt", Echo::Write);

        assert!(ignore.take("/a.txt", Echo::Write));
        assert!(!ignore.take("/a.txt", Echo::Write));
        assert!(ignore.is_empty());
    }

    #[test]
    fn test_unrelated_paths_pass() {
        let ignore = IgnoreSet::new();
        ignore.insert("/a.txt", Echo::Write);

        assert!(!ignore.take("/b.txt", Echo::Write));
        assert_eq!(ignore.expected("/a.txt"), Some(Echo::Write));
    }

    #[test]
    fn test_other_kind_of_change_passes_and_clears_entry() {
        let ignore = IgnoreSet::new();
        ignore.insert("/a.txt", Echo::Write);

        // A user delete coalesced over our write
        assert!(!ignore.take("/a.txt", Echo::Delete));
        assert!(ignore.is_empty());

        // A later genuine write is not swallowed by the stale entry
        assert!(!ignore.take("/a.txt", Echo::Write));
    }

    #[test]
    fn test_later_mark_replaces_earlier() {
        let ignore = IgnoreSet::new();
        ignore.insert("/a.txt", Echo::Write);
        ignore.insert("/a.txt", Echo::Delete);

        assert!(ignore.take("/a.txt", Echo::Delete));
        assert!(ignore.is_empty());
    }
}
