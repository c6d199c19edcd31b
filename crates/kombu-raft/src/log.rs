//! In-memory replicated log.
//!
//! The leader only depends on append/get/truncate with contiguous 1-based
//! indexes; persistence, segmentation, and compaction belong to the storage
//! layer that backs this in a full server.

use crate::types::{Entry, LogIndex, Term};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordered log of replicated entries.
///
/// Cheaply cloneable; clones share the same underlying log.
#[derive(Clone, Default)]
pub struct Log {
    entries: Arc<RwLock<BTreeMap<LogIndex, Entry>>>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the next index and return that index.
    pub fn append(&self, entry: Entry) -> LogIndex {
        let mut entries = self.entries.write();
        let index = entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(LogIndex::ZERO)
            .next();
        entries.insert(index, entry);
        index
    }

    /// Get the entry at `index`, if present.
    pub fn get(&self, index: LogIndex) -> Option<Entry> {
        self.entries.read().get(&index).cloned()
    }

    /// Get entries in `[from, to)` in ascending index order.
    pub fn get_range(&self, from: LogIndex, to: LogIndex) -> Vec<Entry> {
        self.entries
            .read()
            .range(from..to)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Highest index in the log, or zero if empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    /// Term of the last entry, or zero if empty.
    pub fn last_term(&self) -> Term {
        self.entries
            .read()
            .iter()
            .next_back()
            .map(|(_, e)| e.term())
            .unwrap_or(Term::ZERO)
    }

    /// Delete all entries with index >= `from`.
    pub fn truncate(&self, from: LogIndex) {
        let mut entries = self.entries.write();
        entries.split_off(&from);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(term: u64) -> Entry {
        Entry::Initialize {
            term: Term(term),
            timestamp: 0,
        }
    }

    #[test]
    fn test_append_assigns_contiguous_indexes() {
        let log = Log::new();
        assert_eq!(log.append(noop(1)), LogIndex(1));
        assert_eq!(log.append(noop(1)), LogIndex(2));
        assert_eq!(log.last_index(), LogIndex(2));
        assert_eq!(log.last_term(), Term(1));
    }

    #[test]
    fn test_get_range() {
        let log = Log::new();
        for _ in 0..5 {
            log.append(noop(1));
        }
        let range = log.get_range(LogIndex(2), LogIndex(4));
        assert_eq!(range.len(), 2);
    }

    #[test]
    fn test_truncate() {
        let log = Log::new();
        for _ in 0..5 {
            log.append(noop(1));
        }
        log.truncate(LogIndex(3));
        assert_eq!(log.last_index(), LogIndex(2));
        assert!(log.get(LogIndex(3)).is_none());
        // Appending resumes at the truncation point.
        assert_eq!(log.append(noop(2)), LogIndex(3));
    }
}
