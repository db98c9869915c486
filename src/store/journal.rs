use std::collections::VecDeque;
use std::sync::RwLock;

use crate::store::key::StoreKey;

/// One recent insertion: the log offset it landed at and the key it was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry<K: StoreKey> {
    offset: u64,
    key: K,
}

impl<K: StoreKey> JournalEntry<K> {
    pub fn new(offset: u64, key: K) -> Self {
        Self { offset, key }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

/// A bounded in-memory ring of recent (offset, key) insertions, in offset
/// order. Scans that resume close to the log tail are answered from here
/// without touching any segment; scans that have fallen behind the retained
/// window get `None` and walk the segments instead.
///
/// Offsets never decrease across insertions. The same key may appear at
/// several offsets (an insert followed by its delete marker, for example).
pub struct Journal<K: StoreKey> {
    entries: RwLock<VecDeque<JournalEntry<K>>>,
    max_entries: usize,
    max_entries_to_return: usize,
}

impl<K: StoreKey> Journal<K> {
    pub fn new(max_entries: usize, max_entries_to_return: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
            max_entries_to_return,
        }
    }

    /// Record an insertion at `offset`. Evicts the oldest entry when full.
    pub fn add_entry(&self, offset: u64, key: K) {
        let mut entries = self.entries.write().unwrap();
        if entries.len() == self.max_entries {
            entries.pop_front();
        }
        entries.push_back(JournalEntry::new(offset, key));
    }

    /// Entries at offsets >= `offset` (or > `offset` when `inclusive` is
    /// false), capped at the configured return limit. Returns `None` when
    /// `offset` precedes the oldest retained entry, meaning the caller must
    /// fall back to a segment walk.
    pub fn get_entries_since(&self, offset: u64, inclusive: bool) -> Option<Vec<JournalEntry<K>>> {
        let entries = self.entries.read().unwrap();
        let first = entries.front()?;
        if offset < first.offset() {
            return None;
        }

        let result: Vec<_> = entries
            .iter()
            .filter(|entry| {
                if inclusive {
                    entry.offset() >= offset
                } else {
                    entry.offset() > offset
                }
            })
            .take(self.max_entries_to_return)
            .cloned()
            .collect();
        Some(result)
    }

    /// Oldest retained offset, if any. Used by tests and diagnostics.
    pub fn first_offset(&self) -> Option<u64> {
        self.entries.read().unwrap().front().map(|e| e.offset())
    }
}
