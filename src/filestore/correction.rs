//! In-memory correction map for batched cleanup removes (§4.3).
//!
//! Grounded directly in `BackupServerHash::SInMemCorrection` in
//! `original_source/urbackupserver/server_hash.h`: cleanup removing a
//! large batch of file entries produces a dependency graph of sibling-link
//! rewrites, and re-reading each row from the backing store mid-batch
//! would be both slow and (without an in-transaction read-your-writes
//! view) possibly stale. The correction map lets a batch operation see its
//! own pending rewrites before they are flushed.

use std::collections::HashMap;

/// Pending sibling-link rewrites for a single cleanup batch, valid for ids
/// in `[min_correct, max_correct]`. Must be flushed to the backing store
/// (via [`super::FileEntryStore::apply_correction`]) before any external
/// reader observes the table — see the invariant note on
/// [`InMemCorrection::needs_correction`].
#[derive(Debug, Default)]
pub struct InMemCorrection {
    pub next_entries: HashMap<u64, u64>,
    pub prev_entries: HashMap<u64, u64>,
    pub pointed_to: HashMap<u64, bool>,
    pub min_correct: u64,
    pub max_correct: u64,
}

impl InMemCorrection {
    pub fn new(min_correct: u64, max_correct: u64) -> Self {
        InMemCorrection {
            next_entries: HashMap::new(),
            prev_entries: HashMap::new(),
            pointed_to: HashMap::new(),
            min_correct,
            max_correct,
        }
    }

    /// Whether `id` falls in this batch's id range and should therefore be
    /// checked against the correction map before falling back to the
    /// backing store.
    pub fn needs_correction(&self, id: u64) -> bool {
        id >= self.min_correct && id <= self.max_correct
    }

    pub fn set_next(&mut self, id: u64, next: u64) {
        self.next_entries.insert(id, next);
    }

    pub fn set_prev(&mut self, id: u64, prev: u64) {
        self.prev_entries.insert(id, prev);
    }

    pub fn set_pointed_to(&mut self, id: u64, pointed_to: bool) {
        self.pointed_to.insert(id, pointed_to);
    }

    pub fn get_next(&self, id: u64) -> Option<u64> {
        self.next_entries.get(&id).copied()
    }

    pub fn get_prev(&self, id: u64) -> Option<u64> {
        self.prev_entries.get(&id).copied()
    }

    pub fn get_pointed_to(&self, id: u64) -> Option<bool> {
        self.pointed_to.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.next_entries.is_empty() && self.prev_entries.is_empty() && self.pointed_to.is_empty()
    }
}
