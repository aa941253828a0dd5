//! The [`OrderedStore`] capability and a reference in-memory implementation.
//!
//! Design notes (base spec §9): "`FileIndex` is a capability {`get`, `put`,
//! `del`, `iterate`, `transactions`}; implementations use an LMDB-style
//! ordered key/value store on the reference implementation but any ordered
//! persistent map will do." This module defines that capability as a
//! trait so [`super::FileIndex`]'s buffered-write model (§4.2) is testable
//! against a plain `BTreeMap` without pulling in an embedded-database
//! dependency the teacher pack doesn't otherwise use.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::hash::IndexKey;

/// An ordered, persistent `IndexKey -> entry_id` map with the transaction
/// and iteration primitives the buffered-write flusher needs.
///
/// `entry_id` is the `FileEntry::id` the key resolves to; a value of `0`
/// is not a valid stored entry id and is instead the flusher's own
/// sentinel for "this key was deleted" (§4.2 buffered-write model).
pub trait OrderedStore: Send + Sync {
    fn get(&self, key: &IndexKey) -> Result<Option<u64>>;

    /// Any client holding this content, ignoring `key.client`. Resolves to
    /// the smallest client id with a non-deleted entry (§8 S5).
    fn get_any_client(&self, key: &IndexKey) -> Result<Option<(u32, u64)>>;

    /// All clients holding this content, keyed by client id.
    fn get_all_clients(&self, key: &IndexKey) -> Result<BTreeMap<u32, u64>>;

    fn start_transaction(&self) -> Result<()>;
    fn put(&self, key: &IndexKey, value: u64) -> Result<()>;
    fn del(&self, key: &IndexKey) -> Result<()>;
    fn commit_transaction(&self) -> Result<()>;

    /// Bulk rebuild from scratch. Only rows with `pointed_to = 1` become
    /// index entries (§4.2 `create`).
    fn create(&self, rows: &mut dyn Iterator<Item = (IndexKey, u64, bool)>) -> Result<()>;

    /// Snapshot of every live entry, for GC / diagnostics. Not part of the
    /// hot path; implementations may hold a lock for the duration.
    fn iterate_all(&self) -> Result<Vec<(IndexKey, u64)>>;
}

/// Reference `OrderedStore` backed by a `BTreeMap`, serving the role the
/// design notes explicitly allow: any ordered persistent map. A real
/// deployment would back this with an mmap'd B-tree file so that
/// `commit_transaction` durably fsyncs; this implementation keeps
/// everything resident and is meant for tests and for small, RAM-resident
/// indices.
pub struct BTreeStore {
    inner: Mutex<BTreeMap<IndexKey, u64>>,
}

impl Default for BTreeStore {
    fn default() -> Self {
        BTreeStore {
            inner: Mutex::new(BTreeMap::new()),
        }
    }
}

impl BTreeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderedStore for BTreeStore {
    fn get(&self, key: &IndexKey) -> Result<Option<u64>> {
        Ok(self.inner.lock().unwrap().get(key).copied())
    }

    fn get_any_client(&self, key: &IndexKey) -> Result<Option<(u32, u64)>> {
        let map = self.inner.lock().unwrap();
        let prefix = key.hash_size_prefix();
        Ok(map
            .range(*key..)
            .take_while(|(k, _)| k.hash_size_prefix() == prefix)
            .map(|(k, v)| (k.client, *v))
            .next())
    }

    fn get_all_clients(&self, key: &IndexKey) -> Result<BTreeMap<u32, u64>> {
        let map = self.inner.lock().unwrap();
        let prefix = key.hash_size_prefix();
        let lower = IndexKey::new(key.hash, key.size, 0);
        Ok(map
            .range(lower..)
            .take_while(|(k, _)| k.hash_size_prefix() == prefix)
            .map(|(k, v)| (k.client, *v))
            .collect())
    }

    fn start_transaction(&self) -> Result<()> {
        Ok(())
    }

    fn put(&self, key: &IndexKey, value: u64) -> Result<()> {
        self.inner.lock().unwrap().insert(*key, value);
        Ok(())
    }

    fn del(&self, key: &IndexKey) -> Result<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        Ok(())
    }

    fn create(&self, rows: &mut dyn Iterator<Item = (IndexKey, u64, bool)>) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        map.clear();
        for (key, value, pointed_to) in rows {
            if pointed_to {
                map.insert(key, value);
            }
        }
        Ok(())
    }

    fn iterate_all(&self) -> Result<Vec<(IndexKey, u64)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    #[test]
    fn any_client_returns_smallest_client() {
        let store = BTreeStore::new();
        let h = hash_bytes(b"content");
        store.put(&IndexKey::new(h, 10, 5), 100).unwrap();
        store.put(&IndexKey::new(h, 10, 2), 200).unwrap();
        let (client, id) = store
            .get_any_client(&IndexKey::wildcard(h, 10))
            .unwrap()
            .unwrap();
        assert_eq!(client, 2);
        assert_eq!(id, 200);
    }

    #[test]
    fn all_clients_returns_every_entry_for_content() {
        let store = BTreeStore::new();
        let h = hash_bytes(b"content");
        store.put(&IndexKey::new(h, 10, 5), 100).unwrap();
        store.put(&IndexKey::new(h, 10, 2), 200).unwrap();
        store.put(&IndexKey::new(h, 11, 2), 999).unwrap();
        let all = store.get_all_clients(&IndexKey::wildcard(h, 10)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&5], 100);
        assert_eq!(all[&2], 200);
    }
}
