//! File-entry store (C4): authoritative per-file-entry records and the
//! doubly linked per-client content lists threading all copies of a given
//! content together.
//!
//! Grounded in `original_source/urbackupserver/dao/ServerFilesDao.h` (the
//! required-queries contract: `addFileEntry`, `setNextEntry`,
//! `setPrevEntry`, `setPointedTo`, `delFileEntry`, `getFileEntry`,
//! `lookupEntryIdByPath`) and in `BackupServerHash::deleteFileSQL` in
//! `server_hash.h` for the splice-and-promote logic `remove` implements.
//! Base-spec §3 invariants I1–I3 are what this module exists to preserve.

pub mod correction;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::fileindex::FileIndex;
use crate::hash::{Hash, IndexKey};
use correction::InMemCorrection;

/// The record persisted per concrete file inside a backup (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: u64,
    pub backup_id: u64,
    pub client_id: u32,
    pub incremental_level: u32,
    pub fullpath: PathBuf,
    pub hashpath: PathBuf,
    pub hash: Hash,
    pub size: u64,
    /// Bytes actually occupied on storage after dedup/reflinks; may differ
    /// from `size` (§3).
    pub real_size: u64,
    /// Sibling in the same content's per-client list; 0 = none.
    pub prev_entry: u64,
    pub next_entry: u64,
    /// Exactly one entry in any non-empty content group has this set; it
    /// is the one the index resolves to (§3 I2).
    pub pointed_to: bool,
}

impl FileEntry {
    fn index_key(&self) -> IndexKey {
        IndexKey::new(self.hash, self.size, self.client_id)
    }
}

struct Inner {
    rows: HashMap<u64, FileEntry>,
    /// Disposable per-backup path lookup, mirroring the original's
    /// `createTemporaryPathLookupTable` / `populateTemporaryPathLookupTable`
    /// (SPEC_FULL §11.4): used by the dedup sink to find a delta base in
    /// the previous backup of the same client.
    path_lookup: HashMap<(u64, PathBuf), u64>,
}

/// The file-entry store. One instance backs the whole server; callers
/// needing a sequence of related removes should use
/// [`FileEntryStore::remove_batch`] rather than calling
/// [`FileEntryStore::remove`] in a loop, to share in-memory correction
/// across the batch.
pub struct FileEntryStore {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for FileEntryStore {
    fn default() -> Self {
        FileEntryStore {
            inner: Mutex::new(Inner {
                rows: HashMap::new(),
                path_lookup: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }
}

impl FileEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// §4.3 `add`: writes the row. Caller supplies `prev_entry`/`next_entry`
    /// already resolved (this method does not search for siblings — that
    /// is the dedup sink's job, §4.4). If `update_fileindex` is true and
    /// the entry is `pointed_to`, the index is updated to resolve to it.
    pub fn add(
        &self,
        entry: FileEntry,
        update_fileindex: bool,
        index: &FileIndex,
    ) -> Result<()> {
        let key = entry.index_key();
        let pointed_to = entry.pointed_to;
        let id = entry.id;
        let backup_id = entry.backup_id;
        let fullpath = entry.fullpath.clone();

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.rows.contains_key(&id) {
                bail!("file entry {} already exists", id);
            }
            inner.rows.insert(id, entry);
            inner.path_lookup.insert((backup_id, fullpath), id);
        }

        if update_fileindex && pointed_to {
            index.put_delayed(key, id);
        }
        Ok(())
    }

    pub fn lookup(&self, id: u64) -> Option<FileEntry> {
        self.inner.lock().unwrap().rows.get(&id).cloned()
    }

    /// §11.4 supplemented feature: find the entry at the same relative
    /// path in a given backup, used by the dedup sink's delta path.
    pub fn lookup_by_path(&self, backup_id: u64, path: &std::path::Path) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .path_lookup
            .get(&(backup_id, path.to_path_buf()))
            .copied()
    }

    /// §4.3 `remove`: splices `id` out of its doubly linked list, promoting
    /// a neighbour (preferring `next`) to `pointed_to` if `id` was the
    /// head, and issuing `del_delayed` on the index if `id` was the last
    /// entry for its `(hash,size,client)`.
    pub fn remove(&self, id: u64, index: &FileIndex) -> Result<()> {
        let mut correction = InMemCorrection::new(id, id);
        self.remove_with_correction(id, &mut correction)?;
        self.apply_correction(&correction);
        self.flush_index_updates(&[id], &correction, index)?;
        Ok(())
    }

    /// Batched form of `remove` for cleanup (§4.8): computes splices for
    /// every id in `ids` against a single [`InMemCorrection`] overlay so
    /// that later removes in the same batch see earlier ones' rewrites
    /// without a round trip through the backing table, then flushes the
    /// whole batch at once.
    pub fn remove_batch(&self, ids: &[u64], index: &FileIndex) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let min_id = *ids.iter().min().unwrap();
        let max_id = *ids.iter().max().unwrap();
        let mut correction = InMemCorrection::new(min_id, max_id);

        for &id in ids {
            self.remove_with_correction(id, &mut correction)?;
        }

        self.apply_correction(&correction);
        self.flush_index_updates(ids, &correction, index)?;
        Ok(())
    }

    /// Core splice logic, writing rewrites into `correction` instead of
    /// the backing table directly (§4.3 "in-memory correction" helper).
    fn remove_with_correction(&self, id: u64, correction: &mut InMemCorrection) -> Result<()> {
        let entry = self
            .lookup_corrected(id, correction)
            .ok_or_else(|| anyhow::anyhow!("remove: no such file entry {}", id))?;

        let prev = entry.prev_entry;
        let next = entry.next_entry;

        if prev != 0 {
            correction.set_next(prev, next);
        }
        if next != 0 {
            correction.set_prev(next, prev);
        }

        if entry.pointed_to {
            // id was the head of its per-client list; promote a neighbour,
            // preferring next (§4.3).
            let promoted = if next != 0 {
                Some(next)
            } else if prev != 0 {
                Some(prev)
            } else {
                None
            };

            if let Some(promoted_id) = promoted {
                correction.set_pointed_to(promoted_id, true);
                if promoted_id == next {
                    correction.set_prev(promoted_id, 0);
                } else {
                    correction.set_next(promoted_id, 0);
                }
            }
        }

        correction.set_pointed_to(id, false);
        Ok(())
    }

    /// Read a row, preferring the correction map's pending view of its
    /// sibling links over the backing table (id itself is always read
    /// fresh from the table — only links get overlaid).
    fn lookup_corrected(&self, id: u64, correction: &InMemCorrection) -> Option<FileEntry> {
        let mut entry = self.lookup(id)?;
        if correction.needs_correction(id) {
            if let Some(next) = correction.get_next(id) {
                entry.next_entry = next;
            }
            if let Some(prev) = correction.get_prev(id) {
                entry.prev_entry = prev;
            }
            if let Some(pointed_to) = correction.get_pointed_to(id) {
                entry.pointed_to = pointed_to;
            }
        }
        Some(entry)
    }

    /// Flush the correction map into the backing table. Must happen before
    /// any external observer reads the table (§4.3 invariant) — callers in
    /// this module always call this before returning from `remove`/
    /// `remove_batch`.
    fn apply_correction(&self, correction: &InMemCorrection) {
        if correction.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let ids: std::collections::HashSet<u64> = correction
            .next_entries
            .keys()
            .chain(correction.prev_entries.keys())
            .chain(correction.pointed_to.keys())
            .copied()
            .collect();
        for id in ids {
            if let Some(row) = inner.rows.get_mut(&id) {
                if let Some(next) = correction.get_next(id) {
                    row.next_entry = next;
                }
                if let Some(prev) = correction.get_prev(id) {
                    row.prev_entry = prev;
                }
                if let Some(pointed_to) = correction.get_pointed_to(id) {
                    row.pointed_to = pointed_to;
                }
            }
        }
    }

    /// Remove the rows themselves and push the required index rewrites:
    /// a promoted entry gets `put_delayed`, and a content group left with
    /// zero entries for a client gets `del_delayed`.
    fn flush_index_updates(
        &self,
        removed_ids: &[u64],
        correction: &InMemCorrection,
        index: &FileIndex,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        // Snapshot (key, promoted info) before removing rows, since the
        // removed row still carries hash/size/client needed to build the
        // index key.
        let mut index_puts = Vec::new();
        let mut index_dels = Vec::new();

        for &id in removed_ids {
            let entry = match inner.rows.get(&id) {
                Some(e) => e.clone(),
                None => continue,
            };
            let key = entry.index_key();

            let promoted_id = if entry.prev_entry != 0
                && correction.get_prev(entry.prev_entry).is_none()
                && correction.get_pointed_to(entry.prev_entry) == Some(true)
            {
                Some(entry.prev_entry)
            } else if entry.next_entry != 0
                && correction.get_pointed_to(entry.next_entry) == Some(true)
            {
                Some(entry.next_entry)
            } else if entry.prev_entry != 0
                && correction.get_pointed_to(entry.prev_entry) == Some(true)
            {
                Some(entry.prev_entry)
            } else {
                None
            };

            if entry.pointed_to {
                match promoted_id {
                    Some(pid) => index_puts.push((key, pid)),
                    None => index_dels.push(key),
                }
            }

            inner.path_lookup.remove(&(entry.backup_id, entry.fullpath.clone()));
            inner.rows.remove(&id);
        }

        drop(inner);

        for (key, id) in index_puts {
            index.put_delayed(key, id);
        }
        for key in index_dels {
            index.del_delayed(key);
        }

        Ok(())
    }

    /// Append `new_entry` to the tail of an existing per-client content
    /// list (§4.4 "exact hit": link to an existing copy, insert at the
    /// tail, do not touch the index — the head is unchanged). `new_entry`
    /// must already carry `prev_entry = tail_id` and `pointed_to = false`;
    /// this method additionally rewrites `tail_id`'s `next_entry` to point
    /// at the new row.
    pub fn attach_tail(&self, tail_id: u64, new_entry: FileEntry) -> Result<()> {
        if new_entry.prev_entry != tail_id || new_entry.pointed_to {
            bail!("attach_tail: entry must have prev_entry = tail_id and pointed_to = false");
        }
        let new_id = new_entry.id;
        let mut inner = self.inner.lock().unwrap();
        if !inner.rows.contains_key(&tail_id) {
            bail!("attach_tail: no such tail entry {}", tail_id);
        }
        inner
            .path_lookup
            .insert((new_entry.backup_id, new_entry.fullpath.clone()), new_id);
        inner.rows.insert(new_id, new_entry);
        inner.rows.get_mut(&tail_id).unwrap().next_entry = new_id;
        Ok(())
    }

    /// Walk a per-client content list from `head_id` to its tail (the
    /// entry with `next_entry = 0`). Used by the dedup sink to find where
    /// to append an "exact hit" (§4.4).
    pub fn tail_of(&self, head_id: u64) -> Option<FileEntry> {
        let mut current = self.lookup(head_id)?;
        loop {
            if current.next_entry == 0 {
                return Some(current);
            }
            current = self.lookup(current.next_entry)?;
        }
    }

    /// Range query used by cleanup to iterate entries for a backup
    /// (§4.8).
    pub fn entries_for_backup(&self, backup_id: u64) -> Vec<FileEntry> {
        self.inner
            .lock()
            .unwrap()
            .rows
            .values()
            .filter(|e| e.backup_id == backup_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
