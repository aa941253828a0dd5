//! Dedup sink (C5): given a freshly received file, decide whether to link
//! to an existing copy, patch from an older copy, or store fresh, while
//! preserving invariants I1-I5 (base spec §3, §4.4).

pub mod linkpolicy;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use log::{info, warn};

use crate::config::ServerConfig;
use crate::error::CoreError;
use crate::fileindex::FileIndex;
use crate::filestore::{FileEntry, FileEntryStore};
use crate::fscap::BackupFileSystem;
use crate::hash::{Hash, IndexKey};

/// Per-backup ingest accounting (§11.3 supplement), mirroring the
/// original's `addIncomingFile`/`getIncomingStats` direction split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Total bytes the client sent us for this backup, regardless of
    /// whether they ended up stored or deduplicated away.
    pub received_bytes: u64,
    /// Bytes actually written to fresh storage (misses + below-min-size
    /// copies).
    pub stored_bytes: u64,
    /// Bytes saved by linking instead of storing (exact hits + any-client
    /// hits above the minimum link size).
    pub linked_bytes: u64,
    pub files_failed: u64,
}

impl IngestStats {
    fn record_stored(&mut self, size: u64) {
        self.received_bytes += size;
        self.stored_bytes += size;
    }

    fn record_linked(&mut self, size: u64) {
        self.received_bytes += size;
        self.linked_bytes += size;
    }
}

/// What the sink decided to do with an incoming file, returned for
/// logging/testing; the resulting `FileEntry` is always already committed
/// by the time this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// §4.4 "exact hit": linked to an existing copy already on this
    /// client's chain.
    ExactHit { source_entry: u64 },
    /// §4.4 "any-client hit": linked (reflink or hardlink) to a copy held
    /// by a different client.
    AnyClientHit { source_client: u32, source_entry: u64 },
    /// §11.4 supplemented step 6 "delta path": no dedup hit, but the same
    /// relative path existed in the client's previous backup. Stored
    /// fresh like a miss (the whole file already arrived), but the prior
    /// version is named as the patch base C6 should have used over the
    /// wire.
    DeltaBase { prev_entry: u64 },
    /// §4.4 "miss": stored as a fresh copy.
    Miss,
}

/// Description of a file the sink is about to ingest. `source_path` is
/// where the just-received bytes currently live (e.g. a staging temp
/// file); `dest_path` is where it should end up inside the new backup's
/// tree.
pub struct IncomingFile<'a> {
    pub backup_id: u64,
    pub client_id: u32,
    pub incremental_level: u32,
    pub dest_path: &'a Path,
    pub hashpath: &'a Path,
    pub hash: Hash,
    pub size: u64,
    pub source_path: &'a Path,
    /// The client's previous backup id, if one exists, used for the
    /// §11.4 step-6 delta-path lookup. `None` for a client's first
    /// backup.
    pub prev_backup_id: Option<u64>,
}

pub struct DedupSink<FS: BackupFileSystem> {
    fs: Arc<FS>,
    index: FileIndex,
    store: Arc<FileEntryStore>,
    config: ServerConfig,
    next_id: AtomicU32,
    stats: Mutex<IngestStats>,
}

impl<FS: BackupFileSystem> DedupSink<FS> {
    pub fn new(
        fs: Arc<FS>,
        index: FileIndex,
        store: Arc<FileEntryStore>,
        config: ServerConfig,
    ) -> Self {
        DedupSink {
            fs,
            index,
            store,
            config,
            next_id: AtomicU32::new(1),
            stats: Mutex::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> IngestStats {
        *self.stats.lock().unwrap()
    }

    /// §4.4 per-file decision. Returns the id of the committed `FileEntry`
    /// and what the sink decided to do.
    pub fn ingest(&self, file: IncomingFile<'_>) -> Result<(u64, DedupOutcome)> {
        let mut attempt = 0;
        loop {
            match self.try_ingest(&file) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if is_not_enough_space(&err) && attempt < self.config.nospc_retries {
                        attempt += 1;
                        warn!(
                            "dedup sink: out of space storing {:?}, retry {}/{}",
                            file.dest_path, attempt, self.config.nospc_retries
                        );
                        if !self.handle_not_enough_space(file.dest_path) {
                            self.stats.lock().unwrap().files_failed += 1;
                            return Err(err);
                        }
                        continue;
                    }
                    self.stats.lock().unwrap().files_failed += 1;
                    return Err(err);
                }
            }
        }
    }

    fn try_ingest(&self, file: &IncomingFile<'_>) -> Result<(u64, DedupOutcome)> {
        let key = IndexKey::new(file.hash, file.size, file.client_id);

        if linkpolicy::below_min_link_size(file.size, self.config.link_file_min_size) {
            return self.store_fresh(file, DedupOutcome::Miss);
        }

        if let Some(existing_id) = self.index.get_with_cache_exact(&key)? {
            match self.try_exact_hit(file, existing_id) {
                Ok(result) => return Ok(result),
                Err(err) if is_corrective_repairable(&err) => {
                    warn!(
                        "dedup sink: exact-hit path repair failed for entry {}, falling back",
                        existing_id
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let wildcard = IndexKey::wildcard(file.hash, file.size);
        if let Some((source_client, source_entry)) = self.index.get_with_cache(&wildcard)? {
            if source_client != file.client_id {
                match self.try_any_client_hit(file, source_client, source_entry) {
                    Ok(result) => return Ok(result),
                    Err(err) if is_corrective_repairable(&err) => {
                        warn!(
                            "dedup sink: any-client-hit path repair failed for entry {}, storing fresh",
                            source_entry
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if let Some(prev_backup_id) = file.prev_backup_id {
            if let Some(prev_entry) = self.store.lookup_by_path(prev_backup_id, file.dest_path) {
                return self.store_fresh(file, DedupOutcome::DeltaBase { prev_entry });
            }
        }

        self.store_fresh(file, DedupOutcome::Miss)
    }

    /// §4.4 branch 1: content already on this client's chain. Link into
    /// the new backup's tree and append at the tail; head/index unchanged.
    fn try_exact_hit(&self, file: &IncomingFile<'_>, existing_head: u64) -> Result<(u64, DedupOutcome)> {
        let tail = self
            .store
            .tail_of(existing_head)
            .ok_or_else(|| anyhow::anyhow!("exact hit: chain head {} missing", existing_head))?;

        if !self.fs.exists(&tail.fullpath) {
            return Err(self.repair_or_fail(&tail)?);
        }

        self.link_file(&tail.fullpath, file.dest_path)?;

        let id = self.alloc_id();
        let entry = FileEntry {
            id,
            backup_id: file.backup_id,
            client_id: file.client_id,
            incremental_level: file.incremental_level,
            fullpath: file.dest_path.to_path_buf(),
            hashpath: file.hashpath.to_path_buf(),
            hash: file.hash,
            size: file.size,
            real_size: 0,
            prev_entry: tail.id,
            next_entry: 0,
            pointed_to: false,
        };
        self.store.attach_tail(tail.id, entry)?;
        self.stats.lock().unwrap().record_linked(file.size);
        info!("dedup: exact hit, linked {:?} to {}", file.dest_path, tail.fullpath.display());
        Ok((id, DedupOutcome::ExactHit { source_entry: tail.id }))
    }

    /// §4.4 branch 2: content exists on another client. Reflink (or
    /// hardlink, under the safety margin) and become the new head.
    fn try_any_client_hit(
        &self,
        file: &IncomingFile<'_>,
        source_client: u32,
        source_entry: u64,
    ) -> Result<(u64, DedupOutcome)> {
        let source = self
            .store
            .lookup(source_entry)
            .ok_or_else(|| anyhow::anyhow!("any-client hit: entry {} missing", source_entry))?;

        if !self.fs.exists(&source.fullpath) {
            return Err(self.repair_or_fail(&source)?);
        }

        match self.fs.reflink(&source.fullpath, file.dest_path) {
            Ok(()) => {}
            Err(_) => {
                if !linkpolicy::hardlink_is_safe(
                    self.fs.as_ref(),
                    &source.fullpath,
                    self.config.hardlink_safety_margin,
                ) {
                    // §4.4 step 3: refuse to hardlink, fall back to miss.
                    return self.store_fresh(file, DedupOutcome::Miss);
                }
                self.fs
                    .hardlink(&source.fullpath, file.dest_path)
                    .map_err(|e| anyhow::anyhow!("hardlink {:?}: {}", file.dest_path, e))?;
            }
        }

        let id = self.alloc_id();
        let entry = FileEntry {
            id,
            backup_id: file.backup_id,
            client_id: file.client_id,
            incremental_level: file.incremental_level,
            fullpath: file.dest_path.to_path_buf(),
            hashpath: file.hashpath.to_path_buf(),
            hash: file.hash,
            size: file.size,
            real_size: 0,
            prev_entry: 0,
            next_entry: 0,
            pointed_to: true,
        };
        self.store.add(entry, true, &self.index)?;
        self.stats.lock().unwrap().record_linked(file.size);
        info!(
            "dedup: any-client hit (client {}), linked {:?}",
            source_client, file.dest_path
        );
        Ok((id, DedupOutcome::AnyClientHit { source_client, source_entry }))
    }

    /// §4.4 branch 3 / minimum-size gate / safety-margin fallback: store
    /// the whole upload as a new storage file and become the new head.
    fn store_fresh(
        &self,
        file: &IncomingFile<'_>,
        outcome: DedupOutcome,
    ) -> Result<(u64, DedupOutcome)> {
        if let Some(parent) = file.dest_path.parent() {
            self.fs
                .create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("create_dir_all {:?}: {}", parent, e))?;
        }
        let real_size = self
            .fs
            .copy_file(file.source_path, file.dest_path)
            .map_err(|e| anyhow::anyhow!("copy {:?}: {}", file.dest_path, e))?;

        let id = self.alloc_id();
        let entry = FileEntry {
            id,
            backup_id: file.backup_id,
            client_id: file.client_id,
            incremental_level: file.incremental_level,
            fullpath: file.dest_path.to_path_buf(),
            hashpath: file.hashpath.to_path_buf(),
            hash: file.hash,
            size: file.size,
            real_size,
            prev_entry: 0,
            next_entry: 0,
            pointed_to: true,
        };
        self.store.add(entry, true, &self.index)?;
        self.stats.lock().unwrap().record_stored(file.size);
        Ok((id, outcome))
    }

    fn link_file(&self, source: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            self.fs
                .create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("create_dir_all {:?}: {}", parent, e))?;
        }
        match self.fs.reflink(source, dest) {
            Ok(()) => Ok(()),
            Err(_) => self
                .fs
                .hardlink(source, dest)
                .map_err(|e| anyhow::anyhow!("hardlink {:?}: {}", dest, e)),
        }
    }

    /// §4.4 step 5: corrective path repair is the cleanup subsystem's
    /// territory (it tracks known-moved-client locations); the sink's
    /// contract here is just "if the path can't be opened and no repair
    /// is available, treat as a miss and log" — signaled to callers as a
    /// distinguishable error so `try_ingest` can fall through.
    fn repair_or_fail(&self, entry: &FileEntry) -> Result<anyhow::Error> {
        warn!(
            "dedup: storage path {:?} for entry {} is missing, no repair available",
            entry.fullpath, entry.id
        );
        Ok(anyhow::Error::new(CoreError::Io {
            path: entry.fullpath.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "dedup source missing"),
        }))
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) as u64
    }

    /// §4.4 failure semantics: out-of-space is reported synchronously via
    /// a callback that may free space and signal retry. This reference
    /// implementation has no reclaimable cache of its own, so it always
    /// reports "no space could be freed"; a real deployment would plug in
    /// e.g. an opportunistic old-backup eviction here.
    fn handle_not_enough_space(&self, _path: &Path) -> bool {
        false
    }
}

fn is_not_enough_space(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CoreError>()
        .map(|e| matches!(e, CoreError::NotEnoughSpace { .. }))
        .unwrap_or(false)
}

fn is_corrective_repairable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CoreError>()
        .map(|e| matches!(e, CoreError::Io { .. }))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileindex::store::BTreeStore;
    use crate::fscap::StdFilesystem;
    use crate::hash::hash_bytes;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_sink(dir: &std::path::Path) -> DedupSink<StdFilesystem> {
        let index = FileIndex::spawn(Arc::new(BTreeStore::new()), 4, 1000, Duration::from_millis(20));
        let store = Arc::new(FileEntryStore::new());
        let mut config = ServerConfig::default();
        config.backup_root = dir.to_path_buf();
        DedupSink::new(Arc::new(StdFilesystem), index, store, config)
    }

    fn write_source(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn miss_stores_fresh_and_becomes_head() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let content = vec![0x42u8; 4096];
        let src = write_source(dir.path(), "src1", &content);
        let dest = dir.path().join("backup1/file1");

        let (id, outcome) = sink
            .ingest(IncomingFile {
                backup_id: 1,
                client_id: 1,
                incremental_level: 0,
                dest_path: &dest,
                hashpath: &dir.path().join("backup1/file1.hash"),
                hash: hash_bytes(&content),
                size: content.len() as u64,
                source_path: &src,
                prev_backup_id: None,
            })
            .unwrap();

        assert_eq!(outcome, DedupOutcome::Miss);
        assert!(dest.exists());
        let entry = sink.store.lookup(id).unwrap();
        assert!(entry.pointed_to);
        assert_eq!(sink.stats().stored_bytes, content.len() as u64);
    }

    #[test]
    fn exact_hit_links_and_appends_to_tail() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let content = vec![0x7eu8; 8192];
        let hash = hash_bytes(&content);

        let src1 = write_source(dir.path(), "src1", &content);
        let dest1 = dir.path().join("backup1/file1");
        let (head_id, _) = sink
            .ingest(IncomingFile {
                backup_id: 1,
                client_id: 1,
                incremental_level: 0,
                dest_path: &dest1,
                hashpath: &dir.path().join("backup1/file1.hash"),
                hash,
                size: content.len() as u64,
                source_path: &src1,
                prev_backup_id: None,
            })
            .unwrap();

        let src2 = write_source(dir.path(), "src2", &content);
        let dest2 = dir.path().join("backup2/file1");
        let (tail_id, outcome) = sink
            .ingest(IncomingFile {
                backup_id: 2,
                client_id: 1,
                incremental_level: 1,
                dest_path: &dest2,
                hashpath: &dir.path().join("backup2/file1.hash"),
                hash,
                size: content.len() as u64,
                source_path: &src2,
                prev_backup_id: Some(1),
            })
            .unwrap();

        assert_eq!(outcome, DedupOutcome::ExactHit { source_entry: head_id });
        assert!(dest2.exists());
        let tail = sink.store.lookup(tail_id).unwrap();
        assert!(!tail.pointed_to);
        assert_eq!(tail.prev_entry, head_id);
        assert_eq!(sink.stats().linked_bytes, content.len() as u64);
    }

    #[test]
    fn any_client_hit_links_across_clients_as_new_head() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let content = vec![0x11u8; 8192];
        let hash = hash_bytes(&content);

        let src1 = write_source(dir.path(), "src1", &content);
        let dest1 = dir.path().join("backup1/file1");
        let (client1_id, _) = sink
            .ingest(IncomingFile {
                backup_id: 1,
                client_id: 1,
                incremental_level: 0,
                dest_path: &dest1,
                hashpath: &dir.path().join("backup1/file1.hash"),
                hash,
                size: content.len() as u64,
                source_path: &src1,
                prev_backup_id: None,
            })
            .unwrap();

        let src2 = write_source(dir.path(), "src2", &content);
        let dest2 = dir.path().join("backup1_client2/file1");
        let (client2_id, outcome) = sink
            .ingest(IncomingFile {
                backup_id: 3,
                client_id: 2,
                incremental_level: 0,
                dest_path: &dest2,
                hashpath: &dir.path().join("backup1_client2/file1.hash"),
                hash,
                size: content.len() as u64,
                source_path: &src2,
                prev_backup_id: None,
            })
            .unwrap();

        assert_eq!(
            outcome,
            DedupOutcome::AnyClientHit { source_client: 1, source_entry: client1_id }
        );
        let entry2 = sink.store.lookup(client2_id).unwrap();
        assert!(entry2.pointed_to);
        assert!(dest2.exists());
    }

    #[test]
    fn files_below_min_link_size_are_never_linked() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let content = vec![0x33u8; 10]; // well under LINK_FILE_MIN_SIZE
        let hash = hash_bytes(&content);

        let src1 = write_source(dir.path(), "src1", &content);
        let dest1 = dir.path().join("backup1/tiny");
        sink.ingest(IncomingFile {
            backup_id: 1,
            client_id: 1,
            incremental_level: 0,
            dest_path: &dest1,
            hashpath: &dir.path().join("backup1/tiny.hash"),
            hash,
            size: content.len() as u64,
            source_path: &src1,
            prev_backup_id: None,
        })
        .unwrap();

        let src2 = write_source(dir.path(), "src2", &content);
        let dest2 = dir.path().join("backup2/tiny");
        let (_, outcome) = sink
            .ingest(IncomingFile {
                backup_id: 2,
                client_id: 1,
                incremental_level: 1,
                dest_path: &dest2,
                hashpath: &dir.path().join("backup2/tiny.hash"),
                hash,
                size: content.len() as u64,
                source_path: &src2,
                prev_backup_id: None,
            })
            .unwrap();

        assert_eq!(outcome, DedupOutcome::Miss);
        assert!(dest2.exists());
    }

    #[test]
    fn delta_path_finds_previous_backups_entry_at_same_path() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());

        let old_content = vec![0x55u8; 8192];
        let src1 = write_source(dir.path(), "src1", &old_content);
        let dest = dir.path().join("docs/report.pdf");
        let (prev_id, _) = sink
            .ingest(IncomingFile {
                backup_id: 1,
                client_id: 1,
                incremental_level: 0,
                dest_path: &dest,
                hashpath: &dir.path().join("docs/report.pdf.hash"),
                hash: hash_bytes(&old_content),
                size: old_content.len() as u64,
                source_path: &src1,
                prev_backup_id: None,
            })
            .unwrap();

        // Same relative path, changed content: no index hit, but the
        // previous backup's entry at this path is the delta base.
        let new_content = vec![0x66u8; 8192];
        let src2 = write_source(dir.path(), "src2", &new_content);
        let (_, outcome) = sink
            .ingest(IncomingFile {
                backup_id: 2,
                client_id: 1,
                incremental_level: 1,
                dest_path: &dest,
                hashpath: &dir.path().join("docs/report.pdf.hash"),
                hash: hash_bytes(&new_content),
                size: new_content.len() as u64,
                source_path: &src2,
                prev_backup_id: Some(1),
            })
            .unwrap();

        assert_eq!(outcome, DedupOutcome::DeltaBase { prev_entry: prev_id });
        assert_eq!(std::fs::read(&dest).unwrap(), new_content);
    }
}
