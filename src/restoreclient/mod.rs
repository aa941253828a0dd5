//! Client restore download (C8): receive the engine's file list,
//! create/rename/truncate files, request content either whole or
//! patched-from-local, write OS metadata atomically, report progress and
//! cancel (§4.5, §4.6).

pub mod metadata_prefetch;

use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use log::warn;

use crate::error::CoreError;
use crate::fscap::BackupFileSystem;
use crate::hash::{hash_bytes, Hash};
use crate::patch::sidecar::ChunkSidecar;
use crate::patch::PatchOp;
use crate::proto::filelist::{WireEntry, WireEntryKind};
use crate::status::StatusRegistry;
use metadata_prefetch::{MetadataBatchFetcher, MetadataPrefetcher, DEFAULT_LOOKAHEAD};

/// Source of file content the client pulls entries from; the actual
/// transport (the control channel, `clientdl<N>` HTTP-style requests) is a
/// named external collaborator out of scope here (base spec §1) — this
/// trait is the seam a real transport plugs into.
pub trait ContentFetcher {
    /// Fetch `server_path`'s full content.
    fn fetch_whole(&self, server_path: &str) -> Result<Vec<u8>, CoreError>;

    /// Fetch a patch (§4.6) turning `base` into `server_path`'s current
    /// content, given the chunk sidecar already known for `base`.
    fn fetch_patch(
        &self,
        server_path: &str,
        base_sidecar: &ChunkSidecar,
    ) -> Result<Vec<PatchOp>, CoreError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    pub files_written: u64,
    pub dirs_created: u64,
    pub bytes_written: u64,
    pub patched_files: u64,
    /// Files whose prefetched metadata arrived in time to cross-check
    /// against the written content (§11.6).
    pub metadata_checked: u64,
}

/// Drives one restore download against a [`BackupFileSystem`] and a
/// [`ContentFetcher`], reporting progress through a [`StatusRegistry`]
/// process and honoring its `stop_requested` flag (§4.7). `M` pipelines
/// OS-metadata lookups ahead of content via [`MetadataPrefetcher`]
/// (§11.6).
pub struct RestoreClient<'a, FS: BackupFileSystem, C: ContentFetcher, M: MetadataBatchFetcher> {
    fs: &'a FS,
    fetcher: &'a C,
    metadata: &'a M,
    status: &'a StatusRegistry,
    client_name: String,
    process_id: u64,
}

impl<'a, FS: BackupFileSystem, C: ContentFetcher, M: MetadataBatchFetcher> RestoreClient<'a, FS, C, M> {
    pub fn new(
        fs: &'a FS,
        fetcher: &'a C,
        metadata: &'a M,
        status: &'a StatusRegistry,
        client_name: impl Into<String>,
        process_id: u64,
    ) -> Self {
        RestoreClient {
            fs,
            fetcher,
            metadata,
            status,
            client_name: client_name.into(),
            process_id,
        }
    }

    /// Walk a flat, nested-order wire file list (as produced by
    /// `restore::RestoreEngine::build_filelist`), materializing directories
    /// and files under `dest_root`. Returns early with
    /// [`CoreError::Cancelled`] if the registry's `stop_requested` flag is
    /// set between entries (§4.7).
    pub fn restore(&self, entries: &[WireEntry], dest_root: &Path) -> Result<RestoreStats, CoreError> {
        let mut stats = RestoreStats::default();
        let mut dir_stack = vec![dest_root.to_path_buf()];
        let total = entries.len().max(1) as f32;

        let mut prefetcher = MetadataPrefetcher::new(self.metadata, DEFAULT_LOOKAHEAD);
        prefetcher.enqueue(entries.iter().filter(|e| e.kind == WireEntryKind::File).map(server_path_of));

        for (index, entry) in entries.iter().enumerate() {
            if self.stop_requested() {
                return Err(CoreError::Cancelled);
            }

            match entry.kind {
                WireEntryKind::DirOpen => {
                    let dir = dir_stack.last().unwrap().join(&entry.name);
                    self.fs
                        .create_dir_all(&dir)
                        .map_err(|e| CoreError::Io { path: dir.clone(), source: to_io_error(e) })?;
                    dir_stack.push(dir);
                    stats.dirs_created += 1;
                }
                WireEntryKind::DirClose => {
                    if dir_stack.len() > 1 {
                        dir_stack.pop();
                    }
                }
                WireEntryKind::File => {
                    let current_dir = dir_stack.last().unwrap().clone();
                    let written = self.restore_one_file(entry, &current_dir, &mut prefetcher)?;
                    stats.files_written += 1;
                    stats.bytes_written += written.bytes;
                    if written.patched {
                        stats.patched_files += 1;
                    }
                    if written.metadata_checked {
                        stats.metadata_checked += 1;
                    }
                }
            }

            self.status.update_running_pc(
                &self.client_name,
                self.process_id,
                100.0 * (index + 1) as f32 / total,
                stats.bytes_written,
            );
        }

        Ok(stats)
    }

    fn stop_requested(&self) -> bool {
        self.status
            .snapshot(&self.client_name)
            .map(|status| {
                status
                    .processes
                    .iter()
                    .any(|p| p.id == self.process_id && p.stop_requested)
            })
            .unwrap_or(false)
    }

    fn restore_one_file(
        &self,
        entry: &WireEntry,
        dir: &Path,
        prefetcher: &mut MetadataPrefetcher<'_, M>,
    ) -> Result<WrittenFile, CoreError> {
        let dest = dir.join(&entry.name);
        let expected_hash = entry
            .extra
            .get("sha")
            .and_then(|hex_str| hex::decode(hex_str).ok())
            .map(|bytes| Hash::from_bytes(&bytes));

        let server_path = server_path_of(entry);

        let existing = self.fs.exists(&dest);
        let content = if existing {
            match self.try_patch(&dest, &server_path) {
                Ok(bytes) if expected_hash.map_or(true, |h| hash_bytes(&bytes) == h) => bytes,
                Ok(_) | Err(_) => {
                    warn!(
                        "restoreclient: patch path missed for {:?}, falling back to whole file",
                        dest
                    );
                    self.fetch_whole_with_retry(&dest, &server_path, expected_hash)?
                }
            }
        } else {
            self.fetch_whole_with_retry(&dest, &server_path, expected_hash)?
        };

        if let Some(expected) = expected_hash {
            if hash_bytes(&content) != expected {
                return Err(CoreError::HashMismatch {
                    path: dest.clone(),
                    expected: expected.to_hex(),
                    actual: hash_bytes(&content).to_hex(),
                });
            }
        }

        self.write_atomically(&dest, &content)?;

        let metadata_checked = match prefetcher.take_for(&server_path) {
            Ok(record) => {
                let mut crc = Crc32::new();
                crc.update(&content);
                if crc.finalize() != record.data_checksum {
                    warn!("restoreclient: prefetched metadata checksum mismatch for {:?}", dest);
                }
                true
            }
            Err(err) => {
                warn!("restoreclient: no prefetched metadata for {:?}: {}", dest, err);
                false
            }
        };

        Ok(WrittenFile {
            bytes: content.len() as u64,
            patched: existing,
            metadata_checked,
        })
    }

    /// Request a patch (§4.6) against the file already on disk at `dest`
    /// rather than re-transferring it whole.
    fn try_patch(&self, dest: &Path, server_path: &str) -> Result<Vec<u8>, CoreError> {
        let base = std::fs::read(dest).map_err(|e| CoreError::Io { path: dest.to_path_buf(), source: e })?;
        let base_sidecar = ChunkSidecar::compute(std::io::Cursor::new(&base))
            .map_err(|e| CoreError::Io { path: dest.to_path_buf(), source: e })?;
        let ops = self.fetcher.fetch_patch(server_path, &base_sidecar)?;
        Ok(crate::patch::apply_patch(&base, &ops))
    }

    /// Fetch `server_path` whole, retrying up to
    /// [`crate::patch::MAX_WHOLE_FILE_RETRIES`] times against a fresh
    /// fetch before surfacing `HashMismatch` (§4.6). With no expected hash
    /// to verify against, a single fetch is all the caller can act on.
    fn fetch_whole_with_retry(
        &self,
        dest: &Path,
        server_path: &str,
        expected_hash: Option<Hash>,
    ) -> Result<Vec<u8>, CoreError> {
        match expected_hash {
            Some(expected) => crate::patch::apply_with_retry(
                &[],
                expected,
                || match self.fetcher.fetch_whole(server_path) {
                    Ok(bytes) => vec![PatchOp::Literal(bytes)],
                    Err(err) => {
                        warn!("restoreclient: whole-file fetch failed for {:?}: {}", dest, err);
                        Vec::new()
                    }
                },
                dest,
            ),
            None => self.fetcher.fetch_whole(server_path),
        }
    }

    /// Write to a temp file beside `dest` then rename into place, so a
    /// reader never observes a partially-written file at its final path
    /// (§4.5 "write OS metadata atomically").
    fn write_atomically(&self, dest: &Path, content: &[u8]) -> Result<(), CoreError> {
        let tmp = tmp_path_for(dest);
        std::fs::write(&tmp, content).map_err(|e| CoreError::Io { path: tmp.clone(), source: e })?;
        self.fs
            .rename(&tmp, dest)
            .map_err(|e| CoreError::Io { path: dest.to_path_buf(), source: to_io_error(e) })
    }
}

struct WrittenFile {
    bytes: u64,
    patched: bool,
    metadata_checked: bool,
}

fn server_path_of(entry: &WireEntry) -> String {
    entry.extra.get("server_path").cloned().unwrap_or_else(|| entry.name.clone())
}

fn tmp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".restoring");
    dest.with_file_name(name)
}

fn to_io_error(err: crate::fscap::FsCapError) -> std::io::Error {
    match err {
        crate::fscap::FsCapError::Io { source, .. } => source,
        crate::fscap::FsCapError::ReflinkUnsupported => {
            std::io::Error::new(std::io::ErrorKind::Unsupported, "reflink not supported")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fscap::StdFilesystem;
    use crate::patch::sidecar::{OsKind, PosixStat, SidecarRecord};
    use crate::status::ProcessAction;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeFetcher {
        files: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl ContentFetcher for FakeFetcher {
        fn fetch_whole(&self, server_path: &str) -> Result<Vec<u8>, CoreError> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(server_path)
                .cloned()
                .unwrap_or_default())
        }

        fn fetch_patch(
            &self,
            server_path: &str,
            _base_sidecar: &ChunkSidecar,
        ) -> Result<Vec<PatchOp>, CoreError> {
            let content = self.fetch_whole(server_path)?;
            Ok(vec![PatchOp::Literal(content)])
        }
    }

    /// Hands back a sidecar whose `data_checksum` matches the same
    /// in-memory content `FakeFetcher` would serve, so the restore's
    /// metadata cross-check has something real to agree with.
    impl MetadataBatchFetcher for FakeFetcher {
        fn fetch_batch(&self, server_paths: &[String]) -> Result<Vec<SidecarRecord>, CoreError> {
            let files = self.files.lock().unwrap();
            Ok(server_paths
                .iter()
                .map(|path| {
                    let content = files.get(path).cloned().unwrap_or_default();
                    let mut crc = Crc32::new();
                    crc.update(&content);
                    SidecarRecord {
                        chunks: ChunkSidecar::default(),
                        os_kind: OsKind::Unix,
                        stat_blob: Vec::new(),
                        attribute_streams: Vec::new(),
                        data_checksum: crc.finalize(),
                        posix_stat: PosixStat { mode: 0o644, uid: 0, gid: 0, mtime: 0, atime: 0, ctime: 0 },
                    }
                })
                .collect())
        }
    }

    fn entry_for(name: &str, content: &[u8]) -> WireEntry {
        WireEntry::file(name, content.len() as u64, 0)
            .with_extra("sha", hash_bytes(content).to_hex())
            .with_extra("server_path", name.to_string())
    }

    #[test]
    fn restore_writes_new_file_from_whole_fetch() {
        let dir = tempdir().unwrap();
        let fs = StdFilesystem;
        let status = StatusRegistry::new();
        let pid = status.start_process("client1", ProcessAction::RestoreFile);

        let mut files = std::collections::HashMap::new();
        files.insert("a.txt".to_string(), b"hello world".to_vec());
        let fetcher = FakeFetcher { files: Mutex::new(files) };

        let client = RestoreClient::new(&fs, &fetcher, &fetcher, &status, "client1", pid);
        let entries = vec![entry_for("a.txt", b"hello world")];
        let stats = client.restore(&entries, dir.path()).unwrap();

        assert_eq!(stats.files_written, 1);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hello world");
    }

    #[test]
    fn restore_creates_nested_directories() {
        let dir = tempdir().unwrap();
        let fs = StdFilesystem;
        let status = StatusRegistry::new();
        let pid = status.start_process("client1", ProcessAction::RestoreFile);
        let entries = vec![
            WireEntry::dir_open("sub"),
            entry_for("inner.txt", b"x"),
            WireEntry::dir_close(),
        ];
        let mut files = std::collections::HashMap::new();
        files.insert("inner.txt".to_string(), b"x".to_vec());
        let fetcher = FakeFetcher { files: Mutex::new(files) };
        let client = RestoreClient::new(&fs, &fetcher, &fetcher, &status, "client1", pid);

        let stats = client.restore(&entries, dir.path()).unwrap();
        assert_eq!(stats.dirs_created, 1);
        assert!(dir.path().join("sub").is_dir());
        assert!(dir.path().join("sub/inner.txt").exists());
    }

    #[test]
    fn restore_detects_hash_mismatch() {
        let dir = tempdir().unwrap();
        let fs = StdFilesystem;
        let status = StatusRegistry::new();
        let pid = status.start_process("client1", ProcessAction::RestoreFile);
        let mut files = std::collections::HashMap::new();
        files.insert("bad.txt".to_string(), b"actual content".to_vec());
        let fetcher = FakeFetcher { files: Mutex::new(files) };
        let client = RestoreClient::new(&fs, &fetcher, &fetcher, &status, "client1", pid);

        let mut entry = entry_for("bad.txt", b"different expected content");
        entry.name = "bad.txt".to_string();
        let entries = vec![entry];
        let err = client.restore(&entries, dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::HashMismatch { .. }));
    }

    #[test]
    fn restore_honors_stop_requested() {
        let dir = tempdir().unwrap();
        let fs = StdFilesystem;
        let status = StatusRegistry::new();
        let pid = status.start_process("client1", ProcessAction::RestoreFile);
        status.request_stop("client1", pid);

        let fetcher = FakeFetcher { files: Mutex::new(std::collections::HashMap::new()) };
        let client = RestoreClient::new(&fs, &fetcher, &fetcher, &status, "client1", pid);
        let entries = vec![entry_for("a.txt", b"x")];
        let err = client.restore(&entries, dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }
}
