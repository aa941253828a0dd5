//! Backup-tree walk, following in-store symlinks to the dedup pool
//! (§4.5 "Tree walk").

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use log::warn;

/// One entry the walk emits for the client-facing file list (§4.5
/// "Metadata").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListEntry {
    /// Path relative to the restore root, as the client should see it.
    pub client_path: PathBuf,
    /// Where the bytes actually live on the server (may be inside the
    /// dedup pool, reached via a followed symlink).
    pub server_path: PathBuf,
    pub is_directory: bool,
    pub size: u64,
}

/// A directory entry as seen by the walk; real filesystem access is
/// behind this trait so tests can supply a synthetic tree without txt
/// fixtures on disk.
pub trait TreeSource {
    fn list_dir(&self, path: &Path) -> Vec<(String, TreeNode)>;
    fn symlink_target(&self, path: &Path) -> Option<PathBuf>;
    fn file_size(&self, path: &Path) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeNode {
    File,
    Directory,
    Symlink,
}

/// Walks `root` (the backup subtree to restore), following in-store
/// symlinks into the dedup pool when `follow_symlinks` is set. A symlink
/// target is rejected (logged, skipped) if it would resolve outside
/// `volume_root` via a `..` escape (§4.5).
pub fn walk_tree<T: TreeSource>(
    source: &T,
    root: &Path,
    volume_root: &Path,
    follow_symlinks: bool,
) -> Vec<FileListEntry> {
    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = vec![(root.to_path_buf(), root.to_path_buf())];

    while let Some((client_base, server_base)) = queue.pop() {
        if !visited.insert(server_base.clone()) {
            continue;
        }

        for (name, node) in source.list_dir(&server_base) {
            let client_path = client_base.join(&name);
            let server_path = server_base.join(&name);

            match node {
                TreeNode::Directory => {
                    entries.push(FileListEntry {
                        client_path: client_path.clone(),
                        server_path: server_path.clone(),
                        is_directory: true,
                        size: 0,
                    });
                    queue.push((client_path, server_path));
                }
                TreeNode::File => {
                    entries.push(FileListEntry {
                        client_path,
                        size: source.file_size(&server_path),
                        is_directory: false,
                        server_path,
                    });
                }
                TreeNode::Symlink => {
                    let target = match source.symlink_target(&server_path) {
                        Some(t) => t,
                        None => continue,
                    };

                    if escapes_volume_root(&target, volume_root) {
                        warn!("restore walk: symlink {:?} escapes volume root, skipping", server_path);
                        continue;
                    }

                    if !follow_symlinks {
                        continue;
                    }

                    // De-duplicate against the set already queued/visited
                    // to avoid infinite recursion and double-writes.
                    if !visited.contains(&target) {
                        queue.push((client_path, target));
                    }
                }
            }
        }
    }

    entries
}

fn escapes_volume_root(target: &Path, volume_root: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in target.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return true;
        }
    }
    // An absolute target sidesteps the `..`-climb check above entirely
    // (e.g. a symlink pointing straight at `/etc/passwd`); catch that by
    // requiring it stay under `volume_root` regardless of depth.
    target.is_absolute() && !target.starts_with(volume_root)
}
