//! Download/restore engine (C7): given a selected backup subtree, build a
//! synthetic file list and serve file bytes/metadata to a restore client,
//! following in-store symlinks to deduped pools safely (§4.5).

pub mod share;
pub mod walk;

use std::path::{Path, PathBuf};

use pathpatterns::{MatchEntry, MatchList, MatchType};

use crate::proto::filelist::WireEntry;
use share::{Share, ShareRegistry, ShareToken};
use walk::{walk_tree, FileListEntry, TreeSource};

/// Per-entry metadata a restore client needs before it asks for content
/// (§4.5 "Metadata"): original client path, content hash and any sidecar
/// stat/attribute data, attached onto the emitted [`WireEntry`].
#[derive(Debug, Clone, Default)]
pub struct EntryMetadata {
    pub orig_path: Option<String>,
    pub sha: Option<String>,
    pub thash: Option<String>,
}

/// Looks up [`EntryMetadata`] for a walked entry, kept behind a trait so
/// tests can supply canned metadata without a real sidecar on disk.
pub trait MetadataSource {
    fn metadata_for(&self, server_path: &Path) -> EntryMetadata;
}

/// No metadata available; every entry serializes with only name/size/mtime.
pub struct NoMetadata;

impl MetadataSource for NoMetadata {
    fn metadata_for(&self, _server_path: &Path) -> EntryMetadata {
        EntryMetadata::default()
    }
}

/// Ties the tree walk, an optional include/exclude filter, metadata
/// attachment and share registration together into the file list a
/// restore client downloads (§4.5).
#[derive(Default)]
pub struct RestoreEngine {
    pub shares: ShareRegistry,
}

impl RestoreEngine {
    pub fn new() -> Self {
        RestoreEngine {
            shares: ShareRegistry::new(),
        }
    }

    /// Walk `root`, apply `filter` (an optional include/exclude pattern
    /// list built the same way as the restore API's own path filters),
    /// attach metadata, and return wire-ready entries nested with
    /// directory open/close markers (§4.5, §6 "File-list wire format").
    pub fn build_filelist<T: TreeSource, M: MetadataSource>(
        &self,
        source: &T,
        root: &Path,
        volume_root: &Path,
        follow_symlinks: bool,
        filter: Option<&[MatchEntry]>,
        metadata: &M,
    ) -> Vec<WireEntry> {
        let entries = walk_tree(source, root, volume_root, follow_symlinks);
        let filtered: Vec<FileListEntry> = match filter {
            Some(patterns) => entries
                .into_iter()
                .filter(|entry| filter_allows(patterns, &entry.client_path, root))
                .collect(),
            None => entries,
        };
        nest_entries(&filtered, root, metadata)
    }

    /// Register a completed file list (and the directory it serves
    /// content from) as a share, returning the identity token a client
    /// authenticates `clientdl<N>` / `clientdl_filelist` requests with
    /// (§4.5 "Ambient state exposed").
    pub fn publish(&self, content_root: PathBuf, filelist: Option<PathBuf>) -> ShareToken {
        self.shares.create(content_root, filelist)
    }

    pub fn resolve(&self, token: &ShareToken) -> Option<Share> {
        self.shares.resolve(token)
    }

    pub fn complete(&self, token: &ShareToken) {
        self.shares.complete(token)
    }
}

fn filter_allows(patterns: &[MatchEntry], client_path: &Path, root: &Path) -> bool {
    let relative = client_path.strip_prefix(root).unwrap_or(client_path);
    let relative = relative.to_string_lossy();
    match patterns.matches(relative.as_bytes(), None) {
        Some(MatchType::Exclude) => false,
        Some(MatchType::Include) | None => true,
    }
}

/// Re-nest the flat walk output into depth-first directory open/close
/// pairs, the shape the wire file-list format requires (§6).
fn nest_entries<M: MetadataSource>(
    entries: &[FileListEntry],
    root: &Path,
    metadata: &M,
) -> Vec<WireEntry> {
    use std::collections::BTreeMap;

    let mut children: BTreeMap<PathBuf, Vec<&FileListEntry>> = BTreeMap::new();
    for entry in entries {
        let parent = entry
            .client_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        children.entry(parent).or_default().push(entry);
    }

    let mut out = Vec::new();
    emit_children(root, &children, metadata, &mut out);
    out
}

fn emit_children<M: MetadataSource>(
    dir: &Path,
    children: &std::collections::BTreeMap<PathBuf, Vec<&FileListEntry>>,
    metadata: &M,
    out: &mut Vec<WireEntry>,
) {
    let kids = match children.get(dir) {
        Some(kids) => kids,
        None => return,
    };
    for entry in kids {
        let name = entry
            .client_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if entry.is_directory {
            out.push(WireEntry::dir_open(name));
            emit_children(&entry.client_path, children, metadata, out);
            out.push(WireEntry::dir_close());
        } else {
            let meta = metadata.metadata_for(&entry.server_path);
            let mut wire = WireEntry::file(name, entry.size, 0);
            if let Some(orig) = meta.orig_path {
                wire = wire.with_extra("orig_path", orig);
            }
            if let Some(sha) = meta.sha {
                wire = wire.with_extra("sha", sha);
            }
            if let Some(thash) = meta.thash {
                wire = wire.with_extra("thash", thash);
            }
            out.push(wire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use walk::TreeNode;

    struct FakeTree {
        dirs: HashMap<PathBuf, Vec<(String, TreeNode)>>,
        sizes: HashMap<PathBuf, u64>,
    }

    impl TreeSource for FakeTree {
        fn list_dir(&self, path: &Path) -> Vec<(String, TreeNode)> {
            self.dirs.get(path).cloned().unwrap_or_default()
        }
        fn symlink_target(&self, _path: &Path) -> Option<PathBuf> {
            None
        }
        fn file_size(&self, path: &Path) -> u64 {
            *self.sizes.get(path).unwrap_or(&0)
        }
    }

    fn sample_tree() -> FakeTree {
        let mut dirs = HashMap::new();
        dirs.insert(
            PathBuf::from("/backup1"),
            vec![
                ("docs".to_string(), TreeNode::Directory),
                ("top.txt".to_string(), TreeNode::File),
            ],
        );
        dirs.insert(
            PathBuf::from("/backup1/docs"),
            vec![("a.txt".to_string(), TreeNode::File)],
        );
        let mut sizes = HashMap::new();
        sizes.insert(PathBuf::from("/backup1/top.txt"), 10);
        sizes.insert(PathBuf::from("/backup1/docs/a.txt"), 20);
        FakeTree { dirs, sizes }
    }

    #[test]
    fn build_filelist_nests_directories() {
        let engine = RestoreEngine::new();
        let tree = sample_tree();
        let entries = engine.build_filelist(
            &tree,
            Path::new("/backup1"),
            Path::new("/backup1"),
            true,
            None,
            &NoMetadata,
        );

        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[0].kind, crate::proto::filelist::WireEntryKind::DirOpen);
        assert!(entries.iter().any(|e| e.name == "a.txt"));
        let dir_close_count = entries
            .iter()
            .filter(|e| e.kind == crate::proto::filelist::WireEntryKind::DirClose)
            .count();
        assert_eq!(dir_close_count, 1);
    }

    #[test]
    fn build_filelist_attaches_metadata() {
        struct FixedMetadata;
        impl MetadataSource for FixedMetadata {
            fn metadata_for(&self, _server_path: &Path) -> EntryMetadata {
                EntryMetadata {
                    orig_path: Some("/orig/top.txt".to_string()),
                    sha: Some("abcd".to_string()),
                    thash: None,
                }
            }
        }

        let engine = RestoreEngine::new();
        let tree = sample_tree();
        let entries = engine.build_filelist(
            &tree,
            Path::new("/backup1"),
            Path::new("/backup1"),
            true,
            None,
            &FixedMetadata,
        );
        let top = entries.iter().find(|e| e.name == "top.txt").unwrap();
        assert_eq!(top.extra.get("sha"), Some(&"abcd".to_string()));
    }

    #[test]
    fn publish_and_resolve_share_roundtrip() {
        let engine = RestoreEngine::new();
        let token = engine.publish(PathBuf::from("/backup1"), None);
        assert!(engine.resolve(&token).is_some());
        engine.complete(&token);
        assert!(engine.resolve(&token).is_none());
    }
}
