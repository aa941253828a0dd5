//! Normalized change-journal events and the raw queued record type they
//! are derived from (§3, §4.1).

use std::path::PathBuf;

use bitflags::bitflags;

bitflags! {
    /// Reason bits on an incoming change-journal record. Named after the
    /// NTFS USN_RECORD reason flags this abstracts over, since that is the
    /// concrete facility base-spec §1 names as the motivating OS journal,
    /// but any OS-level change-journal is expected to map onto this set.
    #[derive(Default)]
    pub struct ReasonMask: u32 {
        const FILE_CREATE      = 0x0000_0001;
        const FILE_DELETE      = 0x0000_0002;
        const RENAME_OLD_NAME  = 0x0000_0004;
        const RENAME_NEW_NAME  = 0x0000_0008;
        const DATA_OVERWRITE   = 0x0000_0010;
        const DATA_EXTEND      = 0x0000_0020;
        const DATA_TRUNCATION  = 0x0000_0040;
        const CLOSE            = 0x0000_0080;
        const BASIC_INFO_CHANGE = 0x0000_0100;
        const SECURITY_CHANGE  = 0x0000_0200;
    }
}

impl ReasonMask {
    /// §4.1 step 2: "Any watched-change reason" — content or attribute
    /// changes that should trigger a re-hash, as opposed to structural
    /// (create/delete/rename) reasons handled separately.
    pub fn is_watched_change(&self) -> bool {
        self.intersects(
            ReasonMask::DATA_OVERWRITE
                | ReasonMask::DATA_EXTEND
                | ReasonMask::DATA_TRUNCATION
                | ReasonMask::BASIC_INFO_CHANGE
                | ReasonMask::SECURITY_CHANGE,
        )
    }
}

/// The record major version; a reader that doesn't recognise either
/// supported value must emit `reset_all` (§4.1 step 1).
pub const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];

/// One raw queued change-journal record (`UsnInt`, §3), saved verbatim
/// when arriving mid-reindex and replayed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsnRecord {
    pub version: u32,
    pub frn: u64,
    pub parent_frn: u64,
    pub usn: u64,
    pub reason_mask: ReasonMask,
    pub filename: String,
    pub next_usn: u64,
    pub is_directory: bool,
}

/// A normalized, higher-level event the watcher emits after classifying
/// raw records (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    FileAdded(PathBuf),
    FileModified { path: PathBuf, closed: bool },
    FileRemoved(PathBuf),
    DirAdded(PathBuf),
    DirRemoved(PathBuf),
    Rename { old_path: PathBuf, new_path: PathBuf, closed: bool },
    DirRename { old_path: PathBuf, new_path: PathBuf, closed: bool },
    /// Escape hatch: the volume's state could not be trusted incrementally
    /// and must be fully reindexed (§4.1).
    ResetAll { volume: PathBuf },
}
