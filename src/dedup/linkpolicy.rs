//! Hardlink-count safety margin and minimum-link-size gate (§4.4 steps 3-4).

use std::path::Path;

use crate::fscap::BackupFileSystem;

/// Conservative hardlink ceiling shared by the common Linux backup
/// filesystems (ext4: 65 000, ~2^16; XFS/btrfs allow far more but this is
/// the floor the original targets). A production deployment could make
/// this filesystem-specific; base spec leaves the exact constant
/// unspecified and only requires a safety margin below *some* limit.
pub const HARDLINK_COUNT_LIMIT: u64 = 65_000;

/// Whether hardlinking `existing_path` one more time is safe, given
/// `safety_margin` (§4.4 step 3: "refuse to hardlink within this many
/// links of the filesystem limit").
pub fn hardlink_is_safe<FS: BackupFileSystem + ?Sized>(
    fs: &FS,
    existing_path: &Path,
    safety_margin: u64,
) -> bool {
    match fs.hardlink_count(existing_path) {
        Ok(count) => count + safety_margin < HARDLINK_COUNT_LIMIT,
        Err(_) => false,
    }
}

/// §4.4 step 4: files below this size are never linked, copied inline
/// instead — link metadata overhead can exceed the savings.
pub fn below_min_link_size(size: u64, link_file_min_size: u64) -> bool {
    size < link_file_min_size
}
