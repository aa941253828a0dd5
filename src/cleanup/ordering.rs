//! Retention ordering rules a cleanup pass must respect (§4.8).

/// A backup as cleanup sees it: enough fields to decide removability, not
/// the full `FileEntry`-bearing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupMeta {
    pub id: u64,
    pub client_id: u32,
    pub archived: bool,
    pub delete_pending: bool,
    /// Another backup id that references this one as an associated image
    /// (`assoc_images`/`refs`), if any — this backup cannot be removed
    /// before that referent is.
    pub referenced_by: Option<u64>,
}

/// Whether `backup` is eligible for removal right now, given the full set
/// of backups for context (needed to check the `referenced_by` rule) and
/// the client's current backup count (needed for the retention floor).
pub fn is_removable(backup: &BackupMeta, all: &[BackupMeta], min_backups_per_client: u32) -> bool {
    if backup.archived {
        return false;
    }
    if backup.delete_pending {
        // Already marked; a second cleanup pass is what actually removes
        // it (§4.8 "two-phase marker"), so it is not independently
        // "removable" by this check — the caller should walk it directly.
        return false;
    }
    if let Some(referent_id) = backup.referenced_by {
        if all.iter().any(|b| b.id == referent_id) {
            return false;
        }
    }

    let client_backup_count = all.iter().filter(|b| b.client_id == backup.client_id).count() as u32;
    if client_backup_count <= min_backups_per_client {
        return false;
    }

    true
}

/// §4.8: mark a backup `delete_pending` — invisible to restore/listing,
/// still occupying storage until the next cleanup pass actually walks it.
pub fn mark_delete_pending(backup: &mut BackupMeta) {
    backup.delete_pending = true;
}
