//! Batches ahead-of-content metadata requests during restore so OS
//! metadata (ACLs/xattrs/stream data) for a run of upcoming files is
//! already in hand by the time their content arrives, pipelining the two
//! instead of serializing metadata-then-data per file (§11.6, grounded in
//! the original's `FileMetadataDownloadThread`/`FileMetadataPipe`
//! batching).

use std::collections::VecDeque;

use crate::error::CoreError;
use crate::patch::sidecar::SidecarRecord;

/// Requests metadata for a batch of server paths in one round trip; the
/// real transport is a named external collaborator (base spec §1), so
/// this trait is the seam a control-channel implementation plugs into.
pub trait MetadataBatchFetcher {
    fn fetch_batch(&self, server_paths: &[String]) -> Result<Vec<SidecarRecord>, CoreError>;
}

/// How many files' metadata to request ahead of the file whose content is
/// currently being written.
pub const DEFAULT_LOOKAHEAD: usize = 16;

/// Prefetches metadata `lookahead` files ahead of restore's current
/// position, so `take_for` rarely blocks on a fresh round trip.
pub struct MetadataPrefetcher<'a, F: MetadataBatchFetcher> {
    fetcher: &'a F,
    lookahead: usize,
    pending_paths: VecDeque<String>,
    ready: std::collections::HashMap<String, SidecarRecord>,
}

impl<'a, F: MetadataBatchFetcher> MetadataPrefetcher<'a, F> {
    pub fn new(fetcher: &'a F, lookahead: usize) -> Self {
        MetadataPrefetcher {
            fetcher,
            lookahead: lookahead.max(1),
            pending_paths: VecDeque::new(),
            ready: std::collections::HashMap::new(),
        }
    }

    /// Queue up the server paths restore is about to walk, in order.
    pub fn enqueue(&mut self, server_paths: impl IntoIterator<Item = String>) {
        self.pending_paths.extend(server_paths);
    }

    /// Returns the metadata for `server_path`, fetching a new
    /// `lookahead`-sized batch starting at the front of the pending queue
    /// if it isn't already in hand.
    pub fn take_for(&mut self, server_path: &str) -> Result<SidecarRecord, CoreError> {
        if let Some(record) = self.ready.remove(server_path) {
            return Ok(record);
        }
        self.fill_batch()?;
        self.ready
            .remove(server_path)
            .ok_or_else(|| CoreError::IndexCorruption(format!("no metadata prefetched for {:?}", server_path)))
    }

    fn fill_batch(&mut self) -> Result<(), CoreError> {
        if self.pending_paths.is_empty() {
            return Ok(());
        }
        let batch: Vec<String> = self
            .pending_paths
            .drain(..self.lookahead.min(self.pending_paths.len()))
            .collect();
        let records = self.fetcher.fetch_batch(&batch)?;
        for (path, record) in batch.into_iter().zip(records.into_iter()) {
            self.ready.insert(path, record);
        }
        Ok(())
    }
}
