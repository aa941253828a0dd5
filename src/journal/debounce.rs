//! Coalescing event queue (§11.5 supplement, `ContinuousWatchEnqueue` /
//! `DirectoryWatcherThread` in the original): a file rewritten many times
//! in quick succession should only be re-hashed once it has been quiet
//! for a short window, not once per raw event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::events::WatchEvent;

/// Coalesces a stream of [`WatchEvent`]s per path, releasing the latest
/// event for a path only after `quiet_window` has passed since the last
/// time that path was touched. Non-file-modification events (renames,
/// removals, resets) pass through immediately — coalescing only helps
/// for the "written many times" case.
pub struct Debouncer {
    quiet_window: Duration,
    pending: HashMap<PathBuf, (WatchEvent, Instant)>,
}

impl Debouncer {
    pub fn new(quiet_window: Duration) -> Self {
        Debouncer {
            quiet_window,
            pending: HashMap::new(),
        }
    }

    /// Feed one incoming event. Returns events that should be emitted
    /// immediately (never modifications — those land in `pending`).
    pub fn push(&mut self, event: WatchEvent) -> Vec<WatchEvent> {
        match &event {
            WatchEvent::FileModified { path, .. } => {
                self.pending.insert(path.clone(), (event, Instant::now()));
                Vec::new()
            }
            _ => vec![event],
        }
    }

    /// Release every pending modification whose quiet window has elapsed.
    pub fn poll(&mut self) -> Vec<WatchEvent> {
        let quiet_window = self.quiet_window;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, seen))| seen.elapsed() >= quiet_window)
            .map(|(path, _)| path.clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|(event, _)| event))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
