//! Change-journal watcher (C2, client side, §4.1).

pub mod debounce;
pub mod events;
pub mod map;
pub mod watcher;

pub use debounce::Debouncer;
pub use events::{ReasonMask, UsnRecord, WatchEvent};
pub use map::{FrnMap, SENTINEL_ROOT};
pub use watcher::{JournalSource, VolumeWatcher};
