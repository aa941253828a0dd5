//! Transient authenticated shares gating restore content (§4.5 "Ambient
//! state exposed").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;

/// Width of a share's identity token in bytes (§4.5: "a random 16-byte
/// identity token").
pub const TOKEN_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareToken(pub [u8; TOKEN_BYTES]);

impl ShareToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        ShareToken(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Share {
    /// `clientdl<N>` mapping target — a directory for bulk file serving.
    pub root: PathBuf,
    /// `clientdl_filelist` target — the generated file-list file, if this
    /// share is for a file-list download rather than content.
    pub filelist: Option<PathBuf>,
    created: Instant,
}

/// Registry of active shares, keyed by their identity token. Entries are
/// removed on restore completion or timeout (§4.5).
#[derive(Default)]
pub struct ShareRegistry {
    shares: Mutex<HashMap<ShareToken, Share>>,
}

impl ShareRegistry {
    pub fn new() -> Self {
        ShareRegistry::default()
    }

    pub fn create(&self, root: PathBuf, filelist: Option<PathBuf>) -> ShareToken {
        let token = ShareToken::generate();
        self.shares.lock().unwrap().insert(
            token.clone(),
            Share {
                root,
                filelist,
                created: Instant::now(),
            },
        );
        token
    }

    pub fn resolve(&self, token: &ShareToken) -> Option<Share> {
        self.shares.lock().unwrap().get(token).cloned()
    }

    pub fn complete(&self, token: &ShareToken) {
        self.shares.lock().unwrap().remove(token);
    }

    /// Remove shares older than `timeout` (§4.5 "removed ... on timeout").
    pub fn expire(&self, timeout: Duration) {
        self.shares
            .lock()
            .unwrap()
            .retain(|_, share| share.created.elapsed() <= timeout);
    }

    pub fn len(&self) -> usize {
        self.shares.lock().unwrap().len()
    }
}
