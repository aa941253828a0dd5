//! Server and client configuration.
//!
//! Grounded in the teacher's `config/datastore.rs` pattern of a
//! `serde`-derived struct with typed defaults, loaded from a file on disk.
//! The teacher parses its own hand-rolled section-config format backed by
//! the internal `proxmox` crate; since that crate is out of scope here
//! (it backs the admin JSON API, which base spec §1 excludes), plain TOML
//! via `serde` fills the same role.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Named constants from the base spec, gathered here so every component
/// reads them from one place instead of re-declaring magic numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root directory all backup trees live under (§3 "Backup root").
    pub backup_root: PathBuf,

    /// §4.4 step 4: files below this size are never linked.
    pub link_file_min_size: u64,

    /// §4.4 step 3: refuse to hardlink within this many links of the
    /// filesystem's hardlink count limit.
    pub hardlink_safety_margin: u64,

    /// §4.4 failure semantics: retries for a single file on ENOSPC.
    pub nospc_retries: u32,

    /// §4.1: volumes whose journal has advanced by more than this many
    /// records since last run are reindexed from scratch.
    pub reindex_threshold: u64,

    /// §6 PING/PONG: a client with no ping in this long is considered gone.
    pub ping_timeout: Duration,

    /// §4.8: cleanup will not remove backups below this per-client floor.
    pub min_backups_per_client: u32,

    /// §4.2 buffered-write model.
    pub index_min_size_no_wait: usize,
    pub index_max_buffer: usize,
    pub index_max_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            backup_root: PathBuf::from("/var/lib/urbackup-core/backups"),
            link_file_min_size: 2048,
            hardlink_safety_margin: 16,
            nospc_retries: 3,
            reindex_threshold: 1_000_000,
            ping_timeout: Duration::from_secs(180),
            min_backups_per_client: 1,
            index_min_size_no_wait: 10_000,
            index_max_buffer: 100_000,
            index_max_wait: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading server config {:?}", path))?;
        let cfg: ServerConfig =
            toml::from_str(&raw).with_context(|| format!("parsing server config {:?}", path))?;
        Ok(cfg)
    }
}

/// Client-side change-journal watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub watched_volumes: Vec<PathBuf>,
    pub reindex_threshold: u64,
    pub longliving_update_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            watched_volumes: Vec::new(),
            reindex_threshold: 1_000_000,
            longliving_update_interval: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading client config {:?}", path))?;
        let cfg: ClientConfig =
            toml::from_str(&raw).with_context(|| format!("parsing client config {:?}", path))?;
        Ok(cfg)
    }
}
