//! Process/status registry (C9): the single truthful source for UI
//! polling and the channel's "am I busy?" response (§4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What a running process is doing (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    IncrFile,
    FullFile,
    IncrImage,
    FullImage,
    ResumeIncrFile,
    ResumeFullFile,
    RestoreFile,
    RestoreImage,
    Update,
}

/// One running operation for a client (§4.7).
#[derive(Debug, Clone)]
pub struct Process {
    pub id: u64,
    pub action: ProcessAction,
    pub pc_done: f32,
    pub eta_ms: u64,
    pub starttime: Instant,
    pub total_bytes: u64,
    pub done_bytes: u64,
    pub speed_bps: f64,
    pub details: String,
    pub refs: u32,
    pub stop_requested: bool,
    last_ping: Instant,
}

impl Process {
    fn new(id: u64, action: ProcessAction) -> Self {
        let now = Instant::now();
        Process {
            id,
            action,
            pc_done: 0.0,
            eta_ms: 0,
            starttime: now,
            total_bytes: 0,
            done_bytes: 0,
            speed_bps: 0.0,
            details: String::new(),
            refs: 1,
            stop_requested: false,
            last_ping: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientStatus {
    pub online: bool,
    pub ip: Option<std::net::IpAddr>,
    pub error_code: i32,
    pub processes: Vec<Process>,
}

/// `client_name -> Status` (§4.7). A single mutex covers structural
/// changes; per-field updates use the same mutex since reads and writes
/// are cheap and infrequent relative to the backup I/O they describe.
#[derive(Default)]
pub struct StatusRegistry {
    clients: Mutex<HashMap<String, ClientStatus>>,
    next_process_id: AtomicU64,
}

impl StatusRegistry {
    pub fn new() -> Self {
        StatusRegistry::default()
    }

    pub fn set_online(&self, client: &str, online: bool, ip: Option<std::net::IpAddr>) {
        let mut clients = self.clients.lock().unwrap();
        let status = clients.entry(client.to_string()).or_default();
        status.online = online;
        status.ip = ip;
    }

    pub fn set_error(&self, client: &str, error_code: i32) {
        let mut clients = self.clients.lock().unwrap();
        clients.entry(client.to_string()).or_default().error_code = error_code;
    }

    pub fn start_process(&self, client: &str, action: ProcessAction) -> u64 {
        let id = self.next_process_id.fetch_add(1, Ordering::SeqCst);
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry(client.to_string())
            .or_default()
            .processes
            .push(Process::new(id, action));
        id
    }

    pub fn stop_process(&self, client: &str, process_id: u64) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(status) = clients.get_mut(client) {
            status.processes.retain(|p| p.id != process_id);
        }
    }

    pub fn update_running_pc(&self, client: &str, process_id: u64, pc_done: f32, done_bytes: u64) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(status) = clients.get_mut(client) {
            if let Some(process) = status.processes.iter_mut().find(|p| p.id == process_id) {
                process.pc_done = pc_done;
                process.done_bytes = done_bytes;
                process.last_ping = Instant::now();
            }
        }
    }

    pub fn request_stop(&self, client: &str, process_id: u64) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(status) = clients.get_mut(client) {
            if let Some(process) = status.processes.iter_mut().find(|p| p.id == process_id) {
                process.stop_requested = true;
            }
        }
    }

    pub fn snapshot(&self, client: &str) -> Option<ClientStatus> {
        self.clients.lock().unwrap().get(client).cloned()
    }

    pub fn snapshot_all(&self) -> HashMap<String, ClientStatus> {
        self.clients.lock().unwrap().clone()
    }

    /// §4.7 `remove_timed_out_processes`: drop any process with
    /// `now - last_ping > PING_TIMEOUT`.
    pub fn remove_timed_out_processes(&self, ping_timeout: Duration) {
        let mut clients = self.clients.lock().unwrap();
        for status in clients.values_mut() {
            status
                .processes
                .retain(|p| p.last_ping.elapsed() <= ping_timeout);
        }
    }

    pub fn is_busy(&self, client: &str) -> bool {
        self.clients
            .lock()
            .unwrap()
            .get(client)
            .map(|s| !s.processes.is_empty())
            .unwrap_or(false)
    }
}
