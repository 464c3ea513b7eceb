use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::config::{self, Edition};
use crate::state::{ServerState, State};

/// Reloadable per-server tuning values.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub idle_timeout: Duration,
    pub start_timeout: Duration,
    pub motd_hibernating: String,
    pub kick_message: String,
}

impl From<&config::Server> for Tuning {
    fn from(cfg: &config::Server) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout(),
            start_timeout: cfg.start_timeout(),
            motd_hibernating: cfg.motd_hibernating.clone(),
            kick_message: cfg.kick_message.clone(),
        }
    }
}

/// Shared handle for one managed server.
///
/// Identity fields are immutable. Tuning is swapped wholesale on
/// reload, the state machine has a single writer (the monitor, and the
/// proxy manager inside the port-handover) with snapshot readers.
#[derive(Debug)]
pub struct Server {
    name: String,
    crafty_server_id: String,
    addr: SocketAddr,
    edition: Edition,
    tuning: RwLock<Tuning>,
    state: Mutex<ServerState>,
}

impl Server {
    /// Build the handle from validated configuration.
    pub fn from_config(name: &str, cfg: &config::Server) -> Self {
        // listen_host was validated as an IP address at config load.
        let ip: IpAddr = cfg
            .listen_host
            .parse()
            .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));
        Self {
            name: name.to_string(),
            crafty_server_id: cfg.crafty_server_id.clone(),
            addr: SocketAddr::new(ip, cfg.listen_port),
            edition: cfg.edition,
            tuning: RwLock::new(Tuning::from(cfg)),
            state: Mutex::new(ServerState::new(name)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crafty_server_id(&self) -> &str {
        &self.crafty_server_id
    }

    /// Socket address the impersonator binds.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn edition(&self) -> Edition {
        self.edition
    }

    /// Current tuning snapshot.
    pub async fn tuning(&self) -> Tuning {
        self.tuning.read().await.clone()
    }

    /// Swap the tuning, used by config reload.
    pub async fn set_tuning(&self, tuning: Tuning) {
        *self.tuning.write().await = tuning;
    }

    /// The state machine cell. Writers hold the lock across a full
    /// reconciliation step, readers take it briefly for snapshots.
    pub fn state(&self) -> &Mutex<ServerState> {
        &self.state
    }

    /// Current lifecycle state.
    pub async fn current_state(&self) -> State {
        self.state.lock().await.state()
    }

    /// Point-in-time view for the status surface and metrics.
    pub async fn snapshot(&self, now: Instant) -> Snapshot {
        let state = self.state.lock().await;
        Snapshot {
            name: self.name.clone(),
            state: state.state(),
            port: self.addr.port(),
            edition: self.edition,
            players_online: state.last_online(),
            players_max: state.last_max(),
            version: state.last_version().to_string(),
            idle_seconds: state.idle_elapsed(now).as_secs(),
            start_count: state.start_count(),
            stop_count: state.stop_count(),
        }
    }
}

/// Point-in-time view of one server.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub state: State,
    pub port: u16,
    pub edition: Edition,
    pub players_online: u32,
    pub players_max: u32,
    pub version: String,
    pub idle_seconds: u64,
    pub start_count: u64,
    pub stop_count: u64,
}
