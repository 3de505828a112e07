//! Runtime configuration for the master, spawners and client sessions.
//!
//! These are plain structs with defaults; the binary maps its TOML file
//! onto them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of the master server.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// The socket address to bind the listener to
    pub bind_address: SocketAddr,

    /// How long the master waits for a spawner to acknowledge a start or
    /// kill command
    pub request_timeout: Duration,

    /// Whether clients may send `RequestSpawn`
    pub enable_client_spawn_requests: bool,

    /// Minimum permission level required to register a spawner
    pub spawner_permission_level: i32,

    /// Minimum permission level required to register a room
    pub room_permission_level: i32,

    /// Unconsumed tickets older than this are purged. `None` keeps them
    /// until used.
    pub ticket_ttl: Option<Duration>,

    /// Finished or killed tasks stay queryable for this long
    pub task_eviction_grace: Duration,

    /// Period of the background maintenance sweep
    pub maintenance_interval: Duration,

    /// Length of the registration code handed to spawned processes
    pub spawn_code_length: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 5000)),
            request_timeout: Duration::from_secs(10),
            enable_client_spawn_requests: true,
            spawner_permission_level: 0,
            room_permission_level: 0,
            ticket_ttl: None,
            task_eviction_grace: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(1),
            spawn_code_length: 6,
        }
    }
}

/// Reconnect and request settings of a [`ClientSession`](crate::ClientSession).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration of a spawner process.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Address of the master server
    pub master_address: String,

    /// Address handed to spawned processes. Defaults to `master_address`.
    pub spawned_master_address: Option<String>,

    /// Region this spawner serves; empty means it only receives requests
    /// without a region
    pub region: String,

    /// Maximum concurrent processes, 0 for unbounded
    pub max_processes: u32,

    /// Executable started for every spawn task
    pub executable: PathBuf,

    /// Arguments passed before the spawn arguments
    pub args: Vec<String>,

    pub session: SessionConfig,
}

impl SpawnerConfig {
    pub fn address_for_processes(&self) -> &str {
        self.spawned_master_address
            .as_deref()
            .unwrap_or(&self.master_address)
    }
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            master_address: "127.0.0.1:5000".to_string(),
            spawned_master_address: None,
            region: String::new(),
            max_processes: 5,
            executable: PathBuf::from("game_server"),
            args: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}
