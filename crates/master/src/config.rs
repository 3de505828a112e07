//! Configuration management for the `master` binary.
//!
//! The TOML file has one table per concern. Missing tables and keys fall
//! back to defaults, so a file only needs the values it changes.

use anyhow::Context;
use master_server::{MasterConfig, SessionConfig, SpawnerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub master: MasterSettings,
    pub spawner: SpawnerSettings,
    pub logging: LoggingSettings,
}

/// Settings of the `master` run mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    /// Network address to bind the server to (e.g., "0.0.0.0:5000")
    pub bind_address: String,
    /// How long to wait for a spawner to answer a start or kill command
    pub request_timeout_secs: u64,
    pub enable_client_spawn_requests: bool,
    pub spawner_permission_level: i32,
    pub room_permission_level: i32,
    /// Unused access tickets expire after this many seconds, 0 disables
    pub ticket_ttl_secs: u64,
    /// Finished tasks stay queryable this long
    pub task_eviction_grace_secs: u64,
    pub maintenance_interval_ms: u64,
    pub spawn_code_length: usize,
}

/// Settings of the `spawner` run mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerSettings {
    /// Master address this spawner registers with
    pub master_address: String,
    /// Master address handed to spawned processes, if it differs
    pub spawned_master_address: Option<String>,
    /// Region served by this spawner; empty serves region-less requests
    pub region: String,
    /// Concurrent process limit, 0 for unbounded
    pub max_processes: u32,
    /// Game server executable started per spawn task
    pub executable: String,
    /// Arguments passed before the spawn arguments
    pub args: Vec<String>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub request_timeout_secs: u64,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for MasterSettings {
    fn default() -> Self {
        let defaults = MasterConfig::default();
        Self {
            bind_address: defaults.bind_address.to_string(),
            request_timeout_secs: defaults.request_timeout.as_secs(),
            enable_client_spawn_requests: defaults.enable_client_spawn_requests,
            spawner_permission_level: defaults.spawner_permission_level,
            room_permission_level: defaults.room_permission_level,
            ticket_ttl_secs: defaults.ticket_ttl.map_or(0, |ttl| ttl.as_secs()),
            task_eviction_grace_secs: defaults.task_eviction_grace.as_secs(),
            maintenance_interval_ms: defaults.maintenance_interval.as_millis() as u64,
            spawn_code_length: defaults.spawn_code_length,
        }
    }
}

impl Default for SpawnerSettings {
    fn default() -> Self {
        let defaults = SpawnerConfig::default();
        Self {
            master_address: defaults.master_address,
            spawned_master_address: defaults.spawned_master_address,
            region: defaults.region,
            max_processes: defaults.max_processes,
            executable: defaults.executable.to_string_lossy().into_owned(),
            args: defaults.args,
            reconnect_initial_ms: defaults.session.initial_backoff.as_millis() as u64,
            reconnect_max_ms: defaults.session.max_backoff.as_millis() as u64,
            request_timeout_secs: defaults.session.request_timeout.as_secs(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks addresses, limits and the log level.
    pub fn validate(&self) -> Result<(), String> {
        if self.master.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.master.bind_address
            ));
        }

        if self.master.request_timeout_secs == 0 || self.spawner.request_timeout_secs == 0 {
            return Err("Request timeouts must be at least one second".to_string());
        }

        if self.master.maintenance_interval_ms == 0 {
            return Err("Maintenance interval cannot be zero".to_string());
        }

        if !(1..=32).contains(&self.master.spawn_code_length) {
            return Err("Spawn code length must be between 1 and 32".to_string());
        }

        if self.spawner.master_address.is_empty() {
            return Err("Spawner master address cannot be empty".to_string());
        }

        if self.spawner.executable.is_empty() {
            return Err("Spawner executable cannot be empty".to_string());
        }

        if self.spawner.reconnect_initial_ms == 0
            || self.spawner.reconnect_initial_ms > self.spawner.reconnect_max_ms
        {
            return Err(
                "Reconnect delays must satisfy 0 < reconnect_initial_ms <= reconnect_max_ms"
                    .to_string(),
            );
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {LOG_LEVELS:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn to_master_config(&self) -> anyhow::Result<MasterConfig> {
        let settings = &self.master;
        Ok(MasterConfig {
            bind_address: settings
                .bind_address
                .parse()
                .with_context(|| format!("invalid bind address {}", settings.bind_address))?,
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            enable_client_spawn_requests: settings.enable_client_spawn_requests,
            spawner_permission_level: settings.spawner_permission_level,
            room_permission_level: settings.room_permission_level,
            ticket_ttl: (settings.ticket_ttl_secs > 0)
                .then(|| Duration::from_secs(settings.ticket_ttl_secs)),
            task_eviction_grace: Duration::from_secs(settings.task_eviction_grace_secs),
            maintenance_interval: Duration::from_millis(settings.maintenance_interval_ms),
            spawn_code_length: settings.spawn_code_length,
        })
    }

    pub fn to_spawner_config(&self) -> SpawnerConfig {
        let settings = &self.spawner;
        SpawnerConfig {
            master_address: settings.master_address.clone(),
            spawned_master_address: settings.spawned_master_address.clone(),
            region: settings.region.clone(),
            max_processes: settings.max_processes,
            executable: PathBuf::from(&settings.executable),
            args: settings.args.clone(),
            session: SessionConfig {
                initial_backoff: Duration::from_millis(settings.reconnect_initial_ms),
                max_backoff: Duration::from_millis(settings.reconnect_max_ms),
                request_timeout: Duration::from_secs(settings.request_timeout_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn defaults_mirror_library_configs() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let master = config.to_master_config().unwrap();
        let library = MasterConfig::default();
        assert_eq!(master.bind_address, library.bind_address);
        assert_eq!(master.request_timeout, library.request_timeout);
        assert_eq!(master.ticket_ttl, None);
        assert_eq!(master.spawn_code_length, library.spawn_code_length);

        let spawner = config.to_spawner_config();
        assert_eq!(spawner.master_address, SpawnerConfig::default().master_address);
        assert_eq!(spawner.max_processes, SpawnerConfig::default().max_processes);
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn partial_file_keeps_remaining_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[master]
bind_address = "0.0.0.0:6000"
ticket_ttl_secs = 30

[spawner]
region = "EU"
max_processes = 1
args = ["-batchmode"]

[logging]
level = "debug"
json_format = true
"#
        )
        .unwrap();

        let config = AppConfig::load_from_file(file.path()).await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.master.bind_address, "0.0.0.0:6000");
        assert_eq!(config.master.request_timeout_secs, 10);
        assert_eq!(config.spawner.region, "EU");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);

        let master = config.to_master_config().unwrap();
        assert_eq!(master.ticket_ttl, Some(Duration::from_secs(30)));

        let spawner = config.to_spawner_config();
        assert_eq!(spawner.max_processes, 1);
        assert_eq!(spawner.args, vec!["-batchmode".to_string()]);
        assert_eq!(spawner.address_for_processes(), "127.0.0.1:5000");
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[master\nbind_address = ").unwrap();
        assert!(AppConfig::load_from_file(file.path()).await.is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.master.bind_address = "not an address".into();
        assert!(config.validate().unwrap_err().contains("Invalid bind address"));

        let mut config = AppConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));

        let mut config = AppConfig::default();
        config.master.spawn_code_length = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.spawner.reconnect_initial_ms = 10_000;
        config.spawner.reconnect_max_ms = 100;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.spawner.executable.clear();
        assert!(config.validate().is_err());
    }
}
