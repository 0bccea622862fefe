//! Configuration management for tandem
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (`TANDEM_` prefix, `__` between keys)
//! 3. tandem.local.toml (gitignored, local overrides)
//! 4. tandem.toml (git-tracked, deployment config)
//! 5. ~/.config/tandem/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main tandem configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub node: NodeSection,
    pub view_service: ViewServiceSection,
    pub timing: TimingSection,
    pub workers: WorkersSection,
    pub replication: ReplicationSection,
}

/// Participant settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Participant name; required before a node can start.
    pub name: Option<String>,
    pub listen_address: String,
    /// Address other participants dial; defaults to the bound listener.
    pub advertise_address: Option<String>,
    pub view_service_address: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: None,
            listen_address: "0.0.0.0:7400".to_string(),
            advertise_address: None,
            view_service_address: "127.0.0.1:7300".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewServiceSection {
    pub bind_address: String,
    /// Opaque replication parameters handed to the application.
    pub n: u32,
    pub k: u32,
}

impl Default for ViewServiceSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7300".to_string(),
            n: 15,
            k: 10,
        }
    }
}

/// Protocol timing in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeat_limit: u32,
    pub check_interval_ms: u64,
    pub check_grace_ms: u64,
    pub backup_change_guard_ms: u64,
    pub primary_change_guard_ms: u64,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub init_backup_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    pub view_poll_interval_ms: u64,
    pub view_request_timeout_ms: u64,
    pub view_request_attempts: u32,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            missed_heartbeat_limit: 2,
            check_interval_ms: 600,
            check_grace_ms: 1500,
            backup_change_guard_ms: 500,
            primary_change_guard_ms: 1200,
            connect_attempts: 3,
            connect_backoff_ms: 100,
            connect_timeout_ms: 1000,
            init_backup_timeout_ms: 2000,
            sync_timeout_ms: 1200,
            view_poll_interval_ms: 50,
            view_request_timeout_ms: 500,
            view_request_attempts: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// Worker threads; unset means available parallelism, capped at 8.
    pub worker_count: Option<usize>,
    pub queue_capacity: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            worker_count: None,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Remove participants silent for two heartbeat-check windows in a row.
    pub evict_silent_participants: bool,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            evict_silent_participants: true,
        }
    }
}

impl TandemConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Checks addresses and values that would otherwise fail at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_addr("node.listen_address", &self.node.listen_address)?;
        parse_addr("node.view_service_address", &self.node.view_service_address)?;
        parse_addr("view_service.bind_address", &self.view_service.bind_address)?;
        if let Some(advertise) = &self.node.advertise_address {
            parse_addr("node.advertise_address", advertise)?;
        }

        if self.view_service.k > self.view_service.n {
            return Err(ConfigError::ValidationError(format!(
                "view_service.k ({}) must not exceed view_service.n ({})",
                self.view_service.k, self.view_service.n
            )));
        }

        let timing = &self.timing;
        for (field, value) in [
            ("timing.heartbeat_interval_ms", timing.heartbeat_interval_ms),
            ("timing.check_interval_ms", timing.check_interval_ms),
            ("timing.sync_timeout_ms", timing.sync_timeout_ms),
            ("timing.connect_timeout_ms", timing.connect_timeout_ms),
            ("timing.view_request_timeout_ms", timing.view_request_timeout_ms),
            ("timing.view_poll_interval_ms", timing.view_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{field} must be positive")));
            }
        }
        for (field, value) in [
            ("timing.missed_heartbeat_limit", timing.missed_heartbeat_limit),
            ("timing.connect_attempts", timing.connect_attempts),
            ("timing.view_request_attempts", timing.view_request_attempts),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{field} must be at least 1")));
            }
        }

        if self.workers.worker_count == Some(0) || self.workers.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "workers.worker_count and workers.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// Writes the configuration as TOML to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let rendered = self.to_toml()?;
        std::fs::write(path, rendered).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("node.listen_address", &self.node.listen_address)
    }

    pub fn advertise_address(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.node
            .advertise_address
            .as_deref()
            .map(|addr| parse_addr("node.advertise_address", addr))
            .transpose()
    }

    pub fn view_service_address(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("node.view_service_address", &self.node.view_service_address)
    }

    pub fn view_service_bind_address(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("view_service.bind_address", &self.view_service.bind_address)
    }
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|source| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
        source,
    })
}
