// Daemon configuration: `~/.emendare/config.toml`.
//
// Every field has a default, so a missing file or a partial file is valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use emendare_common::types::ElectorateMode;
use serde::{Deserialize, Serialize};

use crate::startup::{ensure_owner_only_dir, ensure_owner_only_file};

/// Root directory for Emendare state: `~/.emendare/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".emendare"))
}

/// Path to the daemon config file: `~/.emendare/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Daemon config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub voting: VotingConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

impl DaemonConfig {
    /// Load from `~/.emendare/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Self = toml::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            ensure_owner_only_dir(parent)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)?;
        ensure_owner_only_file(path)
            .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.voting.delay_min_sec > self.voting.delay_max_sec {
            return Err(ConfigError::Invalid(format!(
                "voting.delay_min_sec ({}) exceeds voting.delay_max_sec ({})",
                self.voting.delay_min_sec, self.voting.delay_max_sec
            )));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.tick_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Closure timing and electorate rules applied to new amendments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VotingConfig {
    /// Earliest an absolute majority can close an amendment.
    pub delay_min_sec: u64,
    /// When the relative-majority rule forces closure.
    pub delay_max_sec: u64,
    pub electorate: ElectorateMode,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self { delay_min_sec: 60 * 60, delay_max_sec: 24 * 60 * 60, electorate: ElectorateMode::Live }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 10_000 }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Defaults to `~/.emendare/emendare.db` when unset.
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_database_path(&self, base_dir: &Path) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| base_dir.join("emendare.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the WebSocket / HTTP endpoints next to the Unix socket.
    pub ws_enabled: bool,
    pub ws_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { ws_enabled: true, ws_addr: SocketAddr::from(([127, 0, 0, 1], 3030)) }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
