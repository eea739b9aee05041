//! Cowork configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::watcher::WatcherConfig;

/// Main cowork configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared store location
    pub store: StoreConfig,

    /// Read cache behaviour
    pub cache: CacheConfig,

    /// Lock leases and sweeping
    pub locks: LockConfig,

    /// Session heartbeat and reaping
    pub sessions: SessionConfig,

    /// Message batching and retention
    pub messages: MessageConfig,

    /// Change detection
    pub watcher: WatcherConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .cowork.yml
        let local_config = PathBuf::from(".cowork.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/cowork/cowork.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("cowork").join("cowork.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Check that the timing knobs are consistent with each other
    pub fn validate(&self) -> Result<()> {
        debug!("Config::validate: called");
        let sessions = &self.sessions;
        if sessions.idle_after_secs >= sessions.liveness_window_secs {
            return Err(eyre::eyre!(
                "sessions.idle-after-secs ({}) must be below sessions.liveness-window-secs ({})",
                sessions.idle_after_secs,
                sessions.liveness_window_secs
            ));
        }
        if sessions.heartbeat_interval_secs >= sessions.liveness_window_secs {
            return Err(eyre::eyre!(
                "sessions.heartbeat-interval-secs ({}) must be below sessions.liveness-window-secs ({})",
                sessions.heartbeat_interval_secs,
                sessions.liveness_window_secs
            ));
        }
        if self.messages.batch_size == 0 {
            return Err(eyre::eyre!("messages.batch-size must be at least 1"));
        }
        if self.locks.default_ttl_secs == 0 {
            return Err(eyre::eyre!("locks.default-ttl-secs must be at least 1"));
        }
        let intervals = [
            ("sessions.heartbeat-interval-secs", sessions.heartbeat_interval_secs),
            ("sessions.reap-interval-secs", sessions.reap_interval_secs),
            ("locks.sweep-interval-secs", self.locks.sweep_interval_secs),
            ("watcher.poll-interval-ms", self.watcher.poll_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(eyre::eyre!("{} must be at least 1", name));
        }
        Ok(())
    }
}

/// Store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory shared by every worker on the project
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".cowork"),
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Max age of a cached category snapshot in milliseconds
    #[serde(rename = "ttl-ms")]
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 2_000 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease length when the caller does not give one
    #[serde(rename = "default-ttl-secs")]
    pub default_ttl_secs: u64,

    /// How often expired leases are swept
    #[serde(rename = "sweep-interval-secs")]
    pub sweep_interval_secs: u64,

    /// Acquire attempts made by scoped locking before giving up
    #[serde(rename = "retry-attempts")]
    pub retry_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(rename = "retry-backoff-ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on a single retry delay
    #[serde(rename = "retry-backoff-max-ms")]
    pub retry_backoff_max_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            sweep_interval_secs: 15,
            retry_attempts: 10,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 2_000,
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let ms = self.retry_backoff_ms.saturating_mul(factor).min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Session liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "heartbeat-interval-secs")]
    pub heartbeat_interval_secs: u64,

    /// Inactivity after which an active session is marked idle
    #[serde(rename = "idle-after-secs")]
    pub idle_after_secs: u64,

    /// Inactivity after which a session is disconnected and removed
    #[serde(rename = "liveness-window-secs")]
    pub liveness_window_secs: u64,

    #[serde(rename = "reap-interval-secs")]
    pub reap_interval_secs: u64,

    /// Reap sessions whose owning process on this host has exited
    #[serde(rename = "reap-dead-owners")]
    pub reap_dead_owners: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            idle_after_secs: 60,
            liveness_window_secs: 180,
            reap_interval_secs: 30,
            reap_dead_owners: false,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Message bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Queue length that triggers an immediate flush
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// Max time a queued message waits for a flush
    #[serde(rename = "flush-interval-ms")]
    pub flush_interval_ms: u64,

    /// How long flushed batches are kept
    #[serde(rename = "retention-secs")]
    pub retention_secs: u64,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval_ms: 250,
            retention_secs: 3_600,
        }
    }
}

impl MessageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
