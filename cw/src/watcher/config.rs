//! Watcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How store changes are detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native file events, falling back to polling when unavailable
    #[default]
    Auto,
    /// Native file events only
    Native,
    /// Interval polling only
    Polling,
}

impl std::fmt::Display for WatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Native => write!(f, "native"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Configuration for the ChangeWatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub mode: WatchMode,

    /// Polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms", rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Native event debounce window in milliseconds
    #[serde(default = "default_debounce_ms", rename = "debounce-ms")]
    pub debounce_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            poll_interval_ms: 1_000,
            debounce_ms: 100,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
