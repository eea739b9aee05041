//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::{Priority, Target};

/// Cowork - session, lock and message coordination
#[derive(Parser)]
#[command(
    name = "cw",
    about = "Inspect and drive cowork coordination state",
    version,
    after_help = "Logs are written to: ~/.local/share/cowork/logs/cowork.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Shared store directory, overriding the config
    #[arg(short, long, global = true)]
    pub store: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// List live sessions
    Sessions,

    /// List unexpired locks
    Locks,

    /// Publish a message from a short-lived session
    Publish {
        /// Message text
        text: String,

        /// normal, high or urgent
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Recipient session id, or "all"
        #[arg(short, long, default_value = "all")]
        to: Target,

        /// Message topic
        #[arg(long, default_value = "note")]
        topic: String,
    },

    /// Run one sweep, reap and message gc pass
    Maintain,
}

/// Output format for listings
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cowork")
        .join("logs")
        .join("cowork.log")
}
