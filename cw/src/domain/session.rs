//! Session records: one per registered worker

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::elapsed;

/// Liveness status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Idle,
    Disconnected,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "disconnected" => Ok(Self::Disconnected),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// The process that owns a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub pid: u32,
    pub host: String,
    pub cwd: PathBuf,
}

impl Owner {
    /// Describe the current process
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            cwd: std::env::current_dir().unwrap_or_default(),
        }
    }

    /// True if the owner runs on this host
    pub fn is_local(&self) -> bool {
        self.host == current_host()
    }

    /// True if the owning process still exists (only meaningful for local owners)
    pub fn is_alive(&self) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            let Ok(pid) = i32::try_from(self.pid) else {
                return false;
            };
            // EPERM means the process exists but belongs to someone else
            matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(nix::errno::Errno::EPERM))
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

fn current_host() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// How a heartbeat changes the session's current task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TaskChange {
    #[default]
    Keep,
    Set(String),
    Clear,
}

/// A registered worker and its liveness state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: SessionStatus,
    pub owner: Owner,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl Session {
    /// Create a new active session for the given owner
    pub fn new(owner: Owner) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            last_active: now,
            status: SessionStatus::Active,
            owner,
            current_task: None,
            location: None,
        }
    }

    /// Time since the last heartbeat
    pub fn inactive_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_active, now)
    }

    /// Not disconnected and heard from within the window
    pub fn is_live(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status != SessionStatus::Disconnected && self.inactive_for(now) <= window
    }

    /// Record activity: bump last_active, wake from idle, apply task/location
    pub fn touch(&mut self, now: DateTime<Utc>, task: &TaskChange, location: Option<&str>) {
        self.last_active = now;
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Active;
        }
        match task {
            TaskChange::Keep => {}
            TaskChange::Set(t) => self.current_task = Some(t.clone()),
            TaskChange::Clear => self.current_task = None,
        }
        if let Some(location) = location {
            self.location = Some(location.to_string());
        }
    }

    /// Display summary
    pub fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            pid: self.owner.pid,
            host: self.owner.host.clone(),
            cwd: self.owner.cwd.clone(),
            current_task: self.current_task.clone(),
            location: self.location.clone(),
            inactive_secs: self.inactive_for(now).as_secs(),
        }
    }
}

/// Session view for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub pid: u32,
    pub host: String,
    pub cwd: PathBuf,
    pub current_task: Option<String>,
    pub location: Option<String>,
    pub inactive_secs: u64,
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] pid {}@{} {} ({}s ago)",
            self.id,
            self.status,
            self.pid,
            self.host,
            self.cwd.display(),
            self.inactive_secs
        )?;
        if let Some(task) = &self.current_task {
            write!(f, " task: {}", task)?;
        }
        Ok(())
    }
}
