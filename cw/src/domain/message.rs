//! Messages exchanged between sessions

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message priority; urgent and high raise an extra notification on delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Who a message is for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "kind", content = "session")]
pub enum Target {
    #[default]
    Broadcast,
    Session(String),
}

impl Target {
    /// True if a session with this id is an addressee
    pub fn includes(&self, session_id: &str) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Session(id) => id == session_id,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broadcast => write!(f, "broadcast"),
            Self::Session(id) => write!(f, "{}", id),
        }
    }
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("Empty message target".to_string()),
            "*" | "all" | "broadcast" => Ok(Self::Broadcast),
            id => Ok(Self::Session(id.to_string())),
        }
    }
}

/// A notification from one session to one or all others
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub target: Target,
    #[serde(default)]
    pub topic: String,
    pub payload: serde_json::Value,
}

impl Message {
    /// Create a message stamped now
    pub fn new(
        sender: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        target: Target,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            sender: sender.into(),
            timestamp: Utc::now(),
            priority,
            target,
            topic: topic.into(),
            payload,
        }
    }

    /// Should `session_id` receive this message? Senders never receive their own.
    pub fn is_for(&self, session_id: &str) -> bool {
        self.sender != session_id && self.target.includes(session_id)
    }

    /// Urgent and high messages get an out-of-band notification
    pub fn is_priority(&self) -> bool {
        self.priority >= Priority::High
    }
}

/// One flush worth of messages, written as a single record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub id: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(sender: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            sender: sender.into(),
            created_at: Utc::now(),
            messages,
        }
    }
}

/// Message ids already delivered to one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLedger {
    pub session_id: String,
    #[serde(default)]
    pub delivered: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryLedger {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            delivered: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.delivered.contains(message_id)
    }
}
