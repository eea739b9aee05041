//! Domain types for coordination records
//!
//! Every persisted record lives in one of the categories below.

mod lock;
mod message;
mod session;

pub use lock::{Acquisition, Lock, LockConflict, LockMode, LockSummary, reader_id, slot_id};
pub use message::{DeliveryLedger, Message, MessageBatch, Priority, Target};
pub use session::{Owner, Session, SessionStatus, SessionSummary, TaskChange};

/// Store category holding session records
pub const SESSIONS: &str = "sessions";

/// Store category holding lock leases
pub const LOCKS: &str = "locks";

/// Store category holding flushed message batches
pub const PENDING_MESSAGES: &str = "messages/pending";

/// Store category holding per-recipient delivery ledgers
pub const PROCESSED_MESSAGES: &str = "messages/processed";

/// Coarse category of a store change, as seen by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Sessions,
    Locks,
    Messages,
}

impl Category {
    /// Map a store category path to its coarse category
    pub fn from_store_category(category: &str) -> Option<Self> {
        match category.split('/').next()? {
            "sessions" => Some(Self::Sessions),
            "locks" => Some(Self::Locks),
            "messages" => Some(Self::Messages),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sessions => write!(f, "sessions"),
            Self::Locks => write!(f, "locks"),
            Self::Messages => write!(f, "messages"),
        }
    }
}

/// Longest span added to or subtracted from a timestamp
const MAX_SPAN_DAYS: i64 = 36_500;

/// Convert a std duration to a chrono duration, capped so timestamp math cannot overflow
pub(crate) fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(MAX_SPAN_DAYS);
    chrono::Duration::from_std(duration).map_or(cap, |d| d.min(cap))
}

/// Elapsed time between two instants, zero if `later` is earlier
pub(crate) fn elapsed(earlier: chrono::DateTime<chrono::Utc>, later: chrono::DateTime<chrono::Utc>) -> std::time::Duration {
    (later - earlier).to_std().unwrap_or_default()
}
