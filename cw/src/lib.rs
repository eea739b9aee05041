//! Cowork - coordination for concurrent workers sharing a workspace
//!
//! Several independent worker processes (typically coding-assistant sessions)
//! working in one project use cowork to see each other, avoid editing the same
//! resource at once, and pass short notifications. All shared state lives in a
//! directory of records ([`recordstore`]); there is no server.
//!
//! # Modules
//!
//! - [`coordinator`] - the facade a worker holds from start to stop
//! - [`lock`] - leased read/write/exclusive locks with expiry sweep
//! - [`session`] - session registration, heartbeats and reaping
//! - [`bus`] - batched publish/subscribe with at-most-once delivery
//! - [`watcher`] - native or polled change detection
//! - [`cache`] - TTL-bounded category cache
//! - [`domain`] - persisted record types
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface of the `cw` binary

pub mod bus;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod lock;
pub mod session;
pub mod watcher;

// Re-export commonly used types
pub use bus::{BatchingQueue, BusEvent, GcReport, Inbox, MessageBus};
pub use cache::{CacheStats, RecordCache};
pub use config::{CacheConfig, Config, LockConfig, MessageConfig, SessionConfig, StoreConfig};
pub use coordinator::{Coordinator, LockGuard, MaintenanceReport};
pub use domain::{
    Acquisition, Lock, LockConflict, LockMode, LockSummary, Message, Owner, Priority, Session, SessionStatus,
    SessionSummary, Target, TaskChange,
};
pub use error::{CoordError, CoordResult};
pub use lock::LockManager;
pub use session::{ReapReport, SessionRegistry};
pub use watcher::{ChangeKind, ChangeSource, ChangeWatcher, StoreChange, WatchMode, WatcherConfig};
