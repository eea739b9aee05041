//! Coordinator facade
//!
//! The one object a worker process holds: it registers the session, runs the
//! background heartbeat, sweep, reap, flush and watch tasks, and exposes the
//! lock, messaging and status calls.

mod core;
mod guard;

pub use core::{Coordinator, MaintenanceReport};
pub use guard::LockGuard;
