//! Change detection for writes made by other processes
//!
//! A [`ChangeSource`] yields batches of [`StoreChange`]s; the
//! [`ChangeWatcher`] turns them into cache invalidations and message
//! deliveries. Native file events and interval polling are interchangeable.

mod change_watcher;
mod config;
mod native;
mod polling;
mod source;

pub use change_watcher::{ChangeWatcher, WATCHED_CATEGORIES, open_source};
pub use config::{WatchMode, WatcherConfig};
pub use native::NotifySource;
pub use polling::PollingSource;
pub use source::{ChangeKind, ChangeSource, StoreChange};
