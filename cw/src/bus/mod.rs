//! Batched publish/subscribe messaging over the store
//!
//! Published messages wait in a [`BatchingQueue`] until it is full or its
//! window closes, then go to the store as one batch record. Each recipient
//! keeps a ledger of message ids it has been handed; the ledger is written
//! before messages are returned, so nothing is delivered twice.

mod message_bus;
mod queue;

pub use message_bus::{BusEvent, GcReport, Inbox, MessageBus};
pub use queue::BatchingQueue;
