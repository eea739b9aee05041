//! Size- and time-bounded outgoing queue

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Outgoing items waiting for a flush
///
/// A batch window opens when the first item enters an empty queue. The queue
/// wants flushing once it holds `batch_size` items or the window has been
/// open for `interval`, whichever comes first.
#[derive(Debug)]
pub struct BatchingQueue<T> {
    items: VecDeque<T>,
    batch_size: usize,
    interval: Duration,
    opened_at: Option<Instant>,
}

impl<T> BatchingQueue<T> {
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            batch_size: batch_size.max(1),
            interval,
            opened_at: None,
        }
    }

    /// Queue an item; true when the flusher should be woken
    pub fn push(&mut self, item: T) -> bool {
        let was_empty = self.items.is_empty();
        if was_empty {
            self.opened_at = Some(Instant::now());
        }
        self.items.push_back(item);
        was_empty || self.items.len() >= self.batch_size
    }

    pub fn should_flush(&self) -> bool {
        if self.items.is_empty() {
            return false;
        }
        self.items.len() >= self.batch_size || self.opened_at.is_some_and(|at| at.elapsed() >= self.interval)
    }

    /// When the open window closes, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.interval)
    }

    /// Take everything queued and close the window
    pub fn drain(&mut self) -> Vec<T> {
        self.opened_at = None;
        self.items.drain(..).collect()
    }

    /// Put items from a failed flush back ahead of anything queued since
    pub fn requeue(&mut self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
