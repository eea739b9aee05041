//! MessageBus implementation

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recordstore::RecordStore;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tracing::{debug, info, warn};

use super::queue::BatchingQueue;
use crate::cache::blocking;
use crate::config::MessageConfig;
use crate::domain::{
    DeliveryLedger, Message, MessageBatch, PENDING_MESSAGES, PROCESSED_MESSAGES, Priority, SESSIONS, chrono_duration,
};
use crate::error::CoordResult;

/// Out-of-band notifications raised while consuming
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A high or urgent message was handed to a recipient
    PriorityMessage { recipient: String, message: Message },
}

/// Outcome of one garbage-collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub batches_removed: usize,
    pub ledgers_removed: usize,
}

/// Messages handed to one recipient by a consume call, oldest first
#[derive(Debug, Default)]
pub struct Inbox {
    messages: std::vec::IntoIter<Message>,
}

impl Inbox {
    fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: messages.into_iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.len() == 0
    }
}

impl Iterator for Inbox {
    type Item = Message;

    fn next(&mut self) -> Option<Self::Item> {
        self.messages.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.messages.size_hint()
    }
}

impl ExactSizeIterator for Inbox {}

/// Publishes batched messages and hands them out at most once per recipient
pub struct MessageBus {
    store: Arc<RecordStore>,
    queue: Mutex<BatchingQueue<Message>>,
    wake: Notify,
    flushing: Mutex<()>,
    consuming: Mutex<()>,
    own_batches: Mutex<HashSet<String>>,
    events: broadcast::Sender<BusEvent>,
}

impl MessageBus {
    pub fn new(store: Arc<RecordStore>, config: &MessageConfig) -> Self {
        debug!(batch_size = config.batch_size, flush_interval_ms = config.flush_interval_ms, "MessageBus::new: called");
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            queue: Mutex::new(BatchingQueue::new(config.batch_size, config.flush_interval())),
            wake: Notify::new(),
            flushing: Mutex::new(()),
            consuming: Mutex::new(()),
            own_batches: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Queue a message for the next flush; never touches the store
    pub async fn publish(&self, message: Message) -> usize {
        debug!(id = %message.id, topic = %message.topic, priority = %message.priority, "MessageBus::publish: called");
        let mut queue = self.queue.lock().await;
        if queue.push(message) {
            self.wake.notify_one();
        }
        queue.len()
    }

    /// Messages queued but not yet flushed
    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Write everything queued as one batch record
    ///
    /// On failure the messages go back to the front of the queue and the
    /// error is returned.
    pub async fn flush(&self) -> CoordResult<usize> {
        let _flushing = self.flushing.lock().await;
        let messages = self.queue.lock().await.drain();
        let Some(sender) = messages.first().map(|m| m.sender.clone()) else {
            return Ok(0);
        };
        let count = messages.len();
        let batch = MessageBatch::new(sender, messages);

        let store = Arc::clone(&self.store);
        let (batch, written) = tokio::task::spawn_blocking(move || {
            let written = store.create(PENDING_MESSAGES, &batch.id, &batch);
            (batch, written)
        })
        .await?;
        match written {
            Ok(()) => {
                debug!(batch = %batch.id, count, "MessageBus::flush: batch written");
                self.own_batches.lock().await.insert(batch.id);
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, count, "Message flush failed, requeueing");
                self.queue.lock().await.requeue(batch.messages);
                Err(e.into())
            }
        }
    }

    /// Flush whenever the queue fills or its window closes, until shutdown
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("MessageBus::run_flusher: started");
        loop {
            let deadline = self.queue.lock().await.deadline();
            tokio::select! {
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }

            if self.queue.lock().await.should_flush()
                && let Err(e) = self.flush().await
            {
                warn!(error = %e, "Background flush failed");
                // Avoid spinning on a store that keeps failing
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
        debug!("MessageBus::run_flusher: stopped");
    }

    /// Hand `session_id` every pending message addressed to it that it has not seen
    pub async fn consume(&self, session_id: &str) -> CoordResult<Inbox> {
        self.consume_up_to(session_id, usize::MAX).await
    }

    /// Like [`MessageBus::consume`], but hands out at most `limit` messages
    ///
    /// Messages past the limit stay pending for a later call. The ledger is
    /// written before anything is returned.
    pub async fn consume_up_to(&self, session_id: &str, limit: usize) -> CoordResult<Inbox> {
        debug!(%session_id, limit, "MessageBus::consume_up_to: called");
        if limit == 0 {
            return Ok(Inbox::default());
        }
        let _consuming = self.consuming.lock().await;

        let store = Arc::clone(&self.store);
        let recipient = session_id.to_string();
        let fresh = blocking(move || take_undelivered(&store, &recipient, limit)).await?;

        for message in fresh.iter().filter(|m| m.is_priority()) {
            self.notify_priority(session_id, message);
        }
        if !fresh.is_empty() {
            debug!(%session_id, count = fresh.len(), "MessageBus::consume_up_to: delivered");
        }
        Ok(Inbox::new(fresh))
    }

    /// Delete batches older than `retention` and ledgers nobody will read again
    pub async fn gc(&self, retention: Duration) -> CoordResult<GcReport> {
        debug!(?retention, "MessageBus::gc: called");
        let cutoff = Utc::now() - chrono_duration(retention);
        let mut report = GcReport::default();

        for (id, batch) in self.store.list::<MessageBatch>(PENDING_MESSAGES)? {
            if batch.created_at < cutoff && self.store.delete(PENDING_MESSAGES, &id)? {
                self.own_batches.lock().await.remove(&id);
                report.batches_removed += 1;
            }
        }

        // A ledger untouched for the whole retention window only names collected batches
        for (id, ledger) in self.store.list::<DeliveryLedger>(PROCESSED_MESSAGES)? {
            if ledger.updated_at >= cutoff || self.store.exists(SESSIONS, &id) {
                continue;
            }
            if self
                .store
                .remove_if(PROCESSED_MESSAGES, &id, |current: &DeliveryLedger| current.updated_at < cutoff)?
            {
                report.ledgers_removed += 1;
            }
        }

        if report.batches_removed > 0 || report.ledgers_removed > 0 {
            info!(
                batches = report.batches_removed,
                ledgers = report.ledgers_removed,
                "Collected old messages"
            );
        }
        Ok(report)
    }

    /// True if this bus wrote the batch record
    pub async fn is_own_batch(&self, batch_id: &str) -> bool {
        self.own_batches.lock().await.contains(batch_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    fn notify_priority(&self, recipient: &str, message: &Message) {
        match message.priority {
            Priority::Urgent => warn!(
                %recipient,
                sender = %message.sender,
                topic = %message.topic,
                payload = %message.payload,
                "Urgent message"
            ),
            _ => info!(
                %recipient,
                sender = %message.sender,
                topic = %message.topic,
                "High priority message"
            ),
        }
        // No subscribers is fine
        let _ = self.events.send(BusEvent::PriorityMessage {
            recipient: recipient.to_string(),
            message: message.clone(),
        });
    }
}

/// Pick up to `limit` undelivered messages for `session_id` and record them as delivered
fn take_undelivered(store: &RecordStore, session_id: &str, limit: usize) -> CoordResult<Vec<Message>> {
    let batches = store.list::<MessageBatch>(PENDING_MESSAGES)?;
    let mut ledger = store
        .get::<DeliveryLedger>(PROCESSED_MESSAGES, session_id)?
        .unwrap_or_else(|| DeliveryLedger::new(session_id));

    let pending_ids: HashSet<&str> = batches
        .iter()
        .flat_map(|(_, batch)| batch.messages.iter().map(|m| m.id.as_str()))
        .collect();
    let mut fresh: Vec<Message> = batches
        .iter()
        .flat_map(|(_, batch)| batch.messages.iter())
        .filter(|m| m.is_for(session_id) && !ledger.contains(&m.id))
        .cloned()
        .collect();

    // Ids whose batch was collected can never come back
    let before = ledger.delivered.len();
    ledger.delivered.retain(|id| pending_ids.contains(id.as_str()));
    let pruned = before != ledger.delivered.len();

    if fresh.is_empty() && !pruned {
        return Ok(fresh);
    }

    fresh.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    fresh.truncate(limit);
    ledger.delivered.extend(fresh.iter().map(|m| m.id.clone()));
    ledger.updated_at = Utc::now();
    store.put(PROCESSED_MESSAGES, session_id, &ledger)?;
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Target;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn setup(batch_size: usize) -> (TempDir, Arc<RecordStore>, Arc<MessageBus>) {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        let config = MessageConfig {
            batch_size,
            flush_interval_ms: 50,
            ..Default::default()
        };
        let bus = Arc::new(MessageBus::new(Arc::clone(&store), &config));
        (temp, store, bus)
    }

    fn note(sender: &str, text: &str, target: Target) -> Message {
        Message::new(sender, "note", json!(text), Priority::Normal, target)
    }

    #[tokio::test]
    async fn test_publish_does_not_write_until_flush() {
        let (_temp, store, bus) = setup(10);
        bus.publish(note("a", "one", Target::Broadcast)).await;
        bus.publish(note("a", "two", Target::Broadcast)).await;
        assert_eq!(bus.pending().await, 2);
        assert!(store.list::<MessageBatch>(PENDING_MESSAGES).unwrap().is_empty());

        assert_eq!(bus.flush().await.unwrap(), 2);
        let batches = store.list::<MessageBatch>(PENDING_MESSAGES).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.messages.len(), 2);
        assert!(bus.is_own_batch(&batches[0].0).await);
        assert_eq!(bus.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_up_to_leaves_the_rest_pending() {
        let (_temp, _store, bus) = setup(10);
        for text in ["one", "two", "three"] {
            bus.publish(note("a", text, Target::Broadcast)).await;
        }
        bus.flush().await.unwrap();

        assert!(bus.consume_up_to("b", 0).await.unwrap().is_empty());
        let first: Vec<_> = bus.consume_up_to("b", 2).await.unwrap().map(|m| m.payload).collect();
        assert_eq!(first, vec![json!("one"), json!("two")]);
        let rest: Vec<_> = bus.consume("b").await.unwrap().map(|m| m.payload).collect();
        assert_eq!(rest, vec![json!("three")]);
        assert!(bus.consume("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consume_delivers_once_in_order() {
        let (_temp, _store, bus) = setup(10);
        bus.publish(note("a", "first", Target::Broadcast)).await;
        bus.publish(note("a", "second", Target::Broadcast)).await;
        bus.flush().await.unwrap();

        let got: Vec<serde_json::Value> = bus.consume("b").await.unwrap().map(|m| m.payload).collect();
        assert_eq!(got, vec![json!("first"), json!("second")]);
        assert!(bus.consume("b").await.unwrap().is_empty());
        // Other recipients keep their own ledger
        assert_eq!(bus.consume("c").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sender_and_other_targets_excluded() {
        let (_temp, _store, bus) = setup(10);
        bus.publish(note("a", "for b", Target::Session("b".into()))).await;
        bus.publish(note("a", "all", Target::Broadcast)).await;
        bus.flush().await.unwrap();

        assert!(bus.consume("a").await.unwrap().is_empty());
        assert_eq!(bus.consume("c").await.unwrap().len(), 1);
        assert_eq!(bus.consume("b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_priority_messages_raise_events() {
        let (_temp, _store, bus) = setup(10);
        let mut events = bus.subscribe();
        bus.publish(Message::new("a", "build", json!("rebuild needed"), Priority::Urgent, Target::Broadcast))
            .await;
        bus.publish(note("a", "fyi", Target::Broadcast)).await;
        bus.flush().await.unwrap();

        bus.consume("b").await.unwrap();
        let BusEvent::PriorityMessage { recipient, message } = events.try_recv().unwrap();
        assert_eq!(recipient, "b");
        assert_eq!(message.priority, Priority::Urgent);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flusher_writes_full_batches() {
        let (_temp, store, bus) = setup(2);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = tokio::spawn(Arc::clone(&bus).run_flusher(shutdown_rx));

        bus.publish(note("a", "one", Target::Broadcast)).await;
        bus.publish(note("a", "two", Target::Broadcast)).await;

        let mut written = 0;
        for _ in 0..100 {
            written = store.list::<MessageBatch>(PENDING_MESSAGES).unwrap().len();
            if written > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(written, 1);

        shutdown_tx.send(true).unwrap();
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_flusher_writes_after_interval() {
        let (_temp, store, bus) = setup(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = tokio::spawn(Arc::clone(&bus).run_flusher(shutdown_rx));

        bus.publish(note("a", "lonely", Target::Broadcast)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.list::<MessageBatch>(PENDING_MESSAGES).unwrap().len(), 1);
        assert_eq!(bus.pending().await, 0);

        shutdown_tx.send(true).unwrap();
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_removes_old_batches_and_orphan_ledgers() {
        let (_temp, store, bus) = setup(10);
        let mut old = MessageBatch::new("a", vec![note("a", "old", Target::Broadcast)]);
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        store.put(PENDING_MESSAGES, &old.id, &old).unwrap();
        bus.publish(note("a", "new", Target::Broadcast)).await;
        bus.flush().await.unwrap();

        let mut stale = DeliveryLedger::new("gone");
        stale.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.put(PROCESSED_MESSAGES, "gone", &stale).unwrap();

        let report = bus.gc(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report.batches_removed, 1);
        assert_eq!(report.ledgers_removed, 1);
        assert_eq!(store.list::<MessageBatch>(PENDING_MESSAGES).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_collected_ids_are_pruned_from_ledger() {
        let (_temp, store, bus) = setup(10);
        bus.publish(note("a", "soon gone", Target::Broadcast)).await;
        bus.flush().await.unwrap();
        bus.consume("b").await.unwrap();

        for (id, _) in store.list::<MessageBatch>(PENDING_MESSAGES).unwrap() {
            store.delete(PENDING_MESSAGES, &id).unwrap();
        }
        bus.consume("b").await.unwrap();
        let ledger: DeliveryLedger = store.get(PROCESSED_MESSAGES, "b").unwrap().unwrap();
        assert!(ledger.delivered.is_empty());
    }
}
