//! ChangeWatcher loop

use std::sync::Arc;

use recordstore::RecordStore;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::config::{WatchMode, WatcherConfig};
use super::native::NotifySource;
use super::polling::PollingSource;
use super::source::{ChangeKind, ChangeSource, StoreChange};
use crate::bus::MessageBus;
use crate::domain::{Category, LOCKS, Message, PENDING_MESSAGES, SESSIONS};
use crate::error::CoordResult;
use crate::lock::LockManager;
use crate::session::SessionRegistry;

/// Store categories whose changes matter to a coordinator
pub const WATCHED_CATEGORIES: [&str; 3] = [SESSIONS, LOCKS, PENDING_MESSAGES];

/// Pick a change source for the configured mode
///
/// `Auto` falls back to polling when native events are unavailable;
/// `Native` reports the failure instead.
pub fn open_source(store: Arc<RecordStore>, config: &WatcherConfig) -> CoordResult<Box<dyn ChangeSource>> {
    debug!(mode = %config.mode, "open_source: called");
    let polling = |store: Arc<RecordStore>| -> Box<dyn ChangeSource> {
        Box::new(PollingSource::new(store, WATCHED_CATEGORIES.to_vec(), config.poll_interval()))
    };
    match config.mode {
        WatchMode::Polling => Ok(polling(store)),
        WatchMode::Native => Ok(Box::new(NotifySource::new(store, config.debounce())?)),
        WatchMode::Auto => match NotifySource::new(Arc::clone(&store), config.debounce()) {
            Ok(source) => Ok(Box::new(source)),
            Err(e) => {
                warn!(error = %e, "Native change events unavailable, falling back to polling");
                Ok(polling(store))
            }
        },
    }
}

/// Applies observed store changes to one coordinator's state
pub struct ChangeWatcher {
    source: Box<dyn ChangeSource>,
    dispatch: Dispatch,
}

/// Everything a change batch is applied to
struct Dispatch {
    locks: Arc<LockManager>,
    sessions: Arc<SessionRegistry>,
    bus: Arc<MessageBus>,
    session_id: String,
    inbox: mpsc::Sender<Message>,
}

impl ChangeWatcher {
    pub fn new(
        source: Box<dyn ChangeSource>,
        locks: Arc<LockManager>,
        sessions: Arc<SessionRegistry>,
        bus: Arc<MessageBus>,
        session_id: String,
        inbox: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            source,
            dispatch: Dispatch {
                locks,
                sessions,
                bus,
                session_id,
                inbox,
            },
        }
    }

    /// Process change batches until shutdown or the source ends
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self { mut source, dispatch } = self;
        info!(source = source.name(), session = %dispatch.session_id, "ChangeWatcher started");
        loop {
            let batch = tokio::select! {
                batch = source.next_batch() => batch,
                _ = shutdown.changed() => break,
            };
            let Some(changes) = batch else {
                warn!(source = source.name(), "Change source closed");
                break;
            };
            let open = tokio::select! {
                open = dispatch.apply(changes) => open,
                _ = shutdown.changed() => break,
            };
            if !open {
                debug!("ChangeWatcher::run: inbox closed");
                break;
            }
        }
        info!(session = %dispatch.session_id, "ChangeWatcher stopped");
    }
}

impl Dispatch {
    /// Returns false once nobody is reading the inbox
    async fn apply(&self, changes: Vec<StoreChange>) -> bool {
        debug!(count = changes.len(), "Dispatch::apply: called");
        let mut inbound = false;
        for change in &changes {
            match change.category {
                Category::Sessions => self.sessions.invalidate(Some(&change.id)).await,
                Category::Locks => self.locks.invalidate(Some(&change.id)).await,
                Category::Messages => {
                    inbound |= change.store_category == PENDING_MESSAGES
                        && change.kind == ChangeKind::Written
                        && !self.bus.is_own_batch(&change.id).await;
                }
            }
        }
        if !inbound {
            return true;
        }

        if self.inbox.is_closed() {
            return false;
        }
        // Only take what fits; the rest stays pending for poll_messages
        let room = self.inbox.capacity();
        if room == 0 {
            debug!(session = %self.session_id, "Dispatch::apply: inbox full, leaving messages pending");
            return true;
        }
        match self.bus.consume_up_to(&self.session_id, room).await {
            Ok(inbox) => {
                for message in inbox {
                    match self.inbox.try_send(message) {
                        Ok(()) => {}
                        Err(TrySendError::Closed(_)) => return false,
                        Err(TrySendError::Full(message)) => {
                            warn!(id = %message.id, "Inbox filled while delivering, message dropped");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to consume inbound messages"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MessageConfig, SessionConfig};
    use crate::domain::{LockMode, Priority, Target};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Replays prepared batches, then ends
    struct Scripted(Vec<Vec<StoreChange>>);

    #[async_trait]
    impl ChangeSource for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn next_batch(&mut self) -> Option<Vec<StoreChange>> {
            if self.0.is_empty() { None } else { Some(self.0.remove(0)) }
        }
    }

    #[tokio::test]
    async fn test_polling_mode_opens_polling_source() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        let config = WatcherConfig {
            mode: WatchMode::Polling,
            ..Default::default()
        };
        assert_eq!(open_source(store, &config).unwrap().name(), "polling");
    }

    #[tokio::test]
    async fn test_changes_invalidate_and_deliver() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        let locks = Arc::new(LockManager::new(Arc::clone(&store), Duration::from_secs(60), Duration::from_secs(60)));
        let sessions = Arc::new(SessionRegistry::new(
            Arc::clone(&store),
            Duration::from_secs(60),
            SessionConfig::default(),
        ));
        let bus = Arc::new(MessageBus::new(Arc::clone(&store), &MessageConfig::default()));

        // Warm the lock cache, then change the store behind its back
        assert!(locks.list().await.unwrap().is_empty());
        let other = LockManager::new(Arc::clone(&store), Duration::from_secs(60), Duration::from_secs(60));
        other.acquire("k", LockMode::Write, "other", None, None).await.unwrap();
        assert!(locks.list().await.unwrap().is_empty());

        // Another process publishes
        let remote = MessageBus::new(Arc::clone(&store), &MessageConfig::default());
        remote
            .publish(Message::new("other", "t", json!("hi"), Priority::Normal, Target::Broadcast))
            .await;
        remote.flush().await.unwrap();
        let batch_id = store.list::<crate::domain::MessageBatch>(PENDING_MESSAGES).unwrap()[0].0.clone();

        let script = vec![vec![
            StoreChange::new(LOCKS, "k", ChangeKind::Written).unwrap(),
            StoreChange::new(PENDING_MESSAGES, batch_id, ChangeKind::Written).unwrap(),
        ]];
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ChangeWatcher::new(
            Box::new(Scripted(script)),
            Arc::clone(&locks),
            sessions,
            Arc::clone(&bus),
            "me".to_string(),
            tx,
        );
        watcher.run(shutdown_rx).await;

        assert_eq!(locks.list().await.unwrap().len(), 1);
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.payload, json!("hi"));
        // Already delivered through the watcher
        assert!(bus.consume("me").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_inbox_leaves_messages_pending() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        let locks = Arc::new(LockManager::new(Arc::clone(&store), Duration::from_secs(60), Duration::from_secs(60)));
        let sessions = Arc::new(SessionRegistry::new(
            Arc::clone(&store),
            Duration::from_secs(60),
            SessionConfig::default(),
        ));
        let bus = Arc::new(MessageBus::new(Arc::clone(&store), &MessageConfig::default()));

        let remote = MessageBus::new(Arc::clone(&store), &MessageConfig::default());
        for n in 0..5 {
            remote
                .publish(Message::new("other", "t", json!(n), Priority::Normal, Target::Broadcast))
                .await;
        }
        remote.flush().await.unwrap();
        let batch_id = store.list::<crate::domain::MessageBatch>(PENDING_MESSAGES).unwrap()[0].0.clone();

        // The same batch is seen twice; the second pass finds the inbox full
        let change = || StoreChange::new(PENDING_MESSAGES, batch_id.clone(), ChangeKind::Written).unwrap();
        let script = vec![vec![change()], vec![change()]];
        let (tx, mut rx) = mpsc::channel(2);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ChangeWatcher::new(
            Box::new(Scripted(script)),
            locks,
            sessions,
            Arc::clone(&bus),
            "me".to_string(),
            tx,
        );
        tokio::time::timeout(Duration::from_secs(5), watcher.run(shutdown_rx))
            .await
            .expect("watcher must not block on a full inbox");

        assert_eq!(rx.recv().await.unwrap().payload, json!(0));
        assert_eq!(rx.recv().await.unwrap().payload, json!(1));
        let rest: Vec<_> = bus.consume("me").await.unwrap().map(|m| m.payload).collect();
        assert_eq!(rest, vec![json!(2), json!(3), json!(4)]);
    }
}
