//! Coordinator implementation

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use recordstore::RecordStore;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::guard::LockGuard;
use crate::bus::{BusEvent, GcReport, MessageBus};
use crate::config::Config;
use crate::domain::{
    Acquisition, Lock, LockMode, LockSummary, Message, Owner, Priority, Session, SessionStatus, SessionSummary, Target,
    TaskChange,
};
use crate::error::{CoordError, CoordResult};
use crate::lock::LockManager;
use crate::session::{ReapReport, SessionRegistry};
use crate::watcher::{ChangeWatcher, open_source};

/// Inbound messages buffered between the watcher and `poll_messages`
const INBOX_CAPACITY: usize = 256;

/// Shortest period any background loop runs at
const MIN_TICK: Duration = Duration::from_millis(10);

/// Outcome of one on-demand maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub locks_swept: usize,
    pub reap: ReapReport,
    pub gc: GcReport,
}

/// State that exists only between start and stop
struct Running {
    session_id: String,
    owner: Owner,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    inbox_rx: mpsc::Receiver<Message>,
}

/// Composed coordination API for one worker process
pub struct Coordinator {
    config: Config,
    store: Arc<RecordStore>,
    locks: Arc<LockManager>,
    sessions: Arc<SessionRegistry>,
    bus: Arc<MessageBus>,
    running: Mutex<Option<Running>>,
}

impl Coordinator {
    /// Open the configured store; no session exists until [`Coordinator::start`]
    pub fn open(config: Config) -> CoordResult<Self> {
        debug!(root = %config.store.root.display(), "Coordinator::open: called");
        let store = Arc::new(RecordStore::open(&config.store.root)?);
        Ok(Self::with_store(store, config))
    }

    /// Build on an already opened store
    pub fn with_store(store: Arc<RecordStore>, config: Config) -> Self {
        let cache_ttl = config.cache.ttl();
        Self {
            locks: Arc::new(LockManager::new(Arc::clone(&store), cache_ttl, config.locks.default_ttl())),
            sessions: Arc::new(SessionRegistry::new(Arc::clone(&store), cache_ttl, config.sessions.clone())),
            bus: Arc::new(MessageBus::new(Arc::clone(&store), &config.messages)),
            store,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Current session id, None before start and after stop
    pub async fn session_id(&self) -> Option<String> {
        self.running.lock().await.as_ref().map(|r| r.session_id.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Register a session and start the background tasks
    ///
    /// Calling start on a running coordinator returns the existing session id.
    pub async fn start(&self, owner: Owner) -> CoordResult<String> {
        debug!(pid = owner.pid, "Coordinator::start: called");
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            debug!(session = %current.session_id, "Coordinator::start: already running");
            return Ok(current.session_id.clone());
        }

        let session = self.sessions.register(Session::new(owner.clone())).await?;
        let source = match open_source(Arc::clone(&self.store), &self.config.watcher) {
            Ok(source) => source,
            Err(e) => {
                // Do not leave a session behind that nobody heartbeats
                if let Err(cleanup) = self.sessions.transition(&session.id, SessionStatus::Disconnected).await {
                    warn!(error = %cleanup, "Failed to disconnect session after start failure");
                }
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let tasks = vec![
            tokio::spawn(heartbeat_loop(
                Arc::clone(&self.sessions),
                session.id.clone(),
                owner.clone(),
                self.config.sessions.heartbeat_interval(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(sweep_loop(
                Arc::clone(&self.locks),
                Arc::clone(&self.bus),
                self.config.locks.sweep_interval(),
                self.config.messages.retention(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(reap_loop(
                Arc::clone(&self.sessions),
                Arc::clone(&self.locks),
                self.config.sessions.reap_interval(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(Arc::clone(&self.bus).run_flusher(shutdown_rx.clone())),
            tokio::spawn(
                ChangeWatcher::new(
                    source,
                    Arc::clone(&self.locks),
                    Arc::clone(&self.sessions),
                    Arc::clone(&self.bus),
                    session.id.clone(),
                    inbox_tx,
                )
                .run(shutdown_rx),
            ),
        ];

        info!(session = %session.id, pid = owner.pid, root = %self.store.root().display(), "Coordinator started");
        *running = Some(Running {
            session_id: session.id.clone(),
            owner,
            shutdown_tx,
            tasks,
            inbox_rx,
        });
        Ok(session.id)
    }

    /// Flush, release every lock, disconnect the session and stop the tasks
    ///
    /// Safe to call more than once. If the final flush fails the rest of the
    /// shutdown still happens and the loss is reported.
    pub async fn stop(&self) -> CoordResult<()> {
        debug!("Coordinator::stop: called");
        let Some(running) = self.running.lock().await.take() else {
            debug!("Coordinator::stop: not running");
            return Ok(());
        };
        let Running {
            session_id,
            shutdown_tx,
            tasks,
            inbox_rx,
            ..
        } = running;

        // Nothing reads the inbox past this point; a blocked watcher sees it closed
        drop(inbox_rx);
        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let flushed = self.bus.flush().await;
        if let Err(e) = self.locks.release_all(&session_id).await {
            warn!(session = %session_id, error = %e, "Failed to release locks on stop");
        }
        if let Err(e) = self.sessions.transition(&session_id, SessionStatus::Disconnected).await {
            warn!(session = %session_id, error = %e, "Failed to mark session disconnected");
        }
        self.sessions.sync().await;
        info!(session = %session_id, "Coordinator stopped");

        match flushed {
            Ok(_) => Ok(()),
            Err(e) => Err(CoordError::MessageDeliveryBestEffort {
                lost: self.bus.pending().await,
                reason: e.to_string(),
            }),
        }
    }

    /// Stop when SIGINT or SIGTERM arrives
    pub fn stop_on_signal(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            wait_for_signal().await;
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Shutdown after signal was incomplete");
            }
        })
    }

    pub async fn heartbeat(&self) -> CoordResult<Session> {
        self.touch(TaskChange::Keep, None).await
    }

    pub async fn set_task(&self, task: &str) -> CoordResult<Session> {
        self.touch(TaskChange::Set(task.to_string()), None).await
    }

    pub async fn clear_task(&self) -> CoordResult<Session> {
        self.touch(TaskChange::Clear, None).await
    }

    pub async fn set_location(&self, location: &str) -> CoordResult<Session> {
        self.touch(TaskChange::Keep, Some(location)).await
    }

    /// Single acquire attempt for this session
    pub async fn acquire(
        &self,
        resource_key: &str,
        mode: LockMode,
        ttl: Option<Duration>,
        operation: Option<&str>,
    ) -> CoordResult<Acquisition> {
        let holder = self.require_session().await?;
        self.locks.acquire(resource_key, mode, &holder, ttl, operation).await
    }

    /// Release this session's leases on a resource; false if it held none
    pub async fn release(&self, resource_key: &str) -> CoordResult<bool> {
        let holder = self.require_session().await?;
        self.locks.release(resource_key, &holder).await
    }

    pub async fn renew(&self, resource_key: &str, ttl: Option<Duration>) -> CoordResult<Lock> {
        let holder = self.require_session().await?;
        self.locks.renew(resource_key, &holder, ttl).await
    }

    /// Single acquire attempt returning a guard; a conflict is an error here
    pub async fn lock(
        &self,
        resource_key: &str,
        mode: LockMode,
        ttl: Option<Duration>,
        operation: Option<&str>,
    ) -> CoordResult<LockGuard> {
        match self.acquire(resource_key, mode, ttl, operation).await? {
            Acquisition::Granted(lock) => Ok(LockGuard::new(Arc::clone(&self.locks), lock)),
            Acquisition::Conflict(conflict) => Err(CoordError::LockConflict(conflict)),
        }
    }

    /// Acquire with bounded, jittered retries
    ///
    /// Conflicts and contention are retried; gives up with the last one after
    /// `locks.retry-attempts` tries.
    pub async fn lock_with_retry(
        &self,
        resource_key: &str,
        mode: LockMode,
        ttl: Option<Duration>,
        operation: Option<&str>,
    ) -> CoordResult<LockGuard> {
        let attempts = self.config.locks.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.lock(resource_key, mode, ttl, operation).await {
                Err(e @ (CoordError::LockConflict(_) | CoordError::LockContended { .. })) if attempt + 1 < attempts => {
                    let delay = with_jitter(self.config.locks.backoff(attempt));
                    debug!(%resource_key, error = %e, attempt, ?delay, "Coordinator::lock_with_retry: waiting");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run `f` while holding the lock
    ///
    /// The lock is released on return; if the future is cancelled the guard's
    /// drop releases it.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource_key: &str,
        mode: LockMode,
        ttl: Option<Duration>,
        operation: Option<&str>,
        f: F,
    ) -> CoordResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock_with_retry(resource_key, mode, ttl, operation).await?;
        let output = f().await;
        if let Err(e) = guard.release().await {
            warn!(%resource_key, error = %e, "Failed to release scoped lock");
        }
        Ok(output)
    }

    /// Queue a message; returns its id
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        priority: Priority,
        target: Target,
    ) -> CoordResult<String> {
        let sender = self.require_session().await?;
        let message = Message::new(sender, topic, payload, priority, target);
        let id = message.id.clone();
        self.bus.publish(message).await;
        Ok(id)
    }

    /// Write queued messages now
    pub async fn flush(&self) -> CoordResult<usize> {
        self.bus.flush().await
    }

    /// Messages for this session not yet handed out, oldest first
    pub async fn poll_messages(&self) -> CoordResult<Vec<Message>> {
        let mut running = self.running.lock().await;
        let running = running.as_mut().ok_or(CoordError::NotStarted)?;

        let mut messages = Vec::new();
        while let Ok(message) = running.inbox_rx.try_recv() {
            messages.push(message);
        }
        match self.bus.consume(&running.session_id).await {
            Ok(inbox) => messages.extend(inbox),
            Err(e) if !messages.is_empty() => warn!(error = %e, "Consume failed, returning watcher deliveries only"),
            Err(e) => return Err(e),
        }
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Live sessions for status displays; empty if the store cannot be read
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let now = Utc::now();
        match self.sessions.list().await {
            Ok(sessions) => sessions.iter().map(|s| s.summary(now)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list sessions");
                Vec::new()
            }
        }
    }

    /// Unexpired locks for status displays; empty if the store cannot be read
    pub async fn list_locks(&self) -> Vec<LockSummary> {
        let now = Utc::now();
        match self.locks.list().await {
            Ok(locks) => locks.iter().map(|l| l.summary(now)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list locks");
                Vec::new()
            }
        }
    }

    /// One sweep, reap and message gc pass, outside the timers
    pub async fn maintain(&self) -> CoordResult<MaintenanceReport> {
        debug!("Coordinator::maintain: called");
        let locks_swept = self.locks.sweep().await?;
        let reap = self.sessions.reap(&self.locks).await?;
        let gc = self.bus.gc(self.config.messages.retention()).await?;
        Ok(MaintenanceReport { locks_swept, reap, gc })
    }

    async fn require_session(&self) -> CoordResult<String> {
        self.session_id().await.ok_or(CoordError::NotStarted)
    }

    async fn touch(&self, task: TaskChange, location: Option<&str>) -> CoordResult<Session> {
        let (session_id, owner) = {
            let running = self.running.lock().await;
            let running = running.as_ref().ok_or(CoordError::NotStarted)?;
            (running.session_id.clone(), running.owner.clone())
        };
        beat(&self.sessions, &session_id, &owner, task, location).await
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            warn!(session = %running.session_id, "Coordinator dropped without stop; session will be reaped");
            let _ = running.shutdown_tx.send(true);
        }
    }
}

/// Heartbeat, re-registering if a reaper removed our record while we were stalled
async fn beat(
    sessions: &SessionRegistry,
    session_id: &str,
    owner: &Owner,
    task: TaskChange,
    location: Option<&str>,
) -> CoordResult<Session> {
    match sessions.heartbeat(session_id, task.clone(), location).await {
        Err(CoordError::SessionNotFound(_)) => {
            warn!(session = %session_id, "Session record missing, registering again");
            let session = Session {
                id: session_id.to_string(),
                ..Session::new(owner.clone())
            };
            sessions.register(session).await?;
            sessions.heartbeat(session_id, task, location).await
        }
        other => other,
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(MIN_TICK);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn with_jitter(base: Duration) -> Duration {
    let spread = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

async fn heartbeat_loop(
    sessions: Arc<SessionRegistry>,
    session_id: String,
    owner: Owner,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(session = %session_id, ?every, "heartbeat_loop: started");
    let mut interval = ticker(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = beat(&sessions, &session_id, &owner, TaskChange::Keep, None).await {
            warn!(session = %session_id, error = %e, "Heartbeat failed");
        }
    }
    debug!(session = %session_id, "heartbeat_loop: stopped");
}

async fn sweep_loop(
    locks: Arc<LockManager>,
    bus: Arc<MessageBus>,
    every: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(?every, "sweep_loop: started");
    let mut interval = ticker(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = locks.sweep().await {
            warn!(error = %e, "Lock sweep failed, retrying next tick");
        }
        if let Err(e) = bus.gc(retention).await {
            warn!(error = %e, "Message gc failed, retrying next tick");
        }
    }
    debug!("sweep_loop: stopped");
}

async fn reap_loop(
    sessions: Arc<SessionRegistry>,
    locks: Arc<LockManager>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(?every, "reap_loop: started");
    let mut interval = ticker(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = sessions.reap(&locks).await {
            warn!(error = %e, "Session reap failed, retrying next tick");
        }
    }
    debug!("reap_loop: stopped");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => warn!("SIGINT received"),
                    _ = sigterm.recv() => warn!("SIGTERM received"),
                }
            }
            _ => {
                warn!("Signal handlers unavailable, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        warn!("Ctrl+C received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::WatchMode;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn coordinator() -> (TempDir, Coordinator) {
        let temp = tempdir().unwrap();
        let mut config = Config::default();
        config.store.root = temp.path().to_path_buf();
        config.watcher.mode = WatchMode::Polling;
        config.watcher.poll_interval_ms = 20;
        (temp, Coordinator::open(config).unwrap())
    }

    #[tokio::test]
    async fn test_calls_before_start_fail() {
        let (_temp, coord) = coordinator();
        assert!(matches!(coord.heartbeat().await, Err(CoordError::NotStarted)));
        assert!(matches!(
            coord.acquire("k", LockMode::Write, None, None).await,
            Err(CoordError::NotStarted)
        ));
        assert!(matches!(
            coord.publish("t", json!(1), Priority::Normal, Target::Broadcast).await,
            Err(CoordError::NotStarted)
        ));
        // Reads still work
        assert!(coord.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_unusable_store_fails_writes_but_not_listings() {
        let temp = tempdir().unwrap();
        let mut config = Config::default();
        config.store.root = temp.path().join("store");
        config.watcher.mode = WatchMode::Polling;
        let coord = Coordinator::open(config).unwrap();
        std::fs::remove_dir_all(coord.store().root()).unwrap();
        std::fs::write(coord.store().root(), "not a directory").unwrap();

        assert!(matches!(
            coord.start(Owner::current()).await,
            Err(CoordError::StoreUnavailable(_))
        ));
        assert!(!coord.is_running().await);
        assert!(coord.list_sessions().await.is_empty());
        assert!(coord.list_locks().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_disconnects() {
        let (_temp, coord) = coordinator();
        let id = coord.start(Owner::current()).await.unwrap();
        assert_eq!(coord.start(Owner::current()).await.unwrap(), id);
        assert_eq!(coord.list_sessions().await.len(), 1);

        coord.lock("src/main.rs", LockMode::Write, None, None).await.unwrap().release().await.unwrap();
        coord.acquire("src/lib.rs", LockMode::Write, None, Some("edit")).await.unwrap();
        assert_eq!(coord.list_locks().await.len(), 1);

        coord.stop().await.unwrap();
        coord.stop().await.unwrap();
        assert!(!coord.is_running().await);

        let session: Session = coord.store().get(crate::domain::SESSIONS, &id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Disconnected);
        assert!(coord.locks.holder_of("src/lib.rs").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_task_shows_in_listing() {
        let (_temp, coord) = coordinator();
        coord.start(Owner::current()).await.unwrap();
        coord.set_task("write tests").await.unwrap();
        coord.set_location("cw/src").await.unwrap();

        let sessions = coord.list_sessions().await;
        assert_eq!(sessions[0].current_task.as_deref(), Some("write tests"));
        assert_eq!(sessions[0].location.as_deref(), Some("cw/src"));

        coord.clear_task().await.unwrap();
        assert!(coord.list_sessions().await[0].current_task.is_none());
        coord.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_recreates_missing_record() {
        let (_temp, coord) = coordinator();
        let id = coord.start(Owner::current()).await.unwrap();
        coord.store().delete(crate::domain::SESSIONS, &id).unwrap();
        coord.sessions.invalidate(Some(&id)).await;

        let session = coord.heartbeat().await.unwrap();
        assert_eq!(session.id, id);
        coord.stop().await.unwrap();
        assert!(coord.store().exists(crate::domain::SESSIONS, &id));
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_body() {
        let (_temp, coord) = coordinator();
        coord.start(Owner::current()).await.unwrap();

        let value = coord
            .with_lock("db", LockMode::Exclusive, None, Some("migrate"), || async {
                42
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(coord.list_locks().await.is_empty());
        coord.stop().await.unwrap();
    }

    #[test]
    fn test_jitter_stays_within_half() {
        for _ in 0..100 {
            let delay = with_jitter(Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
