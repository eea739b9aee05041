//! SessionRegistry implementation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recordstore::RecordStore;
use tracing::{debug, info, warn};

use crate::cache::RecordCache;
use crate::config::SessionConfig;
use crate::domain::{SESSIONS, Session, SessionStatus, TaskChange};
use crate::error::{CoordError, CoordResult};
use crate::lock::LockManager;

/// Outcome of one reap pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions moved from active to idle
    pub idled: Vec<String>,
    /// Sessions disconnected and deleted
    pub removed: Vec<String>,
    /// Leases released on behalf of removed sessions
    pub locks_released: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.idled.is_empty() && self.removed.is_empty() && self.locks_released == 0
    }
}

/// Tracks registered sessions in the store
///
/// Each call touches at most a few small records, so store I/O runs inline.
pub struct SessionRegistry {
    store: Arc<RecordStore>,
    cache: RecordCache<Session>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<RecordStore>, cache_ttl: std::time::Duration, config: SessionConfig) -> Self {
        debug!(?cache_ttl, "SessionRegistry::new: called");
        Self {
            cache: RecordCache::new(Arc::clone(&store), SESSIONS, cache_ttl),
            store,
            config,
        }
    }

    /// Upsert a session as active, stamped now; a failed write is a hard error
    pub async fn register(&self, mut session: Session) -> CoordResult<Session> {
        debug!(id = %session.id, "SessionRegistry::register: called");
        let now = Utc::now();
        session.status = SessionStatus::Active;
        session.created_at = now;
        session.last_active = now;
        self.store.put(SESSIONS, &session.id, &session)?;
        self.cache.insert_local(&session.id, session.clone()).await;
        info!(id = %session.id, pid = session.owner.pid, host = %session.owner.host, "Session registered");
        Ok(session)
    }

    /// Record activity and optional task/location changes
    ///
    /// Visible locally at once and persisted in the background. Repeating the
    /// same heartbeat only moves `last_active` forward.
    pub async fn heartbeat(&self, id: &str, task: TaskChange, location: Option<&str>) -> CoordResult<Session> {
        debug!(%id, ?task, "SessionRegistry::heartbeat: called");
        let mut session = match self.cache.get(id).await? {
            Some(session) => session,
            None => self
                .store
                .get::<Session>(SESSIONS, id)?
                .ok_or_else(|| CoordError::SessionNotFound(id.to_string()))?,
        };
        session.touch(Utc::now(), &task, location);
        self.cache.update(id, session.clone()).await;
        Ok(session)
    }

    /// Explicit status change; a no-op if the session already has it
    pub async fn transition(&self, id: &str, status: SessionStatus) -> CoordResult<Session> {
        debug!(%id, %status, "SessionRegistry::transition: called");
        // Let queued heartbeats land first so they cannot overwrite the change
        self.cache.sync().await;
        let current = self
            .store
            .get::<Session>(SESSIONS, id)?
            .ok_or_else(|| CoordError::SessionNotFound(id.to_string()))?;
        if current.status == status {
            return Ok(current);
        }

        let updated = self.store.update_if(SESSIONS, id, |session: &Session| {
            (session.status != status).then(|| Session {
                status,
                ..session.clone()
            })
        })?;
        let session = match updated {
            Some(session) => session,
            None => self
                .store
                .get::<Session>(SESSIONS, id)?
                .ok_or_else(|| CoordError::SessionNotFound(id.to_string()))?,
        };
        info!(%id, %status, "Session transitioned");
        self.cache.insert_local(id, session.clone()).await;
        Ok(session)
    }

    /// Sessions that are not disconnected and were active within the liveness window
    pub async fn list(&self) -> CoordResult<Vec<Session>> {
        let now = Utc::now();
        let window = self.config.liveness_window();
        let mut sessions: Vec<Session> = self
            .cache
            .all()
            .await?
            .into_iter()
            .filter(|session| session.is_live(now, window))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    pub async fn get(&self, id: &str) -> CoordResult<Option<Session>> {
        self.cache.get(id).await
    }

    /// Idle out quiet sessions, remove dead ones and release their locks
    pub async fn reap(&self, locks: &LockManager) -> CoordResult<ReapReport> {
        debug!("SessionRegistry::reap: called");
        let now = Utc::now();
        let mut report = ReapReport::default();

        for (id, session) in self.store.list::<Session>(SESSIONS)? {
            if self.is_dead(&session, now) {
                // Re-check under the guard so a heartbeat that just landed wins
                let removed = self
                    .store
                    .remove_if(SESSIONS, &id, |current: &Session| self.is_dead(current, Utc::now()))?;
                if !removed {
                    continue;
                }
                info!(%id, status = %session.status, inactive_secs = session.inactive_for(now).as_secs(), "Session disconnected and removed");
                self.cache.remove_local(&id).await;
                match locks.release_all(&id).await {
                    Ok(count) => report.locks_released += count,
                    Err(e) => warn!(%id, error = %e, "Failed to release locks of reaped session"),
                }
                report.removed.push(id);
            } else if session.status == SessionStatus::Active && session.inactive_for(now) > self.config.idle_after() {
                let idle_after = self.config.idle_after();
                let updated = self.store.update_if(SESSIONS, &id, |current: &Session| {
                    (current.status == SessionStatus::Active && current.inactive_for(Utc::now()) > idle_after).then(|| {
                        Session {
                            status: SessionStatus::Idle,
                            ..current.clone()
                        }
                    })
                })?;
                if let Some(session) = updated {
                    debug!(%id, "SessionRegistry::reap: marked idle");
                    self.cache.insert_local(&id, session).await;
                    report.idled.push(id);
                }
            }
        }

        if !report.is_empty() {
            info!(
                idled = report.idled.len(),
                removed = report.removed.len(),
                locks_released = report.locks_released,
                "Reap pass complete"
            );
        }
        Ok(report)
    }

    /// Wait for background heartbeat writes
    pub async fn sync(&self) {
        self.cache.sync().await;
    }

    /// Forget cached state after another process changed a session
    pub async fn invalidate(&self, id: Option<&str>) {
        match id {
            Some(id) => self.cache.invalidate_id(id).await,
            None => self.cache.invalidate().await,
        }
    }

    fn is_dead(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if session.status == SessionStatus::Disconnected {
            return true;
        }
        if session.inactive_for(now) > self.config.liveness_window() {
            return true;
        }
        self.config.reap_dead_owners && session.owner.is_local() && !session.owner.is_alive()
    }
}
