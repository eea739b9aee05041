//! LockManager implementation

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recordstore::RecordStore;
use tracing::{debug, info, warn};

use crate::cache::{RecordCache, blocking};
use crate::domain::{Acquisition, LOCKS, Lock, LockConflict, LockMode, reader_id, slot_id};
use crate::error::{CoordError, CoordResult};

/// Claim attempts before giving up on a slot that keeps changing under us
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Settled outcome of claiming a lease in the store
enum Claim {
    Granted(Lock),
    Blocked(Lock),
}

/// Grants, renews and revokes leases on shared resources
///
/// The acquire path runs its store I/O on the blocking pool. Other calls do a
/// handful of small-file operations inline.
pub struct LockManager {
    store: Arc<RecordStore>,
    cache: RecordCache<Lock>,
    default_ttl: Duration,
    claim_attempts: usize,
}

impl LockManager {
    pub fn new(store: Arc<RecordStore>, cache_ttl: Duration, default_ttl: Duration) -> Self {
        debug!(?cache_ttl, ?default_ttl, "LockManager::new: called");
        Self {
            cache: RecordCache::new(Arc::clone(&store), LOCKS, cache_ttl),
            store,
            default_ttl,
            claim_attempts: MAX_CLAIM_ATTEMPTS,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Try to take `mode` on `resource_key` for `holder`
    ///
    /// A conflict is an ordinary outcome, not an error. Re-acquiring a lease
    /// the holder already has renews it.
    pub async fn acquire(
        &self,
        resource_key: &str,
        mode: LockMode,
        holder: &str,
        ttl: Option<Duration>,
        operation: Option<&str>,
    ) -> CoordResult<Acquisition> {
        debug!(%resource_key, %mode, %holder, "LockManager::acquire: called");
        let ttl = ttl.unwrap_or(self.default_ttl);
        let operation = operation.map(str::to_string);

        if let Some(blocker) = self.cached_blocker(resource_key, mode, holder).await {
            // The cache only suggests a conflict; the store decides
            let store = Arc::clone(&self.store);
            let id = blocker.record_id();
            let current = blocking(move || Ok(store.get::<Lock>(LOCKS, &id)?)).await?;
            match current {
                Some(current) if current.resource_key == resource_key && current.blocks(mode, holder, Utc::now()) => {
                    debug!(%resource_key, holder = %current.holder, "LockManager::acquire: conflict confirmed");
                    self.cache.insert_local(&current.record_id(), current.clone()).await;
                    return Ok(Acquisition::Conflict(LockConflict::from(&current)));
                }
                _ => {
                    debug!(%resource_key, "LockManager::acquire: cached conflict was stale");
                    self.cache.invalidate().await;
                }
            }
        }

        let store = Arc::clone(&self.store);
        let key = resource_key.to_string();
        let who = holder.to_string();
        let attempts = self.claim_attempts;
        let outcome = blocking(move || claim(&store, &key, mode, &who, ttl, operation, attempts)).await?;

        match outcome {
            Claim::Granted(lock) => {
                info!(%resource_key, %mode, %holder, lease_id = %lock.lease_id, "Lock granted");
                self.cache.insert_local(&lock.record_id(), lock.clone()).await;
                Ok(Acquisition::Granted(lock))
            }
            Claim::Blocked(lock) => {
                debug!(%resource_key, holder = %lock.holder, "LockManager::acquire: conflict");
                self.cache.insert_local(&lock.record_id(), lock.clone()).await;
                Ok(Acquisition::Conflict(LockConflict::from(&lock)))
            }
        }
    }

    /// Drop `holder`'s leases on `resource_key`; a no-op when it holds none
    pub async fn release(&self, resource_key: &str, holder: &str) -> CoordResult<bool> {
        debug!(%resource_key, %holder, "LockManager::release: called");
        let mut released = false;
        for id in [slot_id(resource_key), reader_id(resource_key, holder)] {
            let owned = |lock: &Lock| lock.holder == holder && lock.resource_key == resource_key;
            if self.store.remove_if(LOCKS, &id, owned)? {
                self.cache.remove_local(&id).await;
                released = true;
            }
        }
        if released {
            info!(%resource_key, %holder, "Lock released");
        } else {
            debug!(%resource_key, %holder, "LockManager::release: nothing held");
        }
        Ok(released)
    }

    /// Drop exactly this lease, leaving any other lease of the holder alone
    pub async fn release_lease(&self, lock: &Lock) -> CoordResult<bool> {
        debug!(resource_key = %lock.resource_key, lease_id = %lock.lease_id, "LockManager::release_lease: called");
        let id = lock.record_id();
        let released = self
            .store
            .remove_if(LOCKS, &id, |current: &Lock| current.lease_id == lock.lease_id)?;
        if released {
            self.cache.remove_local(&id).await;
            info!(resource_key = %lock.resource_key, holder = %lock.holder, "Lock released");
        }
        Ok(released)
    }

    /// Release every lease held by `holder`
    pub async fn release_all(&self, holder: &str) -> CoordResult<usize> {
        debug!(%holder, "LockManager::release_all: called");
        let mut released = 0;
        for (id, lock) in self.store.list::<Lock>(LOCKS)? {
            if lock.holder != holder {
                continue;
            }
            let lease_id = lock.lease_id.clone();
            if self.store.remove_if(LOCKS, &id, |current: &Lock| current.lease_id == lease_id)? {
                self.cache.remove_local(&id).await;
                released += 1;
            }
        }
        if released > 0 {
            info!(%holder, released, "Released all locks");
        }
        Ok(released)
    }

    /// Extend a lease `holder` currently has on `resource_key`
    pub async fn renew(&self, resource_key: &str, holder: &str, ttl: Option<Duration>) -> CoordResult<Lock> {
        debug!(%resource_key, %holder, "LockManager::renew: called");
        let ttl = ttl.unwrap_or(self.default_ttl);
        for id in [slot_id(resource_key), reader_id(resource_key, holder)] {
            let renewed = self.store.update_if(LOCKS, &id, |lock: &Lock| {
                (lock.holder == holder && lock.resource_key == resource_key && !lock.is_expired(Utc::now()))
                    .then(|| lock.renewed(ttl))
            })?;
            if let Some(lock) = renewed {
                self.cache.insert_local(&id, lock.clone()).await;
                return Ok(lock);
            }
        }
        Err(CoordError::LockNotOwned {
            resource_key: resource_key.to_string(),
            holder: holder.to_string(),
        })
    }

    /// Delete every expired lease regardless of holder
    pub async fn sweep(&self) -> CoordResult<usize> {
        debug!("LockManager::sweep: called");
        let now = Utc::now();
        let mut swept = 0;
        for (id, lock) in self.store.list::<Lock>(LOCKS)? {
            if !lock.is_expired(now) {
                continue;
            }
            let lease_id = lock.lease_id.clone();
            let removed = self.store.remove_if(LOCKS, &id, |current: &Lock| {
                current.lease_id == lease_id && current.is_expired(Utc::now())
            })?;
            if removed {
                info!(resource_key = %lock.resource_key, holder = %lock.holder, "Swept expired lock");
                self.cache.remove_local(&id).await;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Unexpired leases, sorted by resource then holder
    pub async fn list(&self) -> CoordResult<Vec<Lock>> {
        let now = Utc::now();
        let mut locks: Vec<Lock> = self
            .cache
            .all()
            .await?
            .into_iter()
            .filter(|lock| !lock.is_expired(now))
            .collect();
        locks.sort_by(|a, b| {
            a.resource_key
                .cmp(&b.resource_key)
                .then_with(|| a.holder.cmp(&b.holder))
        });
        Ok(locks)
    }

    /// The unexpired write or exclusive lease on a resource, read from the store
    pub fn holder_of(&self, resource_key: &str) -> CoordResult<Option<Lock>> {
        let now = Utc::now();
        Ok(self
            .store
            .get::<Lock>(LOCKS, &slot_id(resource_key))?
            .filter(|lock| !lock.is_expired(now)))
    }

    /// Forget cached state after another process changed a lease
    pub async fn invalidate(&self, record_id: Option<&str>) {
        match record_id {
            Some(id) => self.cache.invalidate_id(id).await,
            None => self.cache.invalidate().await,
        }
    }

    async fn cached_blocker(&self, resource_key: &str, mode: LockMode, holder: &str) -> Option<Lock> {
        let now = Utc::now();
        match self.cache.all().await {
            Ok(locks) => locks
                .into_iter()
                .find(|lock| lock.resource_key == resource_key && lock.blocks(mode, holder, now)),
            Err(e) => {
                warn!(error = %e, "Lock cache unavailable, checking the store directly");
                None
            }
        }
    }
}

/// Claim a lease, clearing stale records for up to `attempts` rounds
fn claim(
    store: &RecordStore,
    resource_key: &str,
    mode: LockMode,
    holder: &str,
    ttl: Duration,
    operation: Option<String>,
    attempts: usize,
) -> CoordResult<Claim> {
    for attempt in 0..attempts {
        let settled = if mode.is_shared() {
            claim_read(store, resource_key, holder, ttl, operation.clone())?
        } else {
            claim_slot(store, resource_key, mode, holder, ttl, operation.clone())?
        };
        match settled {
            Some(claim) => return Ok(claim),
            None => debug!(%resource_key, attempt, "claim: retrying"),
        }
    }

    let now = Utc::now();
    match store
        .get::<Lock>(LOCKS, &slot_id(resource_key))?
        .filter(|lock| lock.resource_key == resource_key && lock.blocks(mode, holder, now))
    {
        Some(lock) => Ok(Claim::Blocked(lock)),
        None => {
            warn!(%resource_key, attempts, "Lock slot kept changing, giving up");
            Err(CoordError::LockContended {
                resource_key: resource_key.to_string(),
                attempts,
            })
        }
    }
}

/// Claim the write/exclusive slot, then back off if a reader is live
///
/// None means a stale or vanished record was cleared and the caller should retry.
fn claim_slot(
    store: &RecordStore,
    resource_key: &str,
    mode: LockMode,
    holder: &str,
    ttl: Duration,
    operation: Option<String>,
) -> CoordResult<Option<Claim>> {
    let id = slot_id(resource_key);
    let lock = Lock::new(resource_key, mode, holder, ttl, operation.clone());

    match store.create(LOCKS, &id, &lock) {
        Ok(()) => {
            if let Some(reader) = live_reader(store, resource_key, holder, Utc::now())? {
                let lease_id = lock.lease_id.clone();
                store.remove_if(LOCKS, &id, |current: &Lock| current.lease_id == lease_id)?;
                return Ok(Some(Claim::Blocked(reader)));
            }
            Ok(Some(Claim::Granted(lock)))
        }
        Err(e) if e.is_already_exists() => {
            let now = Utc::now();
            match store.get::<Lock>(LOCKS, &id)? {
                None => {
                    // Vanished between create and read, or unreadable
                    store.purge_corrupt::<Lock>(LOCKS, &id)?;
                    Ok(None)
                }
                Some(existing) if existing.is_expired(now) => {
                    let lease_id = existing.lease_id.clone();
                    store.remove_if(LOCKS, &id, |current: &Lock| current.lease_id == lease_id)?;
                    debug!(%resource_key, holder = %existing.holder, "claim_slot: cleared expired lease");
                    Ok(None)
                }
                Some(existing) if existing.holder == holder => {
                    let lease_id = existing.lease_id.clone();
                    let renewed = store.update_if(LOCKS, &id, |current: &Lock| {
                        (current.lease_id == lease_id).then(|| Lock {
                            mode,
                            operation: operation.clone().or_else(|| current.operation.clone()),
                            ..current.renewed(ttl)
                        })
                    })?;
                    Ok(renewed.map(Claim::Granted))
                }
                Some(existing) => Ok(Some(Claim::Blocked(existing))),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Announce a read lease, then back off if the slot is held
fn claim_read(
    store: &RecordStore,
    resource_key: &str,
    holder: &str,
    ttl: Duration,
    operation: Option<String>,
) -> CoordResult<Option<Claim>> {
    let id = reader_id(resource_key, holder);
    let now = Utc::now();
    let lock = match store.get::<Lock>(LOCKS, &id)? {
        Some(existing)
            if existing.resource_key == resource_key && existing.holder == holder && !existing.is_expired(now) =>
        {
            Lock {
                operation: operation.or_else(|| existing.operation.clone()),
                ..existing.renewed(ttl)
            }
        }
        _ => Lock::new(resource_key, LockMode::Read, holder, ttl, operation),
    };
    store.put(LOCKS, &id, &lock)?;

    if let Some(slot) = store.get::<Lock>(LOCKS, &slot_id(resource_key))?
        && slot.blocks(LockMode::Read, holder, Utc::now())
    {
        let lease_id = lock.lease_id.clone();
        store.remove_if(LOCKS, &id, |current: &Lock| current.lease_id == lease_id)?;
        return Ok(Some(Claim::Blocked(slot)));
    }
    Ok(Some(Claim::Granted(lock)))
}

fn live_reader(store: &RecordStore, resource_key: &str, holder: &str, now: DateTime<Utc>) -> CoordResult<Option<Lock>> {
    Ok(store
        .list::<Lock>(LOCKS)?
        .into_iter()
        .map(|(_, lock)| lock)
        .find(|lock| lock.resource_key == resource_key && lock.mode.is_shared() && lock.blocks(LockMode::Write, holder, now)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    const KEY: &str = "src/app.ts";

    fn setup() -> (TempDir, Arc<RecordStore>, LockManager) {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        let manager = LockManager::new(Arc::clone(&store), Duration::from_secs(60), Duration::from_secs(60));
        (temp, store, manager)
    }

    #[tokio::test]
    async fn test_write_conflict_reports_holder() {
        let (_temp, _store, manager) = setup();
        let granted = manager.acquire(KEY, LockMode::Write, "a", None, Some("edit")).await.unwrap();
        assert!(granted.is_granted());

        let denied = manager.acquire(KEY, LockMode::Write, "b", None, None).await.unwrap();
        let conflict = denied.conflict().unwrap();
        assert_eq!(conflict.holder, "a");
        assert_eq!(conflict.operation.as_deref(), Some("edit"));
    }

    #[tokio::test]
    async fn test_release_makes_lock_available() {
        let (_temp, _store, manager) = setup();
        manager.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap();
        assert!(manager.release(KEY, "a").await.unwrap());
        assert!(manager.acquire(KEY, LockMode::Write, "b", None, None).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let (_temp, _store, manager) = setup();
        manager.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap();
        assert!(!manager.release(KEY, "b").await.unwrap());
        assert!(!manager.release("other", "b").await.unwrap());
        assert_eq!(manager.holder_of(KEY).unwrap().unwrap().holder, "a");
    }

    #[tokio::test]
    async fn test_expired_lock_is_treated_as_absent() {
        let (_temp, store, manager) = setup();
        let stale = Lock::new(KEY, LockMode::Exclusive, "a", Duration::ZERO, None);
        store.put(LOCKS, &stale.record_id(), &stale).unwrap();

        let acquisition = manager.acquire(KEY, LockMode::Write, "b", None, None).await.unwrap();
        assert!(acquisition.is_granted());
        assert_eq!(manager.holder_of(KEY).unwrap().unwrap().holder, "b");
    }

    #[tokio::test]
    async fn test_reacquire_renews_same_lease() {
        let (_temp, _store, manager) = setup();
        let first = manager
            .acquire(KEY, LockMode::Write, "a", Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        let second = manager
            .acquire(KEY, LockMode::Write, "a", Some(Duration::from_secs(120)), None)
            .await
            .unwrap();
        let (first, second) = (first.lock().unwrap(), second.lock().unwrap());
        assert_eq!(first.lease_id, second.lease_id);
        assert!(second.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_readers_share_but_block_writers() {
        let (_temp, _store, manager) = setup();
        assert!(manager.acquire(KEY, LockMode::Read, "a", None, None).await.unwrap().is_granted());
        assert!(manager.acquire(KEY, LockMode::Read, "b", None, None).await.unwrap().is_granted());

        let denied = manager.acquire(KEY, LockMode::Write, "c", None, None).await.unwrap();
        assert!(!denied.is_granted());
        // The withdrawn write claim must not linger
        assert!(manager.holder_of(KEY).unwrap().is_none());

        manager.release(KEY, "a").await.unwrap();
        manager.release(KEY, "b").await.unwrap();
        assert!(manager.acquire(KEY, LockMode::Write, "c", None, None).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_writer_blocks_readers() {
        let (_temp, store, manager) = setup();
        manager.acquire(KEY, LockMode::Exclusive, "a", None, None).await.unwrap();

        let denied = manager.acquire(KEY, LockMode::Read, "b", None, None).await.unwrap();
        assert_eq!(denied.conflict().unwrap().holder, "a");
        assert!(!store.exists(LOCKS, &reader_id(KEY, "b")));
    }

    #[tokio::test]
    async fn test_holder_may_read_under_own_write() {
        let (_temp, _store, manager) = setup();
        manager.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap();
        assert!(manager.acquire(KEY, LockMode::Read, "a", None, None).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let (_temp, _store, manager) = setup();
        manager.acquire(KEY, LockMode::Write, "a", Some(Duration::from_secs(1)), None).await.unwrap();

        let renewed = manager.renew(KEY, "a", Some(Duration::from_secs(600))).await.unwrap();
        assert!(renewed.remaining(Utc::now()) > Duration::from_secs(500));

        let err = manager.renew(KEY, "b", None).await.unwrap_err();
        assert!(matches!(err, CoordError::LockNotOwned { .. }));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (_temp, store, manager) = setup();
        let stale = Lock::new("old", LockMode::Write, "a", Duration::ZERO, None);
        store.put(LOCKS, &stale.record_id(), &stale).unwrap();
        manager.acquire("fresh", LockMode::Write, "a", None, None).await.unwrap();

        assert_eq!(manager.sweep().await.unwrap(), 1);
        assert!(!store.exists(LOCKS, &slot_id("old")));
        assert!(store.exists(LOCKS, &slot_id("fresh")));
        assert_eq!(manager.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_lease_keeps_other_leases() {
        let (_temp, _store, manager) = setup();
        manager.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap();
        let read = manager.acquire(KEY, LockMode::Read, "a", None, None).await.unwrap();

        assert!(manager.release_lease(read.lock().unwrap()).await.unwrap());
        assert_eq!(manager.holder_of(KEY).unwrap().unwrap().holder, "a");
        assert!(!manager.release_lease(read.lock().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_all_only_touches_holder() {
        let (_temp, _store, manager) = setup();
        manager.acquire("one", LockMode::Write, "a", None, None).await.unwrap();
        manager.acquire("two", LockMode::Read, "a", None, None).await.unwrap();
        manager.acquire("three", LockMode::Write, "b", None, None).await.unwrap();

        assert_eq!(manager.release_all("a").await.unwrap(), 2);
        let remaining = manager.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].holder, "b");
    }

    #[tokio::test]
    async fn test_stale_cache_is_revalidated() {
        let (_temp, store, first) = setup();
        let second = LockManager::new(Arc::clone(&store), Duration::from_secs(60), Duration::from_secs(60));

        second.acquire(KEY, LockMode::Write, "b", None, None).await.unwrap();
        // Warm the first manager's cache with b's lease
        assert!(!first.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap().is_granted());

        // b releases through its own manager; a's cache still shows the lease
        second.release(KEY, "b").await.unwrap();
        assert!(first.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_list_hides_expired() {
        let (_temp, store, manager) = setup();
        let stale = Lock::new("old", LockMode::Write, "a", Duration::ZERO, None);
        store.put(LOCKS, &stale.record_id(), &stale).unwrap();
        manager.acquire("b-key", LockMode::Write, "a", None, None).await.unwrap();
        manager.acquire("a-key", LockMode::Write, "a", None, None).await.unwrap();

        let keys: Vec<String> = manager.list().await.unwrap().into_iter().map(|l| l.resource_key).collect();
        assert_eq!(keys, vec!["a-key", "b-key"]);
    }

    #[tokio::test]
    async fn test_keys_shaped_like_read_leases_are_independent() {
        let (_temp, store, manager) = setup();
        assert!(manager.acquire("notes", LockMode::Read, "b", None, None).await.unwrap().is_granted());

        for key in ["notes#read#b", reader_id("notes", "b").as_str()] {
            let acquisition = manager.acquire(key, LockMode::Write, "c", None, None).await.unwrap();
            assert!(acquisition.is_granted(), "{} should be free", key);
        }
        assert!(!manager.release(&reader_id("notes", "b"), "b").await.unwrap());
        assert!(store.exists(LOCKS, &reader_id("notes", "b")));
        assert!(!manager.acquire("notes", LockMode::Write, "c", None, None).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_corrupt_slot_is_purged_and_granted() {
        let (_temp, store, manager) = setup();
        std::fs::create_dir_all(store.category_dir(LOCKS)).unwrap();
        std::fs::write(store.record_path(LOCKS, &slot_id(KEY)), "{garbage").unwrap();

        let acquisition = manager.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap();
        assert!(acquisition.is_granted());
        assert_eq!(manager.holder_of(KEY).unwrap().unwrap().holder, "a");
    }

    #[tokio::test]
    async fn test_exhausted_claims_report_contention() {
        let (_temp, store, mut manager) = setup();
        manager.claim_attempts = 1;
        let stale = Lock::new(KEY, LockMode::Write, "a", Duration::ZERO, None);
        store.put(LOCKS, &stale.record_id(), &stale).unwrap();

        let err = manager.acquire(KEY, LockMode::Write, "b", None, None).await.unwrap_err();
        assert!(matches!(err, CoordError::LockContended { attempts: 1, .. }));
        // The stale lease was still cleared, so the next try wins
        assert!(manager.acquire(KEY, LockMode::Write, "b", None, None).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_unusable_store_fails_acquire() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("store");
        let store = Arc::new(RecordStore::open(&root).unwrap());
        let manager = LockManager::new(Arc::clone(&store), Duration::from_secs(60), Duration::from_secs(60));
        std::fs::remove_dir_all(store.root()).unwrap();
        std::fs::write(store.root(), "not a directory").unwrap();

        let err = manager.acquire(KEY, LockMode::Write, "a", None, None).await.unwrap_err();
        assert!(matches!(err, CoordError::StoreUnavailable(_)));
        assert!(manager.list().await.is_err());
    }
}
