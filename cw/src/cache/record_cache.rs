//! Category-scoped record cache

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use recordstore::RecordStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CoordResult;

/// Counters for cache observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from memory
    pub hits: u64,
    /// Whole-category reloads from the store
    pub refreshes: u64,
}

struct Snapshot<T> {
    records: HashMap<String, T>,
    fetched_at: Option<Instant>,
    /// Local writes whose store write has not landed yet, keyed by id with a write sequence
    unflushed: HashMap<String, (u64, T)>,
    next_seq: u64,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            fetched_at: None,
            unflushed: HashMap::new(),
            next_seq: 0,
        }
    }
}

/// In-memory mirror of one store category
pub struct RecordCache<T> {
    store: Arc<RecordStore>,
    category: &'static str,
    ttl: Duration,
    state: Arc<RwLock<Snapshot<T>>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    hits: AtomicU64,
    refreshes: AtomicU64,
}

impl<T> RecordCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: Arc<RecordStore>, category: &'static str, ttl: Duration) -> Self {
        debug!(%category, ?ttl, "RecordCache::new: called");
        Self {
            store,
            category,
            ttl,
            state: Arc::new(RwLock::new(Snapshot::default())),
            pending: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }

    /// True while the snapshot is younger than the TTL and not invalidated
    pub async fn is_fresh(&self) -> bool {
        let state = self.state.read().await;
        state.fetched_at.is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Read one record, refreshing the category first if stale
    pub async fn get(&self, id: &str) -> CoordResult<Option<T>> {
        self.ensure_fresh().await?;
        let state = self.state.read().await;
        Ok(state.records.get(id).cloned())
    }

    /// Read every record in the category, sorted by id
    pub async fn all(&self) -> CoordResult<Vec<T>> {
        self.ensure_fresh().await?;
        let state = self.state.read().await;
        let mut entries: Vec<(&String, &T)> = state.records.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        Ok(entries.into_iter().map(|(_, record)| record.clone()).collect())
    }

    /// Reload the whole category from the store
    pub async fn refresh(&self) -> CoordResult<()> {
        debug!(category = self.category, "RecordCache::refresh: called");
        let loaded = self.store.list::<T>(self.category)?;
        let mut state = self.state.write().await;
        let mut records: HashMap<String, T> = loaded.into_iter().collect();
        // Our own writes win over a store that has not seen them yet
        for (id, (_, record)) in &state.unflushed {
            records.insert(id.clone(), record.clone());
        }
        state.records = records;
        state.fetched_at = Some(Instant::now());
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Force the next read to go to the store
    pub async fn invalidate(&self) {
        debug!(category = self.category, "RecordCache::invalidate: called");
        self.state.write().await.fetched_at = None;
    }

    /// Drop one record and force the next read to go to the store
    pub async fn invalidate_id(&self, id: &str) {
        debug!(category = self.category, %id, "RecordCache::invalidate_id: called");
        let mut state = self.state.write().await;
        state.records.remove(id);
        state.fetched_at = None;
    }

    /// Record a value that is already in the store
    pub async fn insert_local(&self, id: &str, record: T) {
        self.state.write().await.records.insert(id.to_string(), record);
    }

    /// Forget a record that was already deleted from the store
    pub async fn remove_local(&self, id: &str) {
        let mut state = self.state.write().await;
        state.records.remove(id);
        state.unflushed.remove(id);
    }

    /// Write-through update: visible locally now, persisted in the background
    pub async fn update(&self, id: &str, record: T) {
        debug!(category = self.category, %id, "RecordCache::update: called");
        let seq = {
            let mut state = self.state.write().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.records.insert(id.to_string(), record.clone());
            state.unflushed.insert(id.to_string(), (seq, record.clone()));
            seq
        };

        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let category = self.category;
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            let write_id = id.clone();
            let result = tokio::task::spawn_blocking(move || store.put(category, &write_id, &record)).await;
            match result {
                Ok(Ok(())) => debug!(%category, %id, "RecordCache::update: persisted"),
                Ok(Err(e)) => warn!(%category, %id, error = %e, "Failed to persist cached record"),
                Err(e) => warn!(%category, %id, error = %e, "Cache persist task failed"),
            }
            let mut state = state.write().await;
            if state.unflushed.get(&id).is_some_and(|(s, _)| *s == seq) {
                state.unflushed.remove(&id);
            }
        });

        let mut pending = self.pending.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every background write issued so far
    pub async fn sync(&self) {
        let handles: Vec<JoinHandle<()>> = self.pending.lock().await.drain(..).collect();
        debug!(category = self.category, count = handles.len(), "RecordCache::sync: waiting");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(category = self.category, error = %e, "Cache persist task panicked");
            }
        }
    }

    async fn ensure_fresh(&self) -> CoordResult<()> {
        if self.is_fresh().await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        value: u32,
    }

    fn cache(store: &Arc<RecordStore>, ttl: Duration) -> RecordCache<Item> {
        RecordCache::new(Arc::clone(store), "items", ttl)
    }

    #[tokio::test]
    async fn test_reads_from_memory_within_ttl() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        store.put("items", "a", &Item { value: 1 }).unwrap();
        let cache = cache(&store, Duration::from_secs(60));

        assert_eq!(cache.get("a").await.unwrap(), Some(Item { value: 1 }));

        // An outside writer is not seen until the snapshot expires
        store.put("items", "a", &Item { value: 2 }).unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(Item { value: 1 }));
        assert_eq!(cache.stats().refreshes, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        store.put("items", "a", &Item { value: 1 }).unwrap();
        let cache = cache(&store, Duration::from_secs(60));
        cache.get("a").await.unwrap();

        store.put("items", "a", &Item { value: 2 }).unwrap();
        store.put("items", "b", &Item { value: 3 }).unwrap();
        cache.invalidate().await;

        assert_eq!(cache.get("a").await.unwrap(), Some(Item { value: 2 }));
        assert_eq!(cache.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_id_drops_record() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        store.put("items", "a", &Item { value: 1 }).unwrap();
        let cache = cache(&store, Duration::from_secs(60));
        cache.get("a").await.unwrap();

        store.delete("items", "a").unwrap();
        cache.invalidate_id("a").await;
        assert!(cache.get("a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_expires_after_ttl() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        store.put("items", "a", &Item { value: 1 }).unwrap();
        let cache = cache(&store, Duration::from_millis(500));
        cache.get("a").await.unwrap();
        assert!(cache.is_fresh().await);

        store.put("items", "a", &Item { value: 2 }).unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!cache.is_fresh().await);
        assert_eq!(cache.get("a").await.unwrap(), Some(Item { value: 2 }));
    }

    #[tokio::test]
    async fn test_update_is_read_your_own_writes() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        let cache = cache(&store, Duration::from_secs(60));

        cache.update("a", Item { value: 7 }).await;
        assert_eq!(cache.get("a").await.unwrap(), Some(Item { value: 7 }));

        // A refresh racing the background write still shows the local value
        cache.refresh().await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(Item { value: 7 }));

        cache.sync().await;
        assert_eq!(store.get::<Item>("items", "a").unwrap(), Some(Item { value: 7 }));
    }

    #[tokio::test]
    async fn test_remove_local() {
        let temp = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(temp.path()).unwrap());
        let cache = cache(&store, Duration::from_secs(60));
        cache.insert_local("a", Item { value: 1 }).await;
        cache.refresh().await.unwrap();
        // insert_local assumes the store already has it; the refresh disagreed
        assert!(cache.get("a").await.unwrap().is_none());

        store.put("items", "b", &Item { value: 2 }).unwrap();
        cache.refresh().await.unwrap();
        cache.remove_local("b").await;
        assert!(cache.get("b").await.unwrap().is_none());
    }
}
