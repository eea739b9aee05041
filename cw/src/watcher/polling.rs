//! Interval polling change source

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recordstore::{Fingerprint, RecordStore};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::source::{ChangeKind, ChangeSource, StoreChange};

/// Detects changes by diffing category fingerprints on an interval
pub struct PollingSource {
    store: Arc<RecordStore>,
    categories: Vec<&'static str>,
    last: HashMap<&'static str, Fingerprint>,
    interval: Interval,
}

impl PollingSource {
    /// Poll the given categories; the current state is the baseline
    pub fn new(store: Arc<RecordStore>, categories: Vec<&'static str>, every: Duration) -> Self {
        debug!(?categories, ?every, "PollingSource::new: called");
        let mut last = HashMap::new();
        for category in &categories {
            match store.fingerprint(category) {
                Ok(fingerprint) => {
                    last.insert(*category, fingerprint);
                }
                Err(e) => warn!(%category, error = %e, "Failed to fingerprint category"),
            }
        }
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            store,
            categories,
            last,
            interval,
        }
    }

    /// One diff pass over every category
    pub fn poll(&mut self) -> Vec<StoreChange> {
        let mut changes = Vec::new();
        for category in &self.categories {
            let current = match self.store.fingerprint(category) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    warn!(%category, error = %e, "Failed to fingerprint category");
                    continue;
                }
            };
            let previous = self.last.remove(category).unwrap_or_default();
            changes.extend(diff(category, &previous, &current));
            self.last.insert(*category, current);
        }
        changes
    }
}

fn diff(category: &str, previous: &Fingerprint, current: &Fingerprint) -> Vec<StoreChange> {
    let written = current
        .iter()
        .filter(|(id, stamp)| previous.get(*id) != Some(*stamp))
        .filter_map(|(id, _)| StoreChange::new(category, id.clone(), ChangeKind::Written));
    let removed = previous
        .keys()
        .filter(|id| !current.contains_key(*id))
        .filter_map(|id| StoreChange::new(category, id.clone(), ChangeKind::Removed));
    written.chain(removed).collect()
}

#[async_trait]
impl ChangeSource for PollingSource {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn next_batch(&mut self) -> Option<Vec<StoreChange>> {
        loop {
            self.interval.tick().await;
            let changes = self.poll();
            if !changes.is_empty() {
                return Some(changes);
            }
        }
    }
}
