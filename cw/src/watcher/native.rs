//! Native file-event change source

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use recordstore::RecordStore;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::source::{ChangeKind, ChangeSource, StoreChange};

/// Debounced recursive watch of the store root
pub struct NotifySource {
    rx: mpsc::Receiver<Vec<StoreChange>>,
    // Watching stops when the debouncer is dropped
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl NotifySource {
    /// Start watching the store; fails if the host has no usable event facility
    pub fn new(store: Arc<RecordStore>, debounce: Duration) -> notify::Result<Self> {
        debug!(root = %store.root().display(), ?debounce, "NotifySource::new: called");
        let (tx, rx) = mpsc::channel(100);
        let root = store.root().to_path_buf();

        let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| match res {
            Ok(events) => {
                let mut seen = HashSet::new();
                let changes: Vec<StoreChange> = events
                    .into_iter()
                    .filter_map(|event| {
                        let (category, id) = store.classify(&event.path)?;
                        let id = id?;
                        let kind = if event.path.exists() {
                            ChangeKind::Written
                        } else {
                            ChangeKind::Removed
                        };
                        StoreChange::new(&category, id, kind)
                    })
                    .filter(|change| seen.insert(change.clone()))
                    .collect();
                if !changes.is_empty() {
                    let _ = tx.blocking_send(changes);
                }
            }
            Err(e) => warn!(error = %e, "File watch error"),
        })?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            rx,
            _debouncer: debouncer,
        })
    }
}

#[async_trait]
impl ChangeSource for NotifySource {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn next_batch(&mut self) -> Option<Vec<StoreChange>> {
        self.rx.recv().await
    }
}
