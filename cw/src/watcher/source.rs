//! Pluggable change detection

use async_trait::async_trait;

use crate::domain::Category;

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Created or replaced
    Written,
    Removed,
}

/// One observed change to a store record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreChange {
    pub category: Category,
    /// Full store category, e.g. `messages/pending`
    pub store_category: String,
    pub id: String,
    pub kind: ChangeKind,
}

impl StoreChange {
    /// Build a change for a store category the coordinator knows about
    pub fn new(store_category: &str, id: impl Into<String>, kind: ChangeKind) -> Option<Self> {
        let category = Category::from_store_category(store_category)?;
        Some(Self {
            category,
            store_category: store_category.to_string(),
            id: id.into(),
            kind,
        })
    }
}

/// A stream of store changes
///
/// Implementations decide how changes are found; the watcher loop treats
/// them all the same.
#[async_trait]
pub trait ChangeSource: Send {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Wait for the next non-empty batch of changes; None when the source is exhausted
    async fn next_batch(&mut self) -> Option<Vec<StoreChange>>;
}
