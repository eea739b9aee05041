//! TTL-bounded in-memory mirror of store categories
//!
//! Each category is refreshed as a whole once its snapshot is older than the
//! TTL or has been invalidated. Local writes are visible immediately; other
//! processes' writes become visible on the next refresh.

mod record_cache;

pub use record_cache::{CacheStats, RecordCache};

use crate::error::CoordResult;

/// Run synchronous store I/O on the blocking pool instead of a runtime worker
pub(crate) async fn blocking<T, F>(f: F) -> CoordResult<T>
where
    F: FnOnce() -> CoordResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
