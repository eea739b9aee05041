//! Scoped lock ownership

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::Lock;
use crate::error::CoordResult;
use crate::lock::LockManager;

/// A held lease, released when the guard goes away
///
/// Prefer [`LockGuard::release`]; dropping the guard inside a tokio runtime
/// spawns the release instead, so an early return or a cancelled task does
/// not leave the lease behind until it expires.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    locks: Arc<LockManager>,
    lock: Lock,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(locks: Arc<LockManager>, lock: Lock) -> Self {
        debug!(resource_key = %lock.resource_key, lease_id = %lock.lease_id, "LockGuard::new: called");
        Self {
            locks,
            lock,
            released: false,
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn resource_key(&self) -> &str {
        &self.lock.resource_key
    }

    /// Push the expiry out for long operations
    pub async fn renew(&mut self, ttl: Option<Duration>) -> CoordResult<()> {
        self.lock = self.locks.renew(&self.lock.resource_key, &self.lock.holder, ttl).await?;
        Ok(())
    }

    /// Release now and report whether the lease was still ours
    pub async fn release(mut self) -> CoordResult<bool> {
        self.released = true;
        self.locks.release_lease(&self.lock).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let locks = Arc::clone(&self.locks);
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(resource_key = %lock.resource_key, "LockGuard::drop: releasing in background");
                handle.spawn(async move {
                    if let Err(e) = locks.release_lease(&lock).await {
                        warn!(resource_key = %lock.resource_key, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => warn!(
                resource_key = %lock.resource_key,
                "Lock guard dropped outside a runtime; lease will expire on its own"
            ),
        }
    }
}
