//! Key-scoped, TTL-bound exclusive lease stored in the database.
//!
//! Every holder gets a fresh id; a lease whose deadline has passed can be
//! taken over by anyone, so a crashed holder never blocks the key for longer
//! than the TTL.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::store::FleetStore;

/// Single-flight lock for one key.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    key: String,
    ttl: Duration,
}

impl LeaseLock {
    pub fn new(
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key: key.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take the lease without waiting. `None` means another holder
    /// has it.
    pub async fn try_acquire(&self) -> Result<Option<LeaseGuard>, DatabaseError> {
        let holder = Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let acquired = self
            .store
            .try_acquire_lease(&self.key, &holder, self.clock.now_ms(), ttl_ms)
            .await?;

        if !acquired {
            debug!(key = %self.key, "Lease held elsewhere");
            return Ok(None);
        }

        debug!(key = %self.key, holder = %holder, "Lease acquired");
        Ok(Some(LeaseGuard {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            holder,
            released: false,
        }))
    }
}

/// A held lease. Call [`LeaseGuard::release`] when done; dropping it
/// releases in the background.
pub struct LeaseGuard {
    store: Arc<dyn FleetStore>,
    key: String,
    holder: String,
    released: bool,
}

impl LeaseGuard {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn release(mut self) -> Result<(), DatabaseError> {
        self.released = true;
        if !self.store.release_lease(&self.key, &self.holder).await? {
            warn!(key = %self.key, holder = %self.holder, "Lease expired before release");
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release_lease(&key, &holder).await {
                        warn!(key = %key, error = %e, "Background lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "Lease dropped outside a runtime; it will expire by TTL");
            }
        }
    }
}
