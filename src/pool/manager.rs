//! In-process connection pool with drain-and-reset maintenance.
//!
//! Callers hold a [`PoolLease`] for the duration of a unit of work; dropping
//! it returns the connection. `reset` and `configure` are single-flight
//! across processes through the `pool:maintenance` lease.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::model::{ConfigureReport, PoolSnapshot, ResetReport};
use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::error::{DatabaseError, FleetError, Result};
use crate::lease::LeaseLock;
use crate::store::FleetStore;

/// Lease key guarding pool maintenance.
pub const MAINTENANCE_LEASE_KEY: &str = "pool:maintenance";

/// Window of snapshot history considered by `recommended_size`.
const RECOMMENDATION_WINDOW_HOURS: i64 = 24;

#[derive(Debug)]
struct PoolState {
    active: u32,
    idle: u32,
    max: u32,
    peak_active: u32,
    draining: bool,
    /// Bumped by every reset; leases from an older generation were force
    /// closed and are ignored when dropped.
    generation: u64,
    /// In-flight leases returned since the current drain began.
    drained: u32,
}

struct PoolInner {
    state: Mutex<PoolState>,
    returned: Notify,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PoolLease {
    inner: Arc<PoolInner>,
    generation: u64,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            if state.generation != self.generation {
                return;
            }
            state.active = state.active.saturating_sub(1);
            if state.draining {
                state.drained += 1;
            } else if state.active + state.idle < state.max {
                state.idle += 1;
            }
        }
        self.inner.returned.notify_waiters();
    }
}

pub struct PoolManager {
    inner: Arc<PoolInner>,
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    lock: LeaseLock,
}

impl PoolManager {
    pub fn new(store: Arc<dyn FleetStore>, clock: Arc<dyn Clock>, config: PoolConfig) -> Self {
        let lock = LeaseLock::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            MAINTENANCE_LEASE_KEY,
            config.lock_ttl,
        );
        let state = PoolState {
            active: 0,
            idle: 0,
            max: config.initial_size,
            peak_active: 0,
            draining: false,
            generation: 0,
            drained: 0,
        };
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(state),
                returned: Notify::new(),
            }),
            store,
            clock,
            config,
            lock,
        }
    }

    /// Check out a connection, waiting while the pool is exhausted or
    /// draining. Gives up after the drain timeout.
    pub async fn acquire(&self) -> Result<PoolLease> {
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let notified = self.inner.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if !state.draining && (state.idle > 0 || state.active + state.idle < state.max) {
                    state.idle = state.idle.saturating_sub(1);
                    state.active += 1;
                    state.peak_active = state.peak_active.max(state.active);
                    return Ok(PoolLease {
                        inner: Arc::clone(&self.inner),
                        generation: state.generation,
                    });
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                warn!(max = self.inner.lock().max, "Connection pool exhausted");
                return Err(DatabaseError::Pool("connection pool exhausted".into()).into());
            }
        }
    }

    /// Current counters, not persisted.
    pub fn sample(&self) -> PoolSnapshot {
        let state = self.inner.lock();
        PoolSnapshot {
            recorded_at: self.clock.now(),
            active: state.active,
            idle: state.idle,
            total: state.active + state.idle,
            max: state.max,
        }
    }

    /// Latest recorded snapshot, or a live sample before the first one.
    pub async fn stats(&self) -> Result<PoolSnapshot> {
        match self.store.latest_pool_snapshot().await? {
            Some(snapshot) => Ok(snapshot),
            None => Ok(self.sample()),
        }
    }

    /// Snapshots from the last `hours`, oldest first.
    pub async fn history(&self, hours: u32) -> Result<Vec<PoolSnapshot>> {
        if !(1..=168).contains(&hours) {
            return Err(FleetError::validation("hours must be between 1 and 168"));
        }
        let since = self.clock.now() - chrono::Duration::hours(i64::from(hours));
        Ok(self.store.list_pool_snapshots(since).await?)
    }

    pub async fn record_snapshot(&self) -> Result<PoolSnapshot> {
        let snapshot = self.sample();
        self.store.insert_pool_snapshot(&snapshot).await?;
        debug!(
            active = snapshot.active,
            idle = snapshot.idle,
            max = snapshot.max,
            "Pool snapshot recorded"
        );
        Ok(snapshot)
    }

    /// Drain in-flight leases (bounded by the drain timeout), close
    /// everything, and start a fresh generation.
    pub async fn reset(&self) -> Result<ResetReport> {
        let Some(guard) = self.lock.try_acquire().await? else {
            return Err(FleetError::contention("connection pool maintenance"));
        };
        let result = self.drain_and_reset().await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release pool maintenance lease");
        }
        result
    }

    async fn drain_and_reset(&self) -> Result<ResetReport> {
        let started = Instant::now();
        let (idle_closed, in_flight) = {
            let mut state = self.inner.lock();
            if state.draining {
                return Err(FleetError::contention("connection pool maintenance"));
            }
            state.draining = true;
            state.drained = 0;
            let idle = std::mem::take(&mut state.idle);
            (idle, state.active)
        };
        info!(in_flight, idle_closed, "Pool reset started");

        let deadline = started + self.config.drain_timeout;
        loop {
            let notified = self.inner.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lock().active == 0 {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let (drained, forced) = {
            let mut state = self.inner.lock();
            let drained = std::mem::take(&mut state.drained);
            let forced = std::mem::take(&mut state.active);
            state.generation += 1;
            state.draining = false;
            (drained, forced)
        };
        self.inner.returned.notify_waiters();

        let report = ResetReport {
            closed_gracefully: idle_closed + drained,
            force_closed: forced,
            in_flight_at_start: in_flight,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        if forced > 0 {
            warn!(
                forced,
                graceful = report.closed_gracefully,
                "Pool reset force-closed connections after drain timeout"
            );
        } else {
            info!(graceful = report.closed_gracefully, elapsed_ms = report.elapsed_ms, "Pool reset complete");
        }

        self.record_snapshot().await?;
        Ok(report)
    }

    /// Resize the pool to `target_size`, trimming idle connections above it.
    pub async fn configure(&self, target_size: u32) -> Result<ConfigureReport> {
        if !(self.config.min_size..=self.config.max_size).contains(&target_size) {
            return Err(FleetError::validation(format!(
                "target_size must be between {} and {}",
                self.config.min_size, self.config.max_size
            )));
        }
        let Some(guard) = self.lock.try_acquire().await? else {
            return Err(FleetError::contention("connection pool maintenance"));
        };

        let resized = {
            let mut state = self.inner.lock();
            if state.draining {
                None
            } else {
                let previous_max = state.max;
                state.max = target_size;
                let excess = (state.active + state.idle).saturating_sub(target_size);
                let idle_trimmed = excess.min(state.idle);
                state.idle -= idle_trimmed;
                Some(ConfigureReport {
                    previous_max,
                    new_max: target_size,
                    idle_trimmed,
                    peak_active: state.peak_active,
                })
            }
        };
        let Some(report) = resized else {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "Failed to release pool maintenance lease");
            }
            return Err(FleetError::contention("connection pool maintenance"));
        };
        self.inner.returned.notify_waiters();
        info!(
            previous_max = report.previous_max,
            new_max = report.new_max,
            idle_trimmed = report.idle_trimmed,
            "Pool resized"
        );

        let result = self.record_snapshot().await.map(|_| report);
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release pool maintenance lease");
        }
        result
    }

    /// `ceil(peak × headroom)` over recent history and the live peak,
    /// clamped to the configured bounds.
    pub async fn recommended_size(&self) -> Result<u32> {
        let since = self.clock.now() - chrono::Duration::hours(RECOMMENDATION_WINDOW_HOURS);
        let history_peak = self
            .store
            .list_pool_snapshots(since)
            .await?
            .iter()
            .map(|s| s.active)
            .max()
            .unwrap_or(0);
        let peak = history_peak.max(self.inner.lock().peak_active);
        // Float-to-int casts saturate.
        let wanted = (f64::from(peak) * self.config.headroom).ceil() as u32;
        Ok(wanted.max(self.config.min_size).min(self.config.max_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clock::SystemClock;
    use crate::store::LibSqlBackend;

    async fn manager(config: PoolConfig) -> PoolManager {
        let store: Arc<dyn FleetStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        PoolManager::new(store, Arc::new(SystemClock), config)
    }

    async fn wait_until_draining(pool: &PoolManager) {
        for _ in 0..200 {
            if pool.inner.lock().draining {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("reset never started draining");
    }

    fn config(initial: u32, drain_timeout: Duration) -> PoolConfig {
        PoolConfig {
            initial_size: initial,
            min_size: 2,
            max_size: 50,
            drain_timeout,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn leases_return_to_idle() {
        let pool = manager(config(5, Duration::from_secs(1))).await;
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.sample().active, 2);

        drop(a);
        drop(b);
        let snap = pool.sample();
        assert_eq!((snap.active, snap.idle, snap.total), (0, 2, 2));

        let _c = pool.acquire().await.unwrap();
        let snap = pool.sample();
        assert_eq!((snap.active, snap.idle), (1, 1));
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = manager(config(2, Duration::from_millis(50))).await;
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, FleetError::Dependency(_)));
    }

    #[tokio::test]
    async fn waiting_acquire_gets_returned_connection() {
        let pool = Arc::new(manager(config(2, Duration::from_secs(2))).await);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(a);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn reset_drains_in_flight_leases() {
        let pool = manager(config(10, Duration::from_secs(5))).await;
        let leases = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(leases);
        });

        let report = pool.reset().await.unwrap();
        assert_eq!(report.in_flight_at_start, 3);
        assert_eq!(report.closed_gracefully, 3);
        assert_eq!(report.force_closed, 0);
        assert!(report.elapsed_ms < 2_000);

        let snap = pool.sample();
        assert_eq!((snap.active, snap.idle), (0, 0));
    }

    #[tokio::test]
    async fn reset_counts_idle_as_graceful() {
        let pool = manager(config(10, Duration::from_secs(1))).await;
        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.sample().idle, 1);

        let report = pool.reset().await.unwrap();
        assert_eq!(report.closed_gracefully, 1);
        assert_eq!(report.in_flight_at_start, 0);
    }

    #[tokio::test]
    async fn reset_force_closes_after_timeout() {
        let pool = manager(config(10, Duration::from_millis(50))).await;
        let stuck = pool.acquire().await.unwrap();

        let report = pool.reset().await.unwrap();
        assert_eq!(report.force_closed, 1);
        assert_eq!(report.closed_gracefully, 0);

        // The force-closed lease comes back late and is ignored.
        drop(stuck);
        let snap = pool.sample();
        assert_eq!((snap.active, snap.idle), (0, 0));
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn configure_validates_bounds_and_trims_idle() {
        let pool = manager(config(10, Duration::from_secs(1))).await;
        assert!(matches!(
            pool.configure(1).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            pool.configure(51).await,
            Err(FleetError::Validation(_))
        ));

        let leases: Vec<_> = {
            let mut v = Vec::new();
            for _ in 0..5 {
                v.push(pool.acquire().await.unwrap());
            }
            v
        };
        drop(leases);
        assert_eq!(pool.sample().idle, 5);

        let report = pool.configure(3).await.unwrap();
        assert_eq!(report.previous_max, 10);
        assert_eq!(report.new_max, 3);
        assert_eq!(report.idle_trimmed, 2);
        assert_eq!(report.peak_active, 5);
        assert_eq!(pool.stats().await.unwrap().max, 3);
    }

    #[tokio::test]
    async fn recommended_size_applies_headroom() {
        let pool = manager(config(20, Duration::from_secs(1))).await;
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.acquire().await.unwrap());
        }
        pool.record_snapshot().await.unwrap();
        drop(held);

        // 8 × 1.25 = 10
        assert_eq!(pool.recommended_size().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn recommended_size_respects_min() {
        let pool = manager(config(20, Duration::from_secs(1))).await;
        assert_eq!(pool.recommended_size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn history_hours_are_bounded() {
        let pool = manager(config(20, Duration::from_secs(1))).await;
        pool.record_snapshot().await.unwrap();
        assert!(pool.history(0).await.is_err());
        assert!(pool.history(169).await.is_err());
        assert_eq!(pool.history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn maintenance_during_reset_is_contention() {
        let pool = Arc::new(manager(config(10, Duration::from_secs(5))).await);
        let stuck = pool.acquire().await.unwrap();

        let running = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.reset().await })
        };
        wait_until_draining(&pool).await;

        let err = pool.reset().await.unwrap_err();
        assert!(err.is_contention());
        let err = pool.configure(5).await.unwrap_err();
        assert!(err.is_contention());
        assert_eq!(pool.sample().max, 10);

        drop(stuck);
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.closed_gracefully, 1);
        assert_eq!(report.force_closed, 0);

        // Maintenance is available again once the reset finishes.
        assert_eq!(pool.configure(5).await.unwrap().new_max, 5);
    }

    #[tokio::test]
    async fn configure_refuses_while_draining_even_with_lease() {
        let pool = manager(config(10, Duration::from_secs(1))).await;
        pool.inner.lock().draining = true;

        let err = pool.configure(5).await.unwrap_err();
        assert!(err.is_contention());
        assert_eq!(pool.sample().max, 10);

        // The lease taken for the refused attempt was handed back.
        pool.inner.lock().draining = false;
        assert_eq!(pool.configure(5).await.unwrap().new_max, 5);
    }

    #[tokio::test]
    async fn lease_held_elsewhere_blocks_maintenance() {
        let store: Arc<dyn FleetStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = PoolManager::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            config(10, Duration::from_secs(1)),
        );
        let other = LeaseLock::new(
            store,
            Arc::new(SystemClock),
            MAINTENANCE_LEASE_KEY,
            Duration::from_secs(60),
        );
        let held = other.try_acquire().await.unwrap().unwrap();

        assert!(pool.reset().await.unwrap_err().is_contention());
        assert!(pool.configure(5).await.unwrap_err().is_contention());

        held.release().await.unwrap();
        assert!(pool.reset().await.is_ok());
    }
}
