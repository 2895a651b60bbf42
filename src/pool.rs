//! [`PooledDataSource`] — the public façade: creation, borrow/return,
//! shutdown, metrics, status.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bag::{BagEntry, ConcurrentBag};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::{PoolConfig, PoolConfigValidator};
use crate::connection::{LifecycleState, PooledConnection};
use crate::driver::ConnectionManager;
use crate::error::PoolError;
use crate::housekeeper;
use crate::metrics::{InMemoryTracker, NoopTracker, PoolMetrics, PoolMetricsTracker};
use crate::proxy::{ConnectionProxy, PoolEntry, ReleaseFn};
use crate::sizer;

/// A consistent snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatus {
    pub total: u32,
    pub active: u32,
    pub idle: u32,
    pub waiting: u32,
}

/// The pool's shared, reference-counted internals. Cloned cheaply (an
/// `Arc`) by background tasks and every outstanding [`ConnectionProxy`]'s
/// release callback.
pub(crate) struct SharedPool<M: ConnectionManager> {
    pub(crate) config: PoolConfig,
    pub(crate) manager: Arc<M>,
    pub(crate) bag: ConcurrentBag<Arc<PooledConnection<M::Connection>>>,
    pub(crate) idle_ids: Mutex<HashSet<u64>>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) metrics: Arc<dyn PoolMetricsTracker>,
    pub(crate) closed: AtomicBool,
    pub(crate) shutdown: Notify,
    /// Connections reserved for creation but not yet pushed into `bag`.
    /// Counted alongside `total()` by [`SharedPool::try_reserve_growth_slot`]
    /// so concurrent growers (a caller's on-demand grow, the house-keeper's
    /// refill, the adaptive sizer) can't collectively push `total` past
    /// `maxConnections` — mirrors `bb8`'s `pending_conns`, reserved under its
    /// internals lock before a connect future is spawned
    /// (`examples/ian-p-cooke-bb8/bb8/src/lib.rs:458-471`).
    pub(crate) pending: AtomicU32,
}

impl<M: ConnectionManager> SharedPool<M> {
    pub(crate) fn total(&self) -> u32 {
        self.bag.len() as u32
    }

    pub(crate) fn idle(&self) -> u32 {
        self.idle_ids.lock().len() as u32
    }

    pub(crate) fn waiting(&self) -> u32 {
        self.bag.waiting_count() as u32
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let total = self.total();
        let idle = self.idle();
        PoolStatus {
            total,
            active: total.saturating_sub(idle),
            idle,
            waiting: self.waiting(),
        }
    }

    /// Reserve a growth slot if `total() + pending < cap`, atomically with
    /// respect to every other caller of this method. Must be paired with
    /// [`SharedPool::release_growth_slot`] once the attempted creation
    /// finishes, whether or not it succeeded.
    pub(crate) fn try_reserve_growth_slot(&self, cap: u32) -> bool {
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            if self.total() + pending >= cap {
                return false;
            }
            if self
                .pending
                .compare_exchange(pending, pending + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn release_growth_slot(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Create a single new connection through the circuit breaker,
    /// recording creation time. Does not touch the bag or `idle_ids`.
    pub(crate) async fn create_connection(&self) -> Result<Arc<PooledConnection<M::Connection>>, PoolError> {
        let manager = self.manager.clone();
        let config = self.config.clone();
        let start = Instant::now();
        let conn = self
            .breaker
            .call(move || {
                let manager = manager.clone();
                let config = config.clone();
                async move { manager.connect(&config).await }
            })
            .await?;
        self.metrics.record_creation(start.elapsed());
        Ok(Arc::new(PooledConnection::new(conn)))
    }

    /// Release a previously borrowed entry: mark it idle, record usage,
    /// re-add it to `idle_ids`, and requite it to the bag (direct handoff
    /// if a waiter is present). De-duplicates naturally via the bag's CAS:
    /// a connection already removed or already idle produces a no-op.
    pub(crate) fn release_connection(&self, entry: PoolEntry<M::Connection>) -> Result<(), PoolError> {
        let conn = entry.item.clone();
        conn.disarm_leak_timer();

        if conn.compare_and_set_state(LifecycleState::InUse, LifecycleState::Idle) {
            conn.touch_used();
            self.idle_ids.lock().insert(conn.id);
            self.metrics.record_release();
            if let Some(usage) = conn.take_checkout_duration() {
                self.metrics.record_usage(usage);
            }
        }
        self.bag.requite(entry);
        Ok(())
    }

    /// Permanently remove `entry`: mark it `Reserved` as the exclusive
    /// eviction gate, detach it from the bag, and destroy the driver
    /// connection. No-op if another path already claimed it.
    pub(crate) async fn evict(&self, entry: &PoolEntry<M::Connection>) {
        let conn = entry.item.clone();
        if !conn.compare_and_set_state(LifecycleState::Idle, LifecycleState::Reserved)
            && !conn.compare_and_set_state(LifecycleState::InUse, LifecycleState::Reserved)
        {
            return;
        }
        self.idle_ids.lock().remove(&conn.id);
        self.bag.remove(entry);
        conn.set_state(LifecycleState::Removed);
        conn.destroy().await;
        self.metrics.record_removal();
    }
}

/// Builder-style configuration for the metrics tracker a
/// [`PooledDataSource`] should use.
#[derive(Clone, Copy, Debug, Default)]
pub enum MetricsMode {
    #[default]
    Disabled,
    InMemory,
}

/// The pool's public façade.
pub struct PooledDataSource<M: ConnectionManager> {
    inner: Arc<SharedPool<M>>,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
    sizer: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ConnectionManager> PooledDataSource<M> {
    /// Construct a pool from `config` and `manager`, validating the config
    /// fail-fast and warming up to `minConnections`.
    pub async fn from_config(
        config: PoolConfig,
        manager: M,
        metrics_mode: MetricsMode,
    ) -> Result<Self, PoolError> {
        PoolConfigValidator::validate(&config)?;

        let metrics: Arc<dyn PoolMetricsTracker> = match metrics_mode {
            MetricsMode::Disabled => Arc::new(NoopTracker),
            MetricsMode::InMemory => Arc::new(InMemoryTracker::new()),
        };

        let breaker = CircuitBreaker::new(BreakerConfig::default());

        let inner = Arc::new(SharedPool {
            manager: Arc::new(manager),
            bag: ConcurrentBag::new(),
            idle_ids: Mutex::new(HashSet::new()),
            breaker,
            metrics,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            pending: AtomicU32::new(0),
            config,
        });

        for _ in 0..inner.config.min_connections {
            match inner.create_connection().await {
                Ok(conn) => {
                    conn.set_state(LifecycleState::Idle);
                    inner.idle_ids.lock().insert(conn.id);
                    inner.bag.add(conn);
                }
                Err(err) => {
                    warn!(error = %err, "failed to warm up a pool connection");
                }
            }
        }

        let housekeeper = {
            let pool = inner.clone();
            tokio::spawn(housekeeper::run(pool))
        };

        let sizer = if inner.config.adaptive_sizing {
            let pool = inner.clone();
            Some(tokio::spawn(sizer::run(pool)))
        } else {
            None
        };

        info!(
            total = inner.total(),
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "pool initialized"
        );

        Ok(Self {
            inner,
            housekeeper: Mutex::new(Some(housekeeper)),
            sizer: Mutex::new(sizer),
        })
    }

    /// Borrow a connection, timing out at `connectionTimeout`.
    pub async fn get_connection(&self) -> Result<ConnectionProxy<M::Connection>, PoolError> {
        let start = Instant::now();

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let deadline = start + self.inner.config.connection_timeout;

        // Non-blocking attempt: an idle entry may already be available.
        if let Some(entry) = self.inner.bag.borrow(std::time::Duration::ZERO).await {
            return Ok(self.finish_acquire(entry, start));
        }

        // Grow, if there is headroom, guarded by the circuit breaker. The
        // reservation below closes the race where two concurrent callers
        // both observe spare headroom and both create a connection,
        // pushing `status.total` past `maxConnections`.
        if self
            .inner
            .try_reserve_growth_slot(self.inner.config.max_connections)
        {
            let result = self.inner.create_connection().await;
            self.inner.release_growth_slot();
            match result {
                Ok(conn) => {
                    conn.set_state(LifecycleState::InUse);
                    let entry = self.inner.bag.add_in_use(conn);
                    return Ok(self.finish_acquire(entry, start));
                }
                Err(PoolError::BreakerOpen) => {
                    debug!("breaker open on acquire, falling back to waiting for a handoff");
                }
                Err(err) => return Err(err),
            }
        }

        // Suspend for a direct handoff, up to the remaining budget.
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.inner.bag.borrow(remaining).await {
            Some(entry) => Ok(self.finish_acquire(entry, start)),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    return Err(PoolError::Closed);
                }
                self.inner.metrics.record_timeout();
                Err(PoolError::AcquisitionTimeout(self.inner.config.connection_timeout))
            }
        }
    }

    fn finish_acquire(
        &self,
        entry: Arc<BagEntry<Arc<PooledConnection<M::Connection>>>>,
        start: Instant,
    ) -> ConnectionProxy<M::Connection> {
        let conn = entry.item.clone();
        if conn.compare_and_set_state(LifecycleState::Idle, LifecycleState::InUse) {
            self.inner.idle_ids.lock().remove(&conn.id);
        }
        conn.touch_used();
        conn.mark_checked_out();

        if let Some(threshold) = self.inner.config.leak_detection_threshold {
            let pool = self.inner.clone();
            let id = conn.id;
            conn.arm_leak_timer(threshold, move || {
                pool.metrics.record_leak();
                warn!(connection_id = id, "possible connection leak detected");
            });
        }

        self.inner.metrics.record_acquisition(start.elapsed());

        let pool = self.inner.clone();
        let release: ReleaseFn<M::Connection> =
            Arc::new(move |entry| pool.release_connection(entry));
        ConnectionProxy::new(entry, release)
    }

    /// Run `f` with auto-commit off, committing on `Ok` and rolling back on
    /// `Err`. The connection is always returned to the pool, regardless of
    /// outcome.
    pub async fn transaction<F, Fut, T, E>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(ConnectionProxy<M::Connection>) -> Fut,
        Fut: std::future::Future<Output = Result<(T, ConnectionProxy<M::Connection>), (E, ConnectionProxy<M::Connection>)>>,
        E: Into<PoolError>,
    {
        let conn = self.get_connection().await?;
        conn.set_auto_commit(false).await.map_err(PoolError::Driver)?;

        match f(conn).await {
            Ok((value, conn)) => {
                conn.commit().await.map_err(PoolError::Driver)?;
                Ok(value)
            }
            Err((err, conn)) => {
                let _ = conn.rollback().await;
                Err(err.into())
            }
        }
    }

    /// A consistent snapshot of pool occupancy.
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// A snapshot of accumulated metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics.snapshot()
    }

    /// Shut the pool down: stop background tasks, reject future borrows,
    /// wake all waiters, and destroy every tracked connection.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return; // already closed
        }

        self.inner.shutdown.notify_waiters();
        if let Some(handle) = self.housekeeper.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.sizer.lock().take() {
            handle.abort();
        }

        self.inner.bag.close();

        for entry in self.inner.bag.drain() {
            entry.item.set_state(LifecycleState::Removed);
            entry.item.destroy().await;
            self.inner.metrics.record_removal();
        }
        self.inner.idle_ids.lock().clear();

        info!("pool shut down");
    }
}

impl<M: ConnectionManager> Drop for PooledDataSource<M> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(handle) = self.housekeeper.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.sizer.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeConnectionManager;
    use std::time::Duration;

    fn base_config() -> PoolConfig {
        PoolConfig {
            min_connections: 2,
            max_connections: 5,
            connection_timeout: Duration::from_millis(500),
            maintenance_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn warms_up_to_min_connections() {
        let pool = PooledDataSource::from_config(base_config(), FakeConnectionManager::default(), MetricsMode::Disabled)
            .await
            .unwrap();
        let status = pool.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.active, 0);
        assert_eq!(status.idle, 2);
        assert_eq!(status.waiting, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_beyond_max_times_out() {
        let cfg = PoolConfig {
            min_connections: 1,
            max_connections: 2,
            connection_timeout: Duration::from_millis(300),
            maintenance_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let pool = PooledDataSource::from_config(cfg, FakeConnectionManager::default(), MetricsMode::Disabled)
            .await
            .unwrap();

        let c1 = pool.get_connection().await.unwrap();
        let c2 = pool.get_connection().await.unwrap();

        let start = Instant::now();
        let result = pool.get_connection().await;
        assert!(matches!(result, Err(PoolError::AcquisitionTimeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(300));

        drop(c1);
        drop(c2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_then_shutdown_is_a_no_op() {
        let pool = PooledDataSource::from_config(base_config(), FakeConnectionManager::default(), MetricsMode::Disabled)
            .await
            .unwrap();
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(matches!(pool.get_connection().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn release_records_usage_time() {
        let pool = PooledDataSource::from_config(base_config(), FakeConnectionManager::default(), MetricsMode::InMemory)
            .await
            .unwrap();
        let conn = pool.get_connection().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(conn);
        tokio::task::yield_now().await;

        let metrics = pool.metrics();
        assert!(metrics.avg_usage_time >= Duration::from_millis(15));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn release_then_reacquire_restores_status() {
        let pool = PooledDataSource::from_config(base_config(), FakeConnectionManager::default(), MetricsMode::Disabled)
            .await
            .unwrap();
        let before = pool.status();
        let conn = pool.get_connection().await.unwrap();
        drop(conn);
        // Let the async drop's release land.
        tokio::task::yield_now().await;
        let after = pool.status();
        assert_eq!(before.idle, after.idle);
        pool.shutdown().await;
    }
}
