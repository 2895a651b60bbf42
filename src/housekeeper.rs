//! The house-keeper: a background task that evicts expired/idle
//! connections, validates survivors with a keepalive ping, and refills the
//! pool back up to `minConnections`.
//!
//! Shaped after `bb8`'s reaper task (`Pool::schedule_reaping` /
//! `drop_connections`), generalized from "drop everything past its
//! lifetime" to the fuller HikariCP-style sweep the spec calls for.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::LifecycleState;
use crate::driver::ConnectionManager;
use crate::pool::SharedPool;

/// Run the house-keeping loop until the pool is closed. Intended to be
/// `tokio::spawn`ed once per [`crate::pool::PooledDataSource`].
pub(crate) async fn run<M: ConnectionManager>(pool: Arc<SharedPool<M>>) {
    let mut interval = tokio::time::interval(pool.config.maintenance_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep(&pool).await;
            }
            _ = pool.shutdown.notified() => {
                debug!("house-keeper observed shutdown, exiting");
                return;
            }
        }

        if pool.closed.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
    }
}

async fn sweep<M: ConnectionManager>(pool: &Arc<SharedPool<M>>) {
    evict_expired(pool).await;
    validate_idle(pool).await;
    refill(pool).await;

    pool.metrics.set_gauge("pool.total", pool.total() as i64);
    pool.metrics.set_gauge("pool.idle", pool.idle() as i64);
    pool.metrics.set_gauge("pool.waiting", pool.waiting() as i64);
}

/// Evict idle connections whose `maxLifetime` or `idleTimeout` has been
/// exceeded. Claims each candidate with the `Idle -> Reserved` CAS gate
/// before destroying it, so an entry concurrently borrowed by a caller is
/// left alone.
async fn evict_expired<M: ConnectionManager>(pool: &Arc<SharedPool<M>>) {
    let idle_timeout = pool.config.idle_timeout;
    let max_lifetime = pool.config.max_lifetime;
    let min_connections = pool.config.min_connections;

    for entry in pool.bag.snapshot() {
        let conn = &entry.item;
        if conn.state() != LifecycleState::Idle {
            continue;
        }

        // maxLifetime eviction is unconditional; idleTimeout eviction only
        // applies while the pool has more than minConnections (re-checked
        // per candidate, since each eviction in this loop lowers `total()`).
        let expired_by_lifetime = conn.age() >= max_lifetime;
        let expired_by_idle = !idle_timeout.is_zero()
            && conn.idle_for() >= idle_timeout
            && pool.total() > min_connections;
        if !expired_by_lifetime && !expired_by_idle {
            continue;
        }

        debug!(
            connection_id = conn.id,
            age_secs = conn.age().as_secs(),
            idle_secs = conn.idle_for().as_secs(),
            "evicting expired connection"
        );
        pool.evict(&entry).await;
    }
}

/// Ping every idle connection whose last validation is older than
/// `keepaliveTime`, bounded by `validationTimeout`. A connection that fails
/// validation is evicted the same way an expired one is.
async fn validate_idle<M: ConnectionManager>(pool: &Arc<SharedPool<M>>) {
    let keepalive = pool.config.keepalive_time;
    let validation_timeout = pool.config.validation_timeout;

    for entry in pool.bag.snapshot() {
        let conn = &entry.item;
        if conn.state() != LifecycleState::Idle {
            continue;
        }
        if conn.last_validated().elapsed() < keepalive {
            continue;
        }

        let validation = conn.validate_with(pool.manager.as_ref(), validation_timeout);
        match tokio::time::timeout(validation_timeout, validation).await {
            Ok(Ok(())) => conn.touch_validated(),
            Ok(Err(err)) => {
                warn!(connection_id = conn.id, error = %err, "keepalive validation failed, evicting");
                pool.evict(&entry).await;
            }
            Err(_) => {
                warn!(connection_id = conn.id, "keepalive validation timed out, evicting");
                pool.evict(&entry).await;
            }
        }
    }
}

/// Top up the pool back to `minConnections`. Failures are logged and
/// swallowed — a refill failure is never surfaced to a caller of
/// `getConnection`. Connectivity failures still count against the circuit
/// breaker via [`SharedPool::create_connection`]; non-connectivity errors do
/// not stop the refill attempt for the remaining shortfall.
async fn refill<M: ConnectionManager>(pool: &Arc<SharedPool<M>>) {
    let shortfall = pool
        .config
        .min_connections
        .saturating_sub(pool.total());

    for _ in 0..shortfall {
        // Reserved against maxConnections so refill can't race on-demand
        // growth (`PooledDataSource::get_connection`) or the adaptive sizer
        // past the configured cap.
        if !pool.try_reserve_growth_slot(pool.config.max_connections) {
            break;
        }
        let result = pool.create_connection().await;
        pool.release_growth_slot();
        match result {
            Ok(conn) => {
                conn.set_state(LifecycleState::Idle);
                pool.idle_ids.lock().insert(conn.id);
                pool.bag.add(conn);
            }
            Err(err) => {
                debug!(error = %err, "house-keeper refill attempt failed, will retry next sweep");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::metrics::NoopTracker;
    use crate::testutil::FakeConnectionManager;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    fn test_pool(config: PoolConfig) -> Arc<SharedPool<FakeConnectionManager>> {
        Arc::new(SharedPool {
            manager: Arc::new(FakeConnectionManager::default()),
            bag: crate::bag::ConcurrentBag::new(),
            idle_ids: Mutex::new(HashSet::new()),
            breaker: crate::breaker::CircuitBreaker::new(crate::breaker::BreakerConfig::default()),
            metrics: Arc::new(NoopTracker),
            closed: std::sync::atomic::AtomicBool::new(false),
            shutdown: tokio::sync::Notify::new(),
            pending: std::sync::atomic::AtomicU32::new(0),
            config,
        })
    }

    #[tokio::test]
    async fn evicts_connections_past_max_lifetime() {
        let pool = test_pool(PoolConfig {
            max_lifetime: Duration::from_millis(1),
            idle_timeout: Duration::ZERO,
            ..Default::default()
        });
        let conn = pool.create_connection().await.unwrap();
        conn.set_state(LifecycleState::Idle);
        pool.bag.add(conn);

        tokio::time::sleep(Duration::from_millis(20)).await;
        evict_expired(&pool).await;

        assert_eq!(pool.total(), 0);
    }

    #[tokio::test]
    async fn refill_tops_up_to_min_connections() {
        let pool = test_pool(PoolConfig {
            min_connections: 3,
            max_connections: 5,
            ..Default::default()
        });
        refill(&pool).await;
        assert_eq!(pool.total(), 3);
        assert_eq!(pool.idle(), 3);
    }

    #[tokio::test]
    async fn refill_stops_after_a_failed_attempt() {
        let pool = test_pool(PoolConfig {
            min_connections: 3,
            max_connections: 5,
            ..Default::default()
        });
        pool.manager.fail_next(1);
        refill(&pool).await;
        assert_eq!(pool.total(), 0);
    }

    #[tokio::test]
    async fn evicts_idle_connections_past_idle_timeout_above_min_connections() {
        let pool = test_pool(PoolConfig {
            min_connections: 1,
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        for _ in 0..3 {
            let conn = pool.create_connection().await.unwrap();
            conn.set_state(LifecycleState::Idle);
            pool.idle_ids.lock().insert(conn.id);
            pool.bag.add(conn);
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        evict_expired(&pool).await;

        // Idle-timeout eviction stops once the pool would drop to minConnections.
        assert_eq!(pool.total(), 1);
    }

    #[tokio::test]
    async fn idle_timeout_eviction_is_suppressed_at_min_connections() {
        let pool = test_pool(PoolConfig {
            min_connections: 2,
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        for _ in 0..2 {
            let conn = pool.create_connection().await.unwrap();
            conn.set_state(LifecycleState::Idle);
            pool.idle_ids.lock().insert(conn.id);
            pool.bag.add(conn);
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        evict_expired(&pool).await;

        // Pool is already at minConnections, so no idle-timeout eviction happens.
        assert_eq!(pool.total(), 2);
    }

    #[tokio::test]
    async fn leaves_connections_within_lifetime_and_idle_timeout_alone() {
        let pool = test_pool(PoolConfig {
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(300),
            ..Default::default()
        });
        let conn = pool.create_connection().await.unwrap();
        conn.set_state(LifecycleState::Idle);
        pool.bag.add(conn);

        evict_expired(&pool).await;
        assert_eq!(pool.total(), 1);
    }
}
