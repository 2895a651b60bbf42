//! The adaptive pool sizer: watches utilization and grows or shrinks the
//! pool between `minConnections` and `maxConnections`.
//!
//! Shaped after `warpgrid-autoscale`'s `Autoscaler::run`/`evaluate` loop: a
//! periodic `tokio::select!` over a tick and a shutdown signal, hysteresis
//! over consecutive readings before acting, and a cooldown window after
//! every resize.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::connection::LifecycleState;
use crate::driver::ConnectionManager;
use crate::pool::SharedPool;

/// Fraction of the pool in use above which growth is considered.
const HIGH_WATERMARK: f64 = 0.75;
/// Fraction of the pool in use below which shrinkage is considered.
const LOW_WATERMARK: f64 = 0.25;
/// Consecutive high-interval readings required before growing.
const GROW_HYSTERESIS_READINGS: u32 = 2;
/// Consecutive low-interval readings required before shrinking.
const SHRINK_HYSTERESIS_READINGS: u32 = 3;
/// Minimum time between resizes, and between a resize and the next one.
const COOLDOWN: Duration = Duration::from_secs(2 * 60);
/// Connections added/removed per ordinary resize step.
const STEP: u32 = 1;
/// Connections added on a critical-utilization jump.
const CRITICAL_STEP: u32 = 2;

/// Run the adaptive-sizing loop until the pool is closed.
pub(crate) async fn run<M: ConnectionManager>(pool: Arc<SharedPool<M>>) {
    let mut interval = tokio::time::interval(pool.config.adaptive_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut high_streak: u32 = 0;
    let mut low_streak: u32 = 0;
    let mut cooldown_until = std::time::Instant::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = pool.shutdown.notified() => {
                debug!("adaptive sizer observed shutdown, exiting");
                return;
            }
        }

        if pool.closed.load(Ordering::Acquire) {
            return;
        }

        let status = pool.status();
        if status.total == 0 {
            continue;
        }
        let utilization = f64::from(status.active) / f64::from(status.total);
        let has_waiters = status.waiting > 0;

        // U = 1 and waiters > 0: jump immediately, bypassing hysteresis.
        if utilization >= 1.0 && has_waiters && status.total < pool.config.max_connections {
            grow(&pool, CRITICAL_STEP).await;
            high_streak = 0;
            low_streak = 0;
            cooldown_until = std::time::Instant::now() + COOLDOWN;
            continue;
        }

        if std::time::Instant::now() < cooldown_until {
            continue;
        }

        // High interval: U >= 0.75 or waiters > 0.
        let is_high = utilization >= HIGH_WATERMARK || has_waiters;
        if is_high {
            high_streak += 1;
            low_streak = 0;
        } else if utilization <= LOW_WATERMARK {
            low_streak += 1;
            high_streak = 0;
        } else {
            high_streak = 0;
            low_streak = 0;
        }

        if high_streak >= GROW_HYSTERESIS_READINGS && status.total < pool.config.max_connections {
            grow(&pool, STEP).await;
            high_streak = 0;
            cooldown_until = std::time::Instant::now() + COOLDOWN;
        } else if low_streak >= SHRINK_HYSTERESIS_READINGS && status.total > pool.config.min_connections {
            shrink(&pool, STEP).await;
            low_streak = 0;
            cooldown_until = std::time::Instant::now() + COOLDOWN;
        }
    }
}

async fn grow<M: ConnectionManager>(pool: &Arc<SharedPool<M>>, by: u32) {
    let target = (pool.total() + by).min(pool.config.max_connections);
    let mut added = 0;
    while pool.total() < target {
        // Reserved against the same cap `get_connection`'s on-demand growth
        // uses, so the two growers can't collectively overshoot maxConnections.
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
                added += 1;
            }
            Err(err) => {
                debug!(error = %err, "adaptive sizer growth attempt failed");
                break;
            }
        }
    }
    if added > 0 {
        info!(added, total = pool.total(), "adaptive sizer grew the pool");
    }
}

async fn shrink<M: ConnectionManager>(pool: &Arc<SharedPool<M>>, by: u32) {
    let target = pool.total().saturating_sub(by).max(pool.config.min_connections);
    let mut removed = 0;
    for entry in pool.bag.snapshot() {
        if pool.total() <= target {
            break;
        }
        if entry.item.state() != LifecycleState::Idle {
            continue;
        }
        pool.evict(&entry).await;
        removed += 1;
    }
    if removed > 0 {
        info!(removed, total = pool.total(), "adaptive sizer shrank the pool");
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
    async fn grow_adds_connections_up_to_the_requested_amount() {
        let pool = test_pool(PoolConfig {
            min_connections: 1,
            max_connections: 5,
            ..Default::default()
        });
        let conn = pool.create_connection().await.unwrap();
        conn.set_state(LifecycleState::Idle);
        pool.bag.add(conn);

        grow(&pool, 2).await;
        assert_eq!(pool.total(), 3);
    }

    #[tokio::test]
    async fn grow_never_exceeds_max_connections() {
        let pool = test_pool(PoolConfig {
            min_connections: 1,
            max_connections: 2,
            ..Default::default()
        });
        let conn = pool.create_connection().await.unwrap();
        conn.set_state(LifecycleState::Idle);
        pool.bag.add(conn);

        grow(&pool, 5).await;
        assert_eq!(pool.total(), 2);
    }

    #[tokio::test]
    async fn shrink_never_drops_below_min_connections() {
        let pool = test_pool(PoolConfig {
            min_connections: 1,
            max_connections: 5,
            ..Default::default()
        });
        for _ in 0..3 {
            let conn = pool.create_connection().await.unwrap();
            conn.set_state(LifecycleState::Idle);
            pool.idle_ids.lock().insert(conn.id);
            pool.bag.add(conn);
        }

        shrink(&pool, 10).await;
        assert_eq!(pool.total(), 1);
    }

    #[tokio::test]
    async fn two_consecutive_high_intervals_grow_the_pool_without_saturating() {
        let pool = test_pool(PoolConfig {
            min_connections: 4,
            max_connections: 10,
            adaptive_sizing: true,
            adaptive_interval: Duration::from_millis(20),
            ..Default::default()
        });
        // 3 of 4 in use: utilization = 0.75, at the high watermark, no waiters.
        // This must never trip the U=1-and-waiters critical fast path.
        for _ in 0..3 {
            let conn = pool.create_connection().await.unwrap();
            conn.set_state(LifecycleState::InUse);
            pool.bag.add_in_use(conn);
        }
        let idle_conn = pool.create_connection().await.unwrap();
        idle_conn.set_state(LifecycleState::Idle);
        pool.idle_ids.lock().insert(idle_conn.id);
        pool.bag.add(idle_conn);

        let handle = tokio::spawn(run(pool.clone()));
        tokio::time::sleep(Duration::from_millis(90)).await;
        pool.shutdown.notify_waiters();
        let _ = handle.await;

        assert!(
            pool.total() > 4,
            "two consecutive high (but non-critical) intervals should grow the pool"
        );
    }

    #[tokio::test]
    async fn shrink_leaves_in_use_connections_alone() {
        let pool = test_pool(PoolConfig {
            min_connections: 0,
            max_connections: 5,
            ..Default::default()
        });
        let conn = pool.create_connection().await.unwrap();
        conn.set_state(LifecycleState::InUse);
        pool.bag.add_in_use(conn);

        shrink(&pool, 1).await;
        assert_eq!(pool.total(), 1);
    }
}
