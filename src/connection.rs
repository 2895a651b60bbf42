//! [`PooledConnection`]: a driver connection plus the bookkeeping the pool
//! needs (identity, timestamps, counters, lifecycle state).

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::driver::{
    Connection, ConnectionManager, ConnectionMetadata, IsolationLevel, PreparedStatement, Savepoint, Statement,
};
use crate::error::DriverError;

/// The lifecycle state of a pooled connection, independent of the bag's own
/// `BagState`. `Reserved` is a transient state the house-keeper uses as an
/// exclusive gate while evaluating eviction: `Idle -> Reserved` is the only
/// entrypoint, and it is a compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Idle = 0,
    InUse = 1,
    Reserved = 2,
    Removed = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Idle,
            1 => LifecycleState::InUse,
            2 => LifecycleState::Reserved,
            _ => LifecycleState::Removed,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A managed wrapper around a driver connection with lifecycle state,
/// identity, timestamps and counters.
pub struct PooledConnection<C: Connection> {
    pub id: u64,
    pub created_at: Instant,
    last_used: Mutex<Instant>,
    last_validated: Mutex<Instant>,
    checked_out_at: Mutex<Option<Instant>>,
    use_count: AtomicU32,
    state: AtomicU8,
    /// The raw driver connection. `None` only ever momentarily, while being
    /// taken for destruction.
    conn: Mutex<Option<C>>,
    leak_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connection> PooledConnection<C> {
    pub fn new(conn: C) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            created_at: now,
            last_used: Mutex::new(now),
            last_validated: Mutex::new(now),
            checked_out_at: Mutex::new(None),
            use_count: AtomicU32::new(0),
            state: AtomicU8::new(LifecycleState::Idle as u8),
            conn: Mutex::new(Some(conn)),
            leak_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt `from -> to`, the pool's exclusive gate for lifecycle
    /// transitions (e.g. the house-keeper's `Idle -> Reserved`).
    pub fn compare_and_set_state(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_state(&self, to: LifecycleState) {
        self.state.store(to as u8, Ordering::Release);
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn touch_used(&self) {
        *self.last_used.lock() = Instant::now();
        self.use_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the instant this connection was handed to a caller, so the
    /// matching [`PooledConnection::take_checkout_duration`] at release can
    /// report how long it was held.
    pub fn mark_checked_out(&self) {
        *self.checked_out_at.lock() = Some(Instant::now());
    }

    /// Take the elapsed time since the last [`PooledConnection::mark_checked_out`],
    /// if any. Consumes the timestamp so a double release can't double-count.
    pub fn take_checkout_duration(&self) -> Option<Duration> {
        self.checked_out_at.lock().take().map(|at| at.elapsed())
    }

    pub fn last_validated(&self) -> Instant {
        *self.last_validated.lock()
    }

    pub fn touch_validated(&self) {
        *self.last_validated.lock() = Instant::now();
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// Run `f` against the underlying driver connection.
    pub fn with_conn<R>(&self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        self.conn.lock().as_mut().map(f)
    }

    fn expect_conn(&self) -> parking_lot::MappedMutexGuard<'_, C> {
        parking_lot::MutexGuard::map(self.conn.lock(), |c| {
            c.as_mut().expect("connection used after it was destroyed")
        })
    }

    // The following mirror `Connection` verbatim, so that
    // `ConnectionProxy` can delegate every driver call without altering
    // observable semantics. Holding the `parking_lot` guard across `.await`
    // is safe here (the guard is `Send`) and uncontended in practice: a
    // `PooledConnection` has exactly one borrower at a time.

    pub async fn is_valid(&self, timeout: Duration) -> Result<(), DriverError> {
        self.expect_conn().is_valid(timeout).await
    }

    /// Validate through the manager's own `is_valid`, the usual
    /// manager-validates-connection shape (mirrors `bb8`'s
    /// `ManageConnection::is_valid`), rather than the driver connection's
    /// own `is_valid` directly. Used by the house-keeper's keepalive sweep.
    pub async fn validate_with<Mgr>(&self, manager: &Mgr, timeout: Duration) -> Result<(), DriverError>
    where
        Mgr: ConnectionManager<Connection = C>,
    {
        let mut guard = self.expect_conn();
        manager.is_valid(&mut guard, timeout).await
    }

    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DriverError> {
        self.expect_conn().set_auto_commit(auto_commit).await
    }

    pub async fn commit(&self) -> Result<(), DriverError> {
        self.expect_conn().commit().await
    }

    pub async fn rollback(&self) -> Result<(), DriverError> {
        self.expect_conn().rollback().await
    }

    pub async fn set_savepoint(&self) -> Result<Savepoint, DriverError> {
        self.expect_conn().set_savepoint().await
    }

    pub async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<(), DriverError> {
        self.expect_conn().rollback_to_savepoint(savepoint).await
    }

    pub async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<(), DriverError> {
        self.expect_conn().release_savepoint(savepoint).await
    }

    pub fn create_statement(&self) -> Result<Statement, DriverError> {
        self.expect_conn().create_statement()
    }

    pub fn prepare_statement(&self, sql: &str) -> Result<PreparedStatement, DriverError> {
        self.expect_conn().prepare_statement(sql)
    }

    pub fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DriverError> {
        self.expect_conn().set_transaction_isolation(level)
    }

    pub fn transaction_isolation(&self) -> IsolationLevel {
        self.expect_conn().transaction_isolation()
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<(), DriverError> {
        self.expect_conn().set_read_only(read_only)
    }

    pub fn is_read_only(&self) -> bool {
        self.expect_conn().is_read_only()
    }

    pub fn metadata(&self) -> ConnectionMetadata {
        self.expect_conn().metadata()
    }

    pub fn set_catalog(&self, catalog: &str) -> Result<(), DriverError> {
        self.expect_conn().set_catalog(catalog)
    }

    pub fn is_closed(&self) -> bool {
        match self.conn.lock().as_ref() {
            Some(conn) => conn.is_closed(),
            None => true,
        }
    }

    /// Arm the leak-detection timer: if not disarmed by
    /// [`PooledConnection::disarm_leak_timer`] within `threshold`, `on_leak`
    /// runs.
    pub fn arm_leak_timer(self: &Arc<Self>, threshold: Duration, on_leak: impl FnOnce() + Send + 'static) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            on_leak();
        });
        *self.leak_task.lock() = Some(handle);
    }

    pub fn disarm_leak_timer(&self) {
        if let Some(handle) = self.leak_task.lock().take() {
            handle.abort();
        }
    }

    /// Destroy the connection: close the driver connection exactly once and
    /// drop the reference. Idempotent — a second call is a no-op because
    /// the raw connection has already been taken.
    pub async fn destroy(&self) {
        self.disarm_leak_timer();
        let taken = self.conn.lock().take();
        if let Some(conn) = taken {
            if let Err(err) = conn.close().await {
                tracing::warn!(connection_id = self.id, error = %err, "error closing connection");
            }
        }
    }
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("use_count", &self.use_count())
            .finish()
    }
}
