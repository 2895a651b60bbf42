//! A fake driver, standing in for the out-of-scope MySQL wire protocol so
//! the pool runtime has something to test against.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::driver::{
    Connection, ConnectionManager, ConnectionMetadata, IsolationLevel, PreparedStatement,
    Savepoint, Statement,
};
use crate::error::DriverError;

/// An in-memory stand-in for a MySQL wire connection.
pub struct FakeConnection {
    closed: bool,
    auto_commit: bool,
    read_only: bool,
    isolation: IsolationLevel,
    catalog: Option<String>,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self {
            closed: false,
            auto_commit: true,
            read_only: false,
            isolation: IsolationLevel::RepeatableRead,
            catalog: None,
        }
    }
}

impl Default for FakeConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn is_valid(&mut self, _timeout: Duration) -> Result<(), DriverError> {
        if self.closed {
            Err(DriverError::Other("connection is closed".into()))
        } else {
            Ok(())
        }
    }

    async fn close(mut self) -> Result<(), DriverError> {
        self.closed = true;
        Ok(())
    }

    fn create_statement(&mut self) -> Result<Statement, DriverError> {
        Ok(Statement)
    }

    fn prepare_statement(&mut self, _sql: &str) -> Result<PreparedStatement, DriverError> {
        Ok(PreparedStatement)
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError> {
        self.auto_commit = auto_commit;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn set_savepoint(&mut self) -> Result<Savepoint, DriverError> {
        Ok(Savepoint("sp1".into()))
    }

    async fn rollback_to_savepoint(&mut self, _savepoint: &Savepoint) -> Result<(), DriverError> {
        Ok(())
    }

    async fn release_savepoint(&mut self, _savepoint: &Savepoint) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<(), DriverError> {
        self.isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn set_read_only(&mut self, read_only: bool) -> Result<(), DriverError> {
        self.read_only = read_only;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            server_version: "fake-8.0".into(),
            catalog: self.catalog.clone(),
        }
    }

    fn set_catalog(&mut self, catalog: &str) -> Result<(), DriverError> {
        self.catalog = Some(catalog.to_owned());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A [`ConnectionManager`] whose failure behavior is controllable by tests:
/// it can be told to fail the next `N` connect attempts (to drive the
/// circuit breaker) or to always fail.
pub struct FakeConnectionManager {
    connect_failures_remaining: AtomicU64,
    always_fail: AtomicBool,
    connect_count: AtomicU64,
}

impl FakeConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_failures_remaining: AtomicU64::new(0),
            always_fail: AtomicBool::new(false),
            connect_count: AtomicU64::new(0),
        })
    }

    pub fn fail_next(&self, n: u64) {
        self.connect_failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }
}

impl Default for FakeConnectionManager {
    fn default() -> Self {
        Self {
            connect_failures_remaining: AtomicU64::new(0),
            always_fail: AtomicBool::new(false),
            connect_count: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ConnectionManager for FakeConnectionManager {
    type Connection = FakeConnection;

    async fn connect(&self, _config: &PoolConfig) -> Result<Self::Connection, DriverError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(DriverError::CannotReachServer("fake: always_fail".into()));
        }

        let remaining = self.connect_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::CannotReachServer(
                "fake: scripted failure".into(),
            ));
        }

        Ok(FakeConnection::new())
    }

    async fn is_valid(
        &self,
        conn: &mut Self::Connection,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        conn.is_valid(timeout).await
    }
}
