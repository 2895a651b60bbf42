//! The external surface the pool consumes from the (out-of-scope) MySQL
//! driver. Nothing here implements a wire protocol: these are the trait
//! boundaries the pool is built against, exactly as `bb8`'s
//! `ManageConnection` is a trait with no concrete database manager shipped
//! in the pool crate itself — concrete managers (a real MySQL driver) live
//! downstream.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::error::DriverError;

/// SQL transaction isolation levels, mirroring `java.sql.Connection`'s
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// An opaque savepoint handle.
#[derive(Debug, Clone)]
pub struct Savepoint(pub String);

/// An opaque prepared/plain statement handle.
#[derive(Debug)]
pub struct Statement;

/// An opaque prepared statement handle.
#[derive(Debug)]
pub struct PreparedStatement;

/// Driver-reported connection/server metadata.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub server_version: String,
    pub catalog: Option<String>,
}

/// A single MySQL wire connection. Every method here is delegated verbatim
/// by [`crate::proxy::ConnectionProxy`]; the proxy never alters observable
/// driver semantics.
#[async_trait]
pub trait Connection: Send + 'static {
    async fn is_valid(&mut self, timeout: Duration) -> Result<(), DriverError>;
    async fn close(self) -> Result<(), DriverError>;

    fn create_statement(&mut self) -> Result<Statement, DriverError>;
    fn prepare_statement(&mut self, sql: &str) -> Result<PreparedStatement, DriverError>;

    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError>;
    async fn commit(&mut self) -> Result<(), DriverError>;
    async fn rollback(&mut self) -> Result<(), DriverError>;

    async fn set_savepoint(&mut self) -> Result<Savepoint, DriverError>;
    async fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), DriverError>;
    async fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), DriverError>;

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<(), DriverError>;
    fn transaction_isolation(&self) -> IsolationLevel;

    fn set_read_only(&mut self, read_only: bool) -> Result<(), DriverError>;
    fn is_read_only(&self) -> bool;

    fn metadata(&self) -> ConnectionMetadata;
    fn set_catalog(&mut self, catalog: &str) -> Result<(), DriverError>;

    fn is_closed(&self) -> bool;
}

/// Creates and validates [`Connection`]s for a [`crate::pool::PooledDataSource`].
///
/// `connect` is capable of failing with [`DriverError::CannotReachServer`],
/// which is the failure the circuit breaker reacts to.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, config: &PoolConfig) -> Result<Self::Connection, DriverError>;
    async fn is_valid(
        &self,
        conn: &mut Self::Connection,
        timeout: Duration,
    ) -> Result<(), DriverError>;
}
