//! [`ConnectionProxy`] — the ephemeral handle given to callers.
//!
//! Every driver operation is delegated verbatim to the wrapped
//! [`PooledConnection`]; `close` is the one exception, invoking the release
//! callback instead of the driver's close. The proxy never closes the
//! underlying connection itself.

use std::sync::Arc;
use std::time::Duration;

use crate::bag::BagEntry;
use crate::connection::PooledConnection;
use crate::driver::{Connection, ConnectionMetadata, IsolationLevel, PreparedStatement, Savepoint, Statement};
use crate::error::{DriverError, PoolError};

/// A bag entry wrapping the pool's view of one connection.
pub type PoolEntry<C> = Arc<BagEntry<Arc<PooledConnection<C>>>>;

/// The callback invoked by [`ConnectionProxy::close`]. Not idempotency
/// dampened at this layer: calling `close()` twice invokes this twice.
/// De-duplication happens one layer down, in the bag's CAS-based requite
/// (see [`crate::bag::ConcurrentBag::requite`]).
pub type ReleaseFn<C> = Arc<dyn Fn(PoolEntry<C>) -> Result<(), PoolError> + Send + Sync>;

/// A thin, short-lived façade handed to a caller by
/// [`crate::pool::PooledDataSource::get_connection`].
pub struct ConnectionProxy<C: Connection> {
    entry: PoolEntry<C>,
    release: ReleaseFn<C>,
}

impl<C: Connection> ConnectionProxy<C> {
    pub(crate) fn new(entry: PoolEntry<C>, release: ReleaseFn<C>) -> Self {
        Self { entry, release }
    }

    fn conn(&self) -> &PooledConnection<C> {
        &self.entry.item
    }

    /// The pool-assigned identifier of the underlying connection.
    pub fn connection_id(&self) -> u64 {
        self.conn().id
    }

    /// Return the connection to the pool. May be called more than once;
    /// each call invokes the release callback (see [`ReleaseFn`]).
    pub fn close(&self) -> Result<(), PoolError> {
        (self.release)(self.entry.clone())
    }

    pub async fn is_valid(&self, timeout: Duration) -> Result<(), DriverError> {
        self.conn().is_valid(timeout).await
    }

    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DriverError> {
        self.conn().set_auto_commit(auto_commit).await
    }

    pub async fn commit(&self) -> Result<(), DriverError> {
        self.conn().commit().await
    }

    pub async fn rollback(&self) -> Result<(), DriverError> {
        self.conn().rollback().await
    }

    pub async fn set_savepoint(&self) -> Result<Savepoint, DriverError> {
        self.conn().set_savepoint().await
    }

    pub async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<(), DriverError> {
        self.conn().rollback_to_savepoint(savepoint).await
    }

    pub async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<(), DriverError> {
        self.conn().release_savepoint(savepoint).await
    }

    pub fn create_statement(&self) -> Result<Statement, DriverError> {
        self.conn().create_statement()
    }

    pub fn prepare_statement(&self, sql: &str) -> Result<PreparedStatement, DriverError> {
        self.conn().prepare_statement(sql)
    }

    pub fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DriverError> {
        self.conn().set_transaction_isolation(level)
    }

    pub fn transaction_isolation(&self) -> IsolationLevel {
        self.conn().transaction_isolation()
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<(), DriverError> {
        self.conn().set_read_only(read_only)
    }

    pub fn is_read_only(&self) -> bool {
        self.conn().is_read_only()
    }

    pub fn metadata(&self) -> ConnectionMetadata {
        self.conn().metadata()
    }

    pub fn set_catalog(&self, catalog: &str) -> Result<(), DriverError> {
        self.conn().set_catalog(catalog)
    }

    pub fn is_closed(&self) -> bool {
        self.conn().is_closed()
    }
}

impl<C: Connection> Drop for ConnectionProxy<C> {
    /// Scoped release: if the caller never called `close()` explicitly, the
    /// connection still returns to the pool when the proxy falls out of
    /// scope.
    fn drop(&mut self) {
        let _ = (self.release)(self.entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeConnection;

    #[tokio::test]
    async fn close_invokes_release_every_time_it_is_called() {
        let entry: PoolEntry<FakeConnection> = Arc::new(BagEntry::new(
            Arc::new(PooledConnection::new(FakeConnection::new())),
            crate::bag::BagState::InUse,
        ));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let release: ReleaseFn<FakeConnection> = Arc::new(move |_| {
            calls2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let proxy = ConnectionProxy::new(entry, release);

        proxy.close().unwrap();
        proxy.close().unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_releases_if_close_was_never_called() {
        let entry: PoolEntry<FakeConnection> = Arc::new(BagEntry::new(
            Arc::new(PooledConnection::new(FakeConnection::new())),
            crate::bag::BagState::InUse,
        ));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let release: ReleaseFn<FakeConnection> = Arc::new(move |_| {
            calls2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        {
            let _proxy = ConnectionProxy::new(entry, release);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delegates_driver_calls_verbatim() {
        let entry: PoolEntry<FakeConnection> = Arc::new(BagEntry::new(
            Arc::new(PooledConnection::new(FakeConnection::new())),
            crate::bag::BagState::InUse,
        ));
        let release: ReleaseFn<FakeConnection> = Arc::new(|_| Ok(()));
        let proxy = ConnectionProxy::new(entry, release);

        proxy.set_read_only(true).unwrap();
        assert!(proxy.is_read_only());
        assert!(proxy.is_valid(Duration::from_millis(50)).await.is_ok());
    }
}
