//! A HikariCP-style connection-pool runtime for MySQL clients, built on
//! `tokio`.
//!
//! The driver itself — the wire protocol, authentication, query encoding —
//! is out of scope; [`driver::Connection`] and [`driver::ConnectionManager`]
//! are the seam a concrete MySQL driver plugs into, the same way `bb8`
//! ships no database manager of its own. What lives here is the pool
//! runtime: [`bag::ConcurrentBag`]'s lock-free borrow/requite protocol,
//! [`breaker::CircuitBreaker`], the house-keeper and adaptive sizer
//! background tasks, and the [`pool::PooledDataSource`] façade that ties
//! them together.

mod bag;
mod breaker;
mod config;
mod connection;
mod driver;
mod error;
mod fast_list;
mod housekeeper;
mod metrics;
mod pool;
mod proxy;
mod sizer;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::{PoolConfig, PoolConfigValidator};
pub use driver::{
    Connection, ConnectionManager, ConnectionMetadata, IsolationLevel, PreparedStatement,
    Savepoint, Statement,
};
pub use error::{DriverError, PoolError};
pub use metrics::{InMemoryTracker, NoopTracker, PoolMetrics, PoolMetricsTracker};
pub use pool::{MetricsMode, PooledDataSource, PoolStatus};
pub use proxy::ConnectionProxy;
