//! The error taxonomy surfaced by the pool.
//!
//! Every fallible pool operation returns [`PoolError`]. Background tasks
//! (the house-keeper, the adaptive sizer) never propagate these upward —
//! they log and swallow them, per the propagation policy below.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the connection-pool runtime.
///
/// `LeakDetected` is deliberately absent: leak detection is diagnostic only
/// (a counter bump and a log line) and never fails the caller's operation.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool construction rejected an invalid [`crate::config::PoolConfig`].
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// `getConnection` could not obtain an entry within `connectionTimeout`.
    #[error("timed out acquiring a connection after {0:?}")]
    AcquisitionTimeout(Duration),

    /// Connection creation was short-circuited by the circuit breaker.
    #[error("circuit breaker is open, rejecting connection creation")]
    BreakerOpen,

    /// A connection failed keep-alive validation.
    #[error("connection failed validation: {0}")]
    ValidationFailure(String),

    /// An error surfaced directly from the underlying driver.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The pool has been shut down.
    #[error("pool is closed")]
    Closed,
}

/// An error raised by the (out-of-scope) MySQL driver.
///
/// The pool distinguishes only the one case it must react to: a connection
/// attempt that could not reach the server at all, which is what trips the
/// circuit breaker. Everything else passes through as an opaque message.
#[derive(Debug, Error, Clone)]
pub enum DriverError {
    /// The driver could not establish a TCP/auth handshake with the server.
    #[error("cannot reach server: {0}")]
    CannotReachServer(String),

    /// Any other driver-level failure (bad SQL, protocol error, etc).
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Whether this failure should count against the circuit breaker's
    /// consecutive-failure counter during connection creation.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, DriverError::CannotReachServer(_))
    }
}
