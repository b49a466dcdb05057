//! Error types for the pool session.

use thiserror::Error;

use super::session::ConnectionState;

/// Failures surfaced by the pool session.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Network failure: connect, reset, TLS handshake, read/write
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed frame or envelope where it cannot be skipped
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Explicit error object returned by the pool
    #[error("pool error {code}: {message}")]
    Server {
        /// Numeric code from the peer
        code: i64,
        /// Human-readable message from the peer
        message: String,
    },

    /// No response within the per-request deadline
    #[error("timed out waiting for response")]
    Timeout,

    /// Pool refused the worker credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// API call not valid in the current connection state
    #[error("{op} is invalid while {state}")]
    InvalidState {
        /// Operation that was attempted
        op: &'static str,
        /// State the session was in
        state: ConnectionState,
    },

    /// Submission fingerprint was already seen
    #[error("duplicate submission")]
    ReplayRejected,

    /// Connection went away before the operation completed
    #[error("connection closed")]
    ConnectionClosed,
}

/// Convenient Result type for session operations.
pub type PoolResult<T> = Result<T, PoolError>;
