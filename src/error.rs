//! Error types shared by all pool operations.

use std::time::Duration;

use thiserror::Error;

/// Error returned by pool operations.
///
/// [`PoolError::Closed`] is an expected, recoverable condition: the caller
/// may reopen the pool and retry. [`PoolError::InvalidTimeout`] is a
/// programmer error at the call site and is not meant to be handled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is closed, or was closed while an acquisition was being
    /// claimed.
    #[error("pool is closed")]
    Closed,

    /// A zero acquire timeout was supplied.
    #[error("invalid acquire timeout: {0:?}")]
    InvalidTimeout(Duration),
}
