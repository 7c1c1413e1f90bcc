//! Error types for connection pools and the pool registry.

use std::collections::TryReserveError;

use thiserror::Error;

use crate::connection::{Connection, PooledConnection};

/// Result type alias for pool and registry operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during pool and registry operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool `{0}` is not initialized")]
    NotInitialized(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("pool `{pool}` exhausted at {max} connections{}", wait_suffix(.timed_out))]
    PoolExhausted {
        pool: String,
        max: usize,
        /// `true` when the caller waited and the deadline passed,
        /// `false` for an immediate rejection.
        timed_out: bool,
    },

    #[error("connection does not belong to {0}")]
    WrongOwner(String),

    #[error("pool not found: {0}")]
    NotFound(String),

    #[error("pool name `{name}` is already bound to id {existing}")]
    DuplicateName { name: String, existing: u32 },

    #[error("connection factory failed: {0:#}")]
    Factory(#[source] anyhow::Error),

    #[error("out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to spawn maintenance thread: {0}")]
    Spawn(#[from] std::io::Error),
}

fn wait_suffix(timed_out: &bool) -> &'static str {
    if *timed_out { " (wait timed out)" } else { "" }
}

impl PoolError {
    /// `true` for capacity failures, whether or not the caller waited.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::PoolExhausted { .. })
    }

    /// `true` only for capacity failures reported after a wait deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::PoolExhausted { timed_out: true, .. })
    }
}

/// A connection handed back to the caller because Release/Destroy rejected it.
///
/// The pool never takes ownership of a handle it does not own, so the
/// rejected handle travels back inside the error.
pub struct ReturnError<C: Connection> {
    pub error: PoolError,
    pub connection: PooledConnection<C>,
}

impl<C: Connection> ReturnError<C> {
    pub(crate) fn new(error: PoolError, connection: PooledConnection<C>) -> Self {
        Self { error, connection }
    }

    /// Drop the returned handle and keep only the error.
    pub fn into_error(self) -> PoolError {
        self.error
    }
}

impl<C: Connection> std::fmt::Debug for ReturnError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReturnError")
            .field("error", &self.error)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl<C: Connection> std::fmt::Display for ReturnError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl<C: Connection> std::error::Error for ReturnError<C> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<C: Connection> From<ReturnError<C>> for PoolError {
    fn from(err: ReturnError<C>) -> Self {
        err.error
    }
}
