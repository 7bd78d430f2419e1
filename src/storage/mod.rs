/// Storage layer shared by request handlers
///
/// This module owns the SQLite connections the daemon hands out to request
/// handlers. The schema itself belongs to the handlers; the core only
/// leases connections, bounds how long a request may wait for one, and
/// interrupts queries whose request has been cancelled.

pub mod pool;

pub use pool::{DbLease, DbPool, DEFAULT_LEASE_TIMEOUT};

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database query error: {0}")]
    Query(#[source] rusqlite::Error),

    /// No connection became available in time
    #[error("The database is busy")]
    Busy,

    /// The request owning the lease was cancelled
    #[error("Database operation interrupted")]
    Interrupted,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                StorageError::Interrupted
            }
            _ => StorageError::Query(e),
        }
    }
}
