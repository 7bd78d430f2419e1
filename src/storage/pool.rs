/// SQLite connection pool
///
/// A fixed set of connections, leased one at a time. Waiting for a lease is
/// bounded; a lease is bound to a cancellation token and interrupts whatever
/// query is running on it once that token fires.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::storage::StorageError;

/// How long a request waits for a connection before giving up
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(3);

struct PoolInner {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    size: usize,
}

/// Cheaply clonable handle to the pool
#[derive(Clone)]
pub struct DbPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("path", &self.inner.path)
            .field("size", &self.inner.size)
            .finish()
    }
}

impl DbPool {
    /// Open `size` connections to the database at `path`
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let size = size.max(1);

        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            conns.push(Self::open_connection(&path)?);
        }

        tracing::info!("Database pool of {} connection(s) opened at: {:?}", size, path);

        Ok(Self {
            inner: Arc::new(PoolInner {
                path,
                idle: Mutex::new(conns),
                permits: Arc::new(Semaphore::new(size)),
                size,
            }),
        })
    }

    fn open_connection(path: &Path) -> Result<Connection, StorageError> {
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Connection(format!("Failed to open database: {}", e)))?;

        // Enable foreign key constraints
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(|e| StorageError::Connection(format!("Failed to enable foreign keys: {}", e)))?;

        conn.busy_timeout(DEFAULT_LEASE_TIMEOUT)
            .map_err(|e| StorageError::Connection(format!("Failed to set busy timeout: {}", e)))?;

        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Connections not currently leased
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Lease a connection, waiting at most `timeout`
    ///
    /// Fails with [`StorageError::Busy`] on timeout and with
    /// [`StorageError::Interrupted`] if `token` is cancelled first. Once
    /// leased, cancelling `token` interrupts the running query.
    pub async fn lease(
        &self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<DbLease, StorageError> {
        let acquire = tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned());

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(StorageError::Interrupted),
            acquired = acquire => match acquired {
                Ok(Ok(permit)) => permit,
                // Closed semaphore or elapsed timeout
                _ => return Err(StorageError::Busy),
            },
        };

        let conn = self
            .inner
            .idle
            .lock()
            .pop()
            .ok_or_else(|| StorageError::Connection("pool has no idle connection".to_string()))?;

        let released = CancellationToken::new();
        let interrupt = conn.get_interrupt_handle();
        let watched = token.clone();
        let watcher_released = released.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.cancelled() => interrupt.interrupt(),
                _ = watcher_released.cancelled() => {}
            }
        });

        Ok(DbLease {
            conn: Some(conn),
            pool: self.inner.clone(),
            released,
            _permit: permit,
        })
    }
}

/// A leased connection, returned to the pool on drop
pub struct DbLease {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    released: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

impl Deref for DbLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in Drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for DbLease {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for DbLease {
    fn drop(&mut self) {
        self.released.cancel();
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
        // The permit is released after this, once the connection is back
    }
}
