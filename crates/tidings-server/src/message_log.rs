//! Async handle over the SQLite message log.
//!
//! `rusqlite::Connection` is blocking and not `Sync`, so every call hops onto
//! the blocking pool and takes the connection mutex there. Reads carry the
//! configured deadline; writes do not, so a slow append is never reported as
//! failed after it has committed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidings_store::Database;

use crate::error::ServerError;

#[derive(Clone)]
pub struct MessageLog {
    db: Arc<Mutex<Database>>,
    read_timeout: Duration,
}

impl MessageLog {
    pub fn new(db: Database, read_timeout: Duration) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            read_timeout,
        }
    }

    /// Run a read-only closure against the log, bounded by the read deadline.
    pub async fn read<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> tidings_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::time::timeout(self.read_timeout, self.run(f)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.read_timeout, "message log read timed out");
                Err(ServerError::Storage("read timed out".to_string()))
            }
        }
    }

    /// Run a mutating closure against the log.
    pub async fn write<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> tidings_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(f).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> tidings_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| ServerError::Storage("database lock poisoned".to_string()))?;
            f(&guard).map_err(ServerError::from)
        })
        .await
        .map_err(|e| ServerError::Storage(format!("database task failed: {e}")))?
    }
}
