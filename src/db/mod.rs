//! SQLite primary store
//!
//! A single writer connection behind an async mutex. All store operations are
//! plain functions over `&Connection`, so a reconciliation event can compose
//! them inside one transaction.

pub mod event_log;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::{MefError, Result};

/// Transaction retry ceiling for SQLITE_BUSY
const MAX_TX_ATTEMPTS: u32 = 3;

/// Handle on the primary store
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (and create if absent) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initialize or migrate the schema
    pub async fn init(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        schema::init_schema(&conn)
    }

    /// Run a read-only closure against the connection
    pub async fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside a transaction, committing on success.
    ///
    /// Retries up to three times when SQLite reports the database busy or
    /// locked; any other error rolls the transaction back and propagates.
    pub async fn transaction<T>(
        &self,
        f: impl Fn(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = conn.transaction()?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit()?;
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < MAX_TX_ATTEMPTS => {
                    drop(tx);
                    warn!(attempt, error = %e, "Transaction retry after transient store error");
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64))
                        .await;
                }
                Err(e) => {
                    debug!(error = %e, "Transaction rolled back");
                    return Err(e);
                }
            }
        }
    }
}

/// Map an optional rusqlite row lookup to `Option<T>`
pub fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MefError::Database(e)),
    }
}
