/// Durable transfer progress on SQLite.
///
/// One row per transfer holding the serialized `TransferRecord` and a
/// SHA-256 checksum of it. Writes only ever move progress forward: acked
/// ranges are merged with what is stored and a terminal status is never
/// replaced. A row that fails its checksum or does not parse loads as
/// "not found", so the transfer restarts from zero instead of resuming from
/// an inconsistent point.

pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use haven_types::{TransferId, TransferRecord};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Storage contract the transfer engine persists through.
pub trait PersistedTransferState: Send + Sync {
    /// Idempotent, monotonic upsert.
    fn save(&self, record: &TransferRecord) -> Result<()>;
    /// `None` when absent or unreadable.
    fn load(&self, transfer_id: TransferId) -> Result<Option<TransferRecord>>;
    /// Returns true if a row was removed.
    fn delete(&self, transfer_id: TransferId) -> Result<bool>;
}

pub struct TransferStore {
    conn: Mutex<Connection>,
}

impl TransferStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrations::run(&conn)?;

        info!("Transfer store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&mut conn)
    }
}

impl PersistedTransferState for TransferStore {
    fn save(&self, record: &TransferRecord) -> Result<()> {
        self.save_record(record).map(|_| ())
    }

    fn load(&self, transfer_id: TransferId) -> Result<Option<TransferRecord>> {
        self.load_record(transfer_id)
    }

    fn delete(&self, transfer_id: TransferId) -> Result<bool> {
        self.delete_record(transfer_id)
    }
}
