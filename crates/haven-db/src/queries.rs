use crate::TransferStore;
use crate::models::{TransferRow, checksum};
use anyhow::Result;
use chrono::Utc;
use haven_types::{GroupId, TransferId, TransferRecord, TransferStatus};
use rusqlite::Connection;
use tracing::{debug, warn};

const SELECT_ROW: &str = "SELECT id, status, record_json, checksum FROM transfers";

impl TransferStore {
    // -- Writes --

    /// Upsert `record`, merging acked ranges with the stored row and keeping
    /// a stored terminal status. Returns the record as persisted.
    pub fn save_record(&self, record: &TransferRecord) -> Result<TransferRecord> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let mut merged = record.clone();
            if let Some(existing) = query_record(&tx, record.transfer_id)? {
                merged.acked.merge(&existing.acked);
                merged.created_at = existing.created_at;
                if existing.status.is_terminal() {
                    merged.status = existing.status;
                    merged.last_error = existing.last_error;
                }
            }
            merged.updated_at = merged.updated_at.max(Utc::now());

            let json = serde_json::to_string(&merged)?;
            tx.execute(
                "INSERT INTO transfers
                    (id, group_id, peer, direction, status, record_json, checksum, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    record_json = excluded.record_json,
                    checksum = excluded.checksum,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    merged.transfer_id.to_string(),
                    merged.kind.group_id().map(|g| g.to_string()),
                    merged.peer.as_str(),
                    format!("{:?}", merged.direction).to_lowercase(),
                    merged.status.as_str(),
                    json,
                    checksum(&json),
                    merged.created_at.to_rfc3339(),
                    merged.updated_at.to_rfc3339(),
                ],
            )?;
            tx.commit()?;

            debug!(
                transfer_id = %merged.transfer_id,
                status = %merged.status,
                acked = merged.acked.len(),
                "transfer record saved"
            );
            Ok(merged)
        })
    }

    pub fn delete_record(&self, transfer_id: TransferId) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM transfers WHERE id = ?1", [transfer_id.to_string()])?;
            Ok(n > 0)
        })
    }

    /// Remove every finished transfer. Returns how many rows were removed.
    pub fn clear_history(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM transfers WHERE status IN (?1, ?2, ?3)",
                [
                    TransferStatus::Completed.as_str(),
                    TransferStatus::Failed.as_str(),
                    TransferStatus::Cancelled.as_str(),
                ],
            )?;
            Ok(n)
        })
    }

    // -- Reads --

    pub fn load_record(&self, transfer_id: TransferId) -> Result<Option<TransferRecord>> {
        self.with_conn(|conn| query_record(conn, transfer_id))
    }

    /// Transfers that can still be resumed, most recently touched first.
    pub fn list_resumable(&self) -> Result<Vec<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE status IN (?1, ?2, ?3) ORDER BY updated_at DESC",
                SELECT_ROW
            );
            query_records(
                conn,
                &sql,
                &[
                    TransferStatus::Pending.as_str(),
                    TransferStatus::Active.as_str(),
                    TransferStatus::Paused.as_str(),
                ],
            )
        })
    }

    pub fn list_group(&self, group_id: GroupId) -> Result<Vec<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!("{} WHERE group_id = ?1 ORDER BY created_at", SELECT_ROW);
            query_records(conn, &sql, &[group_id.to_string().as_str()])
        })
    }

    pub fn list_all(&self) -> Result<Vec<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!("{} ORDER BY updated_at DESC", SELECT_ROW);
            query_records(conn, &sql, &[])
        })
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRow> {
    Ok(TransferRow {
        id: row.get(0)?,
        status: row.get(1)?,
        record_json: row.get(2)?,
        checksum: row.get(3)?,
    })
}

/// Verify and decode a row. Damaged rows are logged and skipped.
fn decode(row: TransferRow) -> Option<TransferRecord> {
    if checksum(&row.record_json) != row.checksum {
        warn!(transfer_id = %row.id, "transfer record checksum mismatch, ignoring");
        return None;
    }
    match serde_json::from_str::<TransferRecord>(&row.record_json) {
        Ok(record) if record.status.as_str() == row.status => Some(record),
        Ok(_) => {
            warn!(transfer_id = %row.id, "transfer record status column disagrees, ignoring");
            None
        }
        Err(e) => {
            warn!(transfer_id = %row.id, "transfer record unreadable: {}", e);
            None
        }
    }
}

fn query_record(conn: &Connection, transfer_id: TransferId) -> Result<Option<TransferRecord>> {
    let sql = format!("{} WHERE id = ?1", SELECT_ROW);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([transfer_id.to_string()], map_row)
        .optional()?;

    Ok(row.and_then(decode))
}

fn query_records(conn: &Connection, sql: &str, params: &[&str]) -> Result<Vec<TransferRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().filter_map(decode).collect())
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PersistedTransferState;
    use haven_types::{Direction, FileMetadata, PeerIdentity, RangeSet, SessionKind};

    fn record(kind: SessionKind) -> TransferRecord {
        TransferRecord::new(
            TransferId::new(),
            PeerIdentity::new("peer-b"),
            Direction::Send,
            kind,
            FileMetadata {
                name: "report.pdf".into(),
                size: 1000,
                content_hash: "ab".repeat(32),
            },
            100,
        )
    }

    #[test]
    fn save_then_load() {
        let store = TransferStore::open_in_memory().unwrap();
        let mut rec = record(SessionKind::Single);
        rec.acked.insert_range(0, 4);
        store.save(&rec).unwrap();

        let loaded = store.load(rec.transfer_id).unwrap().unwrap();
        assert_eq!(loaded.acked, rec.acked);
        assert_eq!(loaded.file, rec.file);
        assert!(store.load(TransferId::new()).unwrap().is_none());
    }

    #[test]
    fn acked_ranges_never_rewind() {
        let store = TransferStore::open_in_memory().unwrap();
        let mut rec = record(SessionKind::Single);
        rec.acked.insert_range(0, 6);
        store.save(&rec).unwrap();

        // A stale writer with less progress.
        rec.acked = RangeSet::from(vec![(8, 9)]);
        let merged = store.save_record(&rec).unwrap();
        assert_eq!(merged.acked.ranges(), &[(0, 6), (8, 9)]);

        // Saving the same record again changes nothing.
        let again = store.save_record(&rec).unwrap();
        assert_eq!(again.acked, merged.acked);
    }

    #[test]
    fn terminal_status_is_kept() {
        let store = TransferStore::open_in_memory().unwrap();
        let mut rec = record(SessionKind::Single);
        rec.status = TransferStatus::Completed;
        store.save(&rec).unwrap();

        rec.status = TransferStatus::Paused;
        store.save(&rec).unwrap();
        let loaded = store.load(rec.transfer_id).unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Completed);
    }

    #[test]
    fn corrupted_row_loads_as_not_found() {
        let store = TransferStore::open_in_memory().unwrap();
        let rec = record(SessionKind::Single);
        store.save(&rec).unwrap();

        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE transfers SET record_json = substr(record_json, 1, 40) WHERE id = ?1",
                    [rec.transfer_id.to_string()],
                )?;
                Ok(())
            })
            .unwrap();

        assert!(store.load(rec.transfer_id).unwrap().is_none());
        assert!(store.list_all().unwrap().is_empty());

        // A fresh save overwrites the damaged row.
        store.save(&rec).unwrap();
        assert!(store.load(rec.transfer_id).unwrap().is_some());
    }

    #[test]
    fn delete_and_clear_history() {
        let store = TransferStore::open_in_memory().unwrap();
        let mut done = record(SessionKind::Single);
        done.status = TransferStatus::Failed;
        let paused = {
            let mut r = record(SessionKind::Single);
            r.status = TransferStatus::Paused;
            r
        };
        store.save(&done).unwrap();
        store.save(&paused).unwrap();

        assert_eq!(store.list_resumable().unwrap().len(), 1);
        assert_eq!(store.clear_history().unwrap(), 1);
        assert_eq!(store.list_all().unwrap().len(), 1);

        assert!(store.delete(paused.transfer_id).unwrap());
        assert!(!store.delete(paused.transfer_id).unwrap());
    }

    #[test]
    fn list_group_members() {
        let store = TransferStore::open_in_memory().unwrap();
        let group_id = GroupId::new();
        for _ in 0..3 {
            store.save(&record(SessionKind::GroupMember { group_id })).unwrap();
        }
        store.save(&record(SessionKind::Single)).unwrap();

        let members = store.list_group(group_id).unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|r| r.kind.group_id() == Some(group_id)));
    }

    #[test]
    fn survives_reopen() {
        let path = std::env::temp_dir().join(format!("haven-store-{}.db", uuid::Uuid::new_v4()));
        let rec = record(SessionKind::Single);
        {
            let store = TransferStore::open(&path).unwrap();
            store.save(&rec).unwrap();
        }
        let store = TransferStore::open(&path).unwrap();
        assert_eq!(store.load(rec.transfer_id).unwrap().unwrap().transfer_id, rec.transfer_id);

        drop(store);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }
}
