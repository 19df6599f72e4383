use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Transfer store: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE transfers (
                id          TEXT PRIMARY KEY,
                group_id    TEXT,
                peer        TEXT NOT NULL,
                direction   TEXT NOT NULL,
                status      TEXT NOT NULL,
                record_json TEXT NOT NULL,
                checksum    TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_transfers_group ON transfers(group_id);
            CREATE INDEX idx_transfers_status ON transfers(status, updated_at);

            INSERT INTO schema_version (version) VALUES (1);
            "
        )?;
    }

    Ok(())
}
