//! Schema initialization and connection pragmas.
//!
//! The patient registry schema is applied once per store lifetime: the
//! migration runs inside an IMMEDIATE transaction and stamps
//! `PRAGMA user_version`, so re-running it on every startup is a no-op.

use rusqlite::{Connection, TransactionBehavior};
use std::time::Duration;

/// Schema version written to `PRAGMA user_version` after migration.
pub const SCHEMA_VERSION: i32 = 1;

/// Patient registry tables and indexes.
pub const PATIENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    date_of_birth TEXT NOT NULL,
    gender TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    address TEXT,
    medical_history TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_patients_created_at ON patients (created_at DESC);
CREATE INDEX IF NOT EXISTS idx_patients_first_name ON patients (first_name);
CREATE INDEX IF NOT EXISTS idx_patients_last_name ON patients (last_name);
CREATE INDEX IF NOT EXISTS idx_patients_email ON patients (email);
"#;

/// Apply the pragmas every delegate connection runs with.
///
/// WAL lets followers read while the leader writes.
pub fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Current schema version of the store.
pub fn current_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// `PRAGMA data_version`: changes whenever another connection commits.
pub fn data_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA data_version", [], |row| row.get(0))
}

/// Bring the store up to [`SCHEMA_VERSION`].
///
/// Returns `true` if the migration was applied, `false` if the store was
/// already current.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let version: i32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(false);
    }

    tx.execute_batch(PATIENTS_SCHEMA)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    tracing::info!(from = version, to = SCHEMA_VERSION, "Schema migrated");
    Ok(true)
}
