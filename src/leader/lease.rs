//! Leader lease stored in the store's sidecar lease file.
//!
//! One row, one holder. A lease is granted when the row is vacant, expired,
//! or already held by the caller; every grant pushes the expiry forward.
//! Keeping the lease out of the data file means renewals never disturb
//! `PRAGMA data_version` on the data file.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

const LEASE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS leader_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
)
"#;

/// The current lease holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    /// Expiry as Unix milliseconds.
    pub expires_at: i64,
}

impl Lease {
    /// Whether the lease is still valid at `now`.
    pub fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// Create the lease table if missing.
pub fn ensure_lease_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(LEASE_TABLE)
}

/// Read the lease row, live or not.
pub fn read_lease(conn: &Connection) -> rusqlite::Result<Option<Lease>> {
    conn.query_row(
        "SELECT holder, expires_at FROM leader_lease WHERE id = 1",
        [],
        |row| {
            Ok(Lease {
                holder: row.get(0)?,
                expires_at: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Acquire or renew the lease for `holder`.
///
/// Returns `true` if `holder` holds the lease until `now + duration_ms`.
pub fn try_acquire(
    conn: &mut Connection,
    holder: &str,
    now: i64,
    duration_ms: i64,
) -> rusqlite::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let granted = match read_lease(&tx)? {
        None => true,
        Some(lease) => lease.holder == holder || !lease.is_live(now),
    };

    if granted {
        tx.execute(
            "INSERT INTO leader_lease (id, holder, expires_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
            params![holder, now + duration_ms],
        )?;
    }

    tx.commit()?;
    Ok(granted)
}

/// Whether `holder` holds a live lease at `now`.
pub fn holds(conn: &Connection, holder: &str, now: i64) -> rusqlite::Result<bool> {
    Ok(read_lease(conn)?.is_some_and(|lease| lease.holder == holder && lease.is_live(now)))
}

/// Give up the lease if `holder` has it.
///
/// Returns `true` if a lease was released.
pub fn release(conn: &Connection, holder: &str) -> rusqlite::Result<bool> {
    let removed = conn.execute(
        "DELETE FROM leader_lease WHERE id = 1 AND holder = ?1",
        params![holder],
    )?;
    Ok(removed > 0)
}
