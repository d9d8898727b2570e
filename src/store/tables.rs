//! Statement footprints: which tables a statement reads and writes.
//!
//! Footprints are captured with the SQLite authorizer while the statement is
//! prepared, so views and triggers resolve to the tables underneath them.

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// A set of table names.
pub type TableSet = BTreeSet<String>;

/// Tables touched by one or more statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    pub reads: TableSet,
    pub writes: TableSet,
}

impl Footprint {
    fn record(&mut self, action: &AuthAction<'_>) {
        match *action {
            AuthAction::Read { table_name, .. } => insert(&mut self.reads, table_name),
            AuthAction::Insert { table_name }
            | AuthAction::Delete { table_name }
            | AuthAction::Update { table_name, .. }
            | AuthAction::CreateTable { table_name }
            | AuthAction::DropTable { table_name }
            | AuthAction::AlterTable { table_name, .. }
            | AuthAction::CreateIndex { table_name, .. }
            | AuthAction::DropIndex { table_name, .. } => insert(&mut self.writes, table_name),
            _ => {}
        }
    }
}

fn insert(set: &mut TableSet, table: &str) {
    if !table.is_empty() && !table.starts_with("sqlite_") {
        set.insert(table.to_string());
    }
}

/// Run `op` with an authorizer attached and report the tables it touched.
///
/// The authorizer is detached again before returning, whatever `op` did.
pub fn with_footprint<T>(
    conn: &mut Connection,
    op: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
) -> (rusqlite::Result<T>, Footprint) {
    let seen = Arc::new(Mutex::new(Footprint::default()));
    let sink = Arc::clone(&seen);

    conn.authorizer(Some(move |ctx: AuthContext<'_>| {
        if let Ok(mut footprint) = sink.lock() {
            footprint.record(&ctx.action);
        }
        Authorization::Allow
    }));
    let result = op(conn);
    conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);

    let footprint = match seen.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    (result, footprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::rows::run_statement;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE visits (id INTEGER PRIMARY KEY, patient_id INTEGER, note TEXT);
             CREATE VIEW recent AS SELECT * FROM visits ORDER BY id DESC;",
        )
        .unwrap();
        conn
    }

    fn set(names: &[&str]) -> TableSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_reads() {
        let mut conn = conn();
        let (result, fp) = with_footprint(&mut conn, |c| {
            run_statement(
                c,
                "SELECT p.name, v.note FROM patients p JOIN visits v ON v.patient_id = p.id",
                &[],
            )
        });
        result.unwrap();
        assert_eq!(fp.reads, set(&["patients", "visits"]));
        assert!(fp.writes.is_empty());
    }

    #[test]
    fn test_view_resolves_to_base_table() {
        let mut conn = conn();
        let (result, fp) = with_footprint(&mut conn, |c| run_statement(c, "SELECT * FROM recent", &[]));
        result.unwrap();
        assert!(fp.reads.contains("visits"));
    }

    #[test]
    fn test_writes() {
        let mut conn = conn();
        let (result, fp) = with_footprint(&mut conn, |c| {
            c.execute_batch(
                "INSERT INTO patients (name) VALUES ('a');
                 UPDATE visits SET note = 'x' WHERE id = 1;
                 CREATE TABLE audit (entry TEXT);",
            )
        });
        result.unwrap();
        assert_eq!(fp.writes, set(&["audit", "patients", "visits"]));
    }

    #[test]
    fn test_authorizer_detached_after_failure() {
        let mut conn = conn();
        let (result, _) = with_footprint(&mut conn, |c| run_statement(c, "SELECT * FROM nope", &[]));
        assert!(result.is_err());

        // A later statement runs without the hook and records nothing.
        let (_, fp) = with_footprint(&mut conn, |_| Ok(()));
        assert_eq!(fp, Footprint::default());
    }
}
