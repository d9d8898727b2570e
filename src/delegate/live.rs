//! Live queries registered with one delegate.
//!
//! Each entry remembers the tables its query read when it last ran. A
//! change to any of them re-runs the query; a result equal to the last one
//! delivered is not sent again.

use rusqlite::Connection;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::observability::metrics::{record_active_subscriptions, record_refresh};
use crate::store::rows::{run_statement, ResultSet};
use crate::store::tables::{with_footprint, TableSet};

/// A refreshed result, tagged with the delegate's delivery sequence.
#[derive(Debug, Clone)]
pub(crate) struct LiveUpdate {
    pub seq: u64,
    pub result: Result<ResultSet>,
}

/// Outcome of registering a live query.
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub id: u64,
    /// Sequence of the initial result; later updates carry larger ones.
    pub seq: u64,
    pub initial: ResultSet,
}

#[derive(Debug)]
struct LiveEntry {
    sql: String,
    params: Vec<Value>,
    reads: TableSet,
    updates: mpsc::UnboundedSender<LiveUpdate>,
    last: ResultSet,
}

#[derive(Debug, Default)]
pub(crate) struct LiveRegistry {
    next_id: u64,
    /// Monotonic across every entry of this delegate
    seq: u64,
    entries: BTreeMap<u64, LiveEntry>,
}

impl LiveRegistry {
    /// Run `sql` once and keep it for refreshes.
    pub fn register(
        &mut self,
        conn: &mut Connection,
        sql: String,
        params: Vec<Value>,
        updates: mpsc::UnboundedSender<LiveUpdate>,
    ) -> Result<Registration> {
        let (result, footprint) = with_footprint(conn, |conn| run_statement(conn, &sql, &params));
        let initial = result?;

        self.next_id += 1;
        self.seq += 1;
        let registration = Registration {
            id: self.next_id,
            seq: self.seq,
            initial: initial.clone(),
        };

        self.entries.insert(
            registration.id,
            LiveEntry {
                sql,
                params,
                reads: footprint.reads,
                updates,
                last: initial,
            },
        );
        record_active_subscriptions(1);
        Ok(registration)
    }

    /// Forget a live query. Returns whether it was registered.
    pub fn remove(&mut self, id: u64) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed {
            record_active_subscriptions(-1);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-run live queries that read any of `changed` (all when `None`).
    ///
    /// Returns the number of new results delivered. Queries that now fail
    /// receive the error once and are dropped; so are queries whose
    /// receiver went away.
    pub fn refresh(&mut self, conn: &mut Connection, changed: Option<&TableSet>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (&id, entry) in &mut self.entries {
            if entry.updates.is_closed() {
                dead.push(id);
                continue;
            }
            if let Some(changed) = changed {
                if entry.reads.is_disjoint(changed) {
                    continue;
                }
            }

            let (result, footprint) =
                with_footprint(conn, |conn| run_statement(conn, &entry.sql, &entry.params));
            match result {
                Ok(result) => {
                    entry.reads = footprint.reads;
                    if result == entry.last {
                        continue;
                    }
                    self.seq += 1;
                    entry.last = result.clone();
                    let update = LiveUpdate {
                        seq: self.seq,
                        result: Ok(result),
                    };
                    if entry.updates.send(update).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(id);
                    }
                }
                Err(e) => {
                    tracing::warn!(subscription = id, error = %e, "Live query failed, dropping it");
                    self.seq += 1;
                    let _ = entry.updates.send(LiveUpdate {
                        seq: self.seq,
                        result: Err(Error::Subscription(e.to_string())),
                    });
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.remove(id);
        }
        if delivered > 0 {
            record_refresh(delivered);
        }
        delivered
    }

    /// Drop every live query. Receivers observe their channel closing.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        if dropped > 0 {
            record_active_subscriptions(-(dropped as i64));
        }
        dropped
    }
}
