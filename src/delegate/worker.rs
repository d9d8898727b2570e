//! The delegate thread: command loop, write routing and lease upkeep.

use rusqlite::Connection;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::live::{LiveRegistry, LiveUpdate, Registration};
use super::{Command, WriteOp};
use crate::connection::ConnectOptions;
use crate::error::{Error, Result};
use crate::leader::{lease, Coordinator, LeaderStatus};
use crate::notify::StoreEvent;
use crate::now_millis;
use crate::observability::metrics::{record_leadership, record_query};
use crate::store::rows::{run_prepared, run_statement, ResultSet};
use crate::store::schema::{self, SCHEMA_VERSION};
use crate::store::tables::{with_footprint, TableSet};
use crate::store::StoreHandle;

pub(super) struct Worker {
    id: Arc<str>,
    store: StoreHandle,
    options: ConnectOptions,
    conn: Connection,
    lease_conn: Connection,
    coordinator: Arc<Coordinator>,
    live: LiveRegistry,
    status: watch::Sender<LeaderStatus>,
    inbox: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    /// Expiry of the last lease we were granted
    lease_expires_at: i64,
    /// Last `PRAGMA data_version` observed on `conn`
    data_version: i64,
}

impl Worker {
    /// Open the store and lease connections.
    pub(super) fn open(
        id: Arc<str>,
        store: StoreHandle,
        options: ConnectOptions,
        coordinator: Arc<Coordinator>,
        inbox: mpsc::Receiver<Command>,
        status: watch::Sender<LeaderStatus>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if let Some(dir) = store.path().parent() {
            fs::create_dir_all(dir).map_err(|e| {
                Error::Initialization(format!(
                    "failed to create data directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let open = |path: &std::path::Path| -> Result<Connection> {
            let conn = Connection::open(path).map_err(|e| {
                Error::Initialization(format!("failed to open {}: {e}", path.display()))
            })?;
            schema::apply_pragmas(&conn, options.busy_timeout)
                .map_err(|e| Error::Initialization(format!("failed to configure store: {e}")))?;
            Ok(conn)
        };

        let conn = open(store.path())?;
        let lease_conn = open(store.lease_path())?;
        lease::ensure_lease_table(&lease_conn)
            .map_err(|e| Error::Initialization(format!("failed to prepare lease: {e}")))?;
        let data_version = schema::data_version(&conn)
            .map_err(|e| Error::Initialization(format!("failed to read store: {e}")))?;

        Ok(Self {
            id,
            store,
            options,
            conn,
            lease_conn,
            coordinator,
            live: LiveRegistry::default(),
            status,
            inbox,
            cancel,
            lease_expires_at: 0,
            data_version,
        })
    }

    /// Process commands until shutdown.
    pub(super) fn run(mut self) {
        tracing::debug!(delegate = %self.id, store = %self.store.name(), "Delegate thread running");

        while let Some(command) = self.inbox.blocking_recv() {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
            if self.cancel.is_cancelled() {
                break;
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Query { sql, params, reply } => {
                let _ = reply.send(self.query(&sql, params));
            }
            Command::Exec { sql, reply } => {
                let _ = reply.send(self.write(WriteOp::Batch { sql }).map(|_| ()));
            }
            Command::Migrate { reply } => {
                let _ = reply.send(self.migrate());
            }
            Command::Forwarded { op, reply } => {
                let _ = reply.send(self.execute_write(op));
            }
            Command::Subscribe {
                sql,
                params,
                updates,
                reply,
            } => {
                let _ = reply.send(self.subscribe(sql, params, updates));
            }
            Command::Unsubscribe { id } => {
                if self.live.remove(id) {
                    tracing::debug!(delegate = %self.id, subscription = id, "Live query removed");
                }
            }
            Command::Invalidate { tables } => self.invalidate(tables.as_deref()),
            Command::LeaseTick => {
                self.renew_lease();
                self.poll_external_changes();
            }
            Command::Shutdown => {}
        }
    }

    fn is_leader(&self) -> bool {
        self.status.borrow().is_leader()
    }

    fn query(&mut self, sql: &str, params: Vec<Value>) -> Result<ResultSet> {
        let start = Instant::now();
        {
            let mut stmt = self.conn.prepare(sql)?;
            if stmt.readonly() {
                let result = run_prepared(&mut stmt, &params)?;
                record_query("read", start.elapsed().as_secs_f64());
                return Ok(result);
            }
        }

        self.write(WriteOp::Statement {
            sql: sql.to_string(),
            params,
        })
    }

    fn migrate(&mut self) -> Result<bool> {
        // Followers whose store is already current need no leader at all.
        if schema::current_version(&self.conn)? >= SCHEMA_VERSION {
            return Ok(false);
        }
        Ok(self.write(WriteOp::Migrate)?.affected_rows > 0)
    }

    fn subscribe(
        &mut self,
        sql: String,
        params: Vec<Value>,
        updates: mpsc::UnboundedSender<LiveUpdate>,
    ) -> Result<Registration> {
        if !self.conn.prepare(&sql)?.readonly() {
            return Err(Error::Query(
                "live queries must be read-only statements".into(),
            ));
        }

        let registration = self.live.register(&mut self.conn, sql, params, updates)?;
        tracing::debug!(
            delegate = %self.id,
            subscription = registration.id,
            rows = registration.initial.len(),
            "Live query registered"
        );
        Ok(registration)
    }

    /// Perform a write here if we lead, otherwise through the leader.
    fn write(&mut self, op: WriteOp) -> Result<ResultSet> {
        match self.route_write()? {
            None => self.execute_write(op),
            Some(leader) => self.forward(&leader, op),
        }
    }

    /// `None` when this delegate should write itself.
    fn route_write(&mut self) -> Result<Option<mpsc::Sender<Command>>> {
        if self.is_leader() {
            return Ok(None);
        }

        let current = lease::read_lease(&self.lease_conn)
            .map_err(|e| Error::LeadershipLost(format!("failed to read lease: {e}")))?;

        match current {
            Some(held) if held.is_live(now_millis()) && held.holder != *self.id => self
                .coordinator
                .member(&held.holder)
                .map(Some)
                .ok_or_else(|| {
                    Error::LeadershipLost(format!(
                        "leader {} is not reachable from this process",
                        held.holder
                    ))
                }),
            _ => {
                // Vacant, expired or ours: contend now rather than at the next tick.
                self.renew_lease();
                if self.is_leader() {
                    Ok(None)
                } else {
                    Err(Error::LeadershipLost("no leader is available".into()))
                }
            }
        }
    }

    /// Hand a write to the leader and wait for its outcome.
    ///
    /// Blocking here keeps this delegate's requests in issuance order.
    fn forward(&mut self, leader: &mpsc::Sender<Command>, op: WriteOp) -> Result<ResultSet> {
        tracing::debug!(delegate = %self.id, ?op, "Forwarding write to leader");

        let (reply, response) = oneshot::channel();
        leader
            .blocking_send(Command::Forwarded { op, reply })
            .map_err(|_| Error::LeadershipLost("leader terminated".into()))?;
        response
            .blocking_recv()
            .map_err(|_| Error::LeadershipLost("leader terminated before replying".into()))?
    }

    /// Commit a write against the store. Leader only.
    fn execute_write(&mut self, op: WriteOp) -> Result<ResultSet> {
        self.ensure_lease()?;

        let start = Instant::now();
        let (result, footprint) = with_footprint(&mut self.conn, |conn| match &op {
            WriteOp::Statement { sql, params } => run_statement(conn, sql, params),
            WriteOp::Batch { sql } => conn.execute_batch(sql).map(|()| ResultSet::default()),
            WriteOp::Migrate => schema::migrate(conn).map(|applied| ResultSet {
                affected_rows: usize::from(applied),
                ..ResultSet::default()
            }),
        });
        record_query("write", start.elapsed().as_secs_f64());

        // A failed batch may still have committed its leading statements.
        if !footprint.writes.is_empty() {
            self.publish(footprint.writes);
        }

        Ok(result?)
    }

    /// Fence a write: our lease must still be live right now.
    fn ensure_lease(&mut self) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::LeadershipLost(format!(
                "delegate {} is not the leader",
                self.id
            )));
        }

        let held = lease::holds(&self.lease_conn, &self.id, now_millis())
            .map_err(|e| Error::LeadershipLost(format!("failed to check lease: {e}")))?;
        if !held {
            self.set_status(LeaderStatus::Follower);
            return Err(Error::LeadershipLost(
                "lease expired or was taken over".into(),
            ));
        }
        Ok(())
    }

    /// Refresh local live queries, then tell the other delegates.
    fn publish(&mut self, tables: TableSet) {
        let tables = Arc::new(tables);
        self.refresh(Some(tables.as_ref()));
        self.coordinator.bus().notify(StoreEvent::Changed {
            origin: Arc::clone(&self.id),
            tables,
        });
    }

    fn refresh(&mut self, tables: Option<&TableSet>) {
        let delivered = self.live.refresh(&mut self.conn, tables);
        if delivered > 0 {
            tracing::debug!(delegate = %self.id, delivered, ?tables, "Live queries refreshed");
        }
    }

    /// Refresh after a change another delegate announced.
    ///
    /// Only a full refresh may advance `data_version`: the version also
    /// counts foreign commits to tables a scoped refresh skipped, and those
    /// are left for the next tick to find.
    fn invalidate(&mut self, tables: Option<&TableSet>) {
        if tables.is_some() {
            self.refresh(tables);
            return;
        }

        let version = schema::data_version(&self.conn).ok();
        self.refresh(None);
        if let Some(version) = version {
            self.data_version = version;
        }
    }

    /// Catch commits made by connections we get no notifications from.
    fn poll_external_changes(&mut self) {
        match schema::data_version(&self.conn) {
            Ok(version) if version != self.data_version => {
                self.data_version = version;
                if !self.live.is_empty() {
                    tracing::debug!(delegate = %self.id, "Store changed externally");
                    self.refresh(None);
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(delegate = %self.id, error = %e, "Failed to read data version");
            }
        }
    }

    /// Acquire or renew the lease, updating our status.
    pub(super) fn renew_lease(&mut self) {
        let now = now_millis();
        let duration = i64::try_from(self.options.lease_duration.as_millis()).unwrap_or(i64::MAX / 2);

        match lease::try_acquire(&mut self.lease_conn, &self.id, now, duration) {
            Ok(true) => {
                self.lease_expires_at = now + duration;
                self.set_status(LeaderStatus::Leader);
            }
            Ok(false) => self.set_status(LeaderStatus::Follower),
            Err(e) => {
                tracing::warn!(delegate = %self.id, error = %e, "Lease renewal failed");
                if self.is_leader() && now >= self.lease_expires_at {
                    self.set_status(LeaderStatus::Follower);
                }
            }
        }
    }

    fn set_status(&mut self, status: LeaderStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        if changed {
            tracing::info!(
                delegate = %self.id,
                store = %self.store.name(),
                ?status,
                "Leadership changed"
            );
            record_leadership(&self.id, status.is_leader());
        }
    }

    fn shutdown(mut self) {
        self.coordinator.detach(&self.id);
        self.inbox.close();
        while let Ok(command) = self.inbox.try_recv() {
            reject(command);
        }

        if self.is_leader() {
            if let Err(e) = lease::release(&self.lease_conn, &self.id) {
                tracing::warn!(delegate = %self.id, error = %e, "Failed to release lease");
            }
            self.set_status(LeaderStatus::Follower);
            self.coordinator.bus().notify(StoreEvent::LeaderReleased {
                holder: Arc::clone(&self.id),
            });
        }

        let dropped = self.live.clear();
        tracing::info!(
            delegate = %self.id,
            store = %self.store.name(),
            dropped_subscriptions = dropped,
            "Delegate stopped"
        );
    }
}

/// Fail a request that arrived after shutdown began.
fn reject(command: Command) {
    match command {
        Command::Query { reply, .. } => {
            let _ = reply.send(Err(Error::Closed));
        }
        Command::Exec { reply, .. } => {
            let _ = reply.send(Err(Error::Closed));
        }
        Command::Migrate { reply } => {
            let _ = reply.send(Err(Error::Closed));
        }
        Command::Forwarded { reply, .. } => {
            let _ = reply.send(Err(Error::LeadershipLost("leader terminated".into())));
        }
        Command::Subscribe { reply, .. } => {
            let _ = reply.send(Err(Error::Closed));
        }
        Command::Unsubscribe { .. }
        | Command::Invalidate { .. }
        | Command::LeaseTick
        | Command::Shutdown => {}
    }
}
