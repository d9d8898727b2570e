//! Execution delegate: the isolated context that owns a store connection.
//!
//! Each delegate runs on a dedicated thread holding the only SQLite
//! connection of its context. Everything else reaches it through a bounded
//! inbox of [`Command`]s with oneshot replies, so requests from one caller
//! are processed in the order they were issued.
//!
//! Two background tasks feed the inbox besides callers:
//! - a relay turning store notifications into refresh commands
//! - a ticker driving lease renewal

mod live;
mod worker;

pub(crate) use live::{LiveUpdate, Registration};

use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectOptions;
use crate::error::{Error, Result};
use crate::generate_delegate_id;
use crate::leader::{Coordinator, LeaderStatus};
use crate::notify::StoreEvent;
use crate::store::rows::ResultSet;
use crate::store::tables::TableSet;
use crate::store::StoreHandle;

use worker::Worker;

type Reply<T> = oneshot::Sender<Result<T>>;

/// A write routed to the leader.
#[derive(Debug)]
pub(crate) enum WriteOp {
    /// One statement with bound parameters.
    Statement { sql: String, params: Vec<Value> },
    /// One or more statements, no parameters.
    Batch { sql: String },
    /// Bring the schema up to date; `affected_rows` is 1 when applied.
    Migrate,
}

/// Requests accepted by a delegate.
pub(crate) enum Command {
    Query {
        sql: String,
        params: Vec<Value>,
        reply: Reply<ResultSet>,
    },
    Exec {
        sql: String,
        reply: Reply<()>,
    },
    Migrate {
        reply: Reply<bool>,
    },
    /// A write a follower handed to the leader.
    Forwarded {
        op: WriteOp,
        reply: Reply<ResultSet>,
    },
    Subscribe {
        sql: String,
        params: Vec<Value>,
        updates: mpsc::UnboundedSender<LiveUpdate>,
        reply: Reply<Registration>,
    },
    Unsubscribe {
        id: u64,
    },
    /// Re-run live queries reading `tables`, or all of them when `None`.
    Invalidate {
        tables: Option<Arc<TableSet>>,
    },
    LeaseTick,
    Shutdown,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Exec { .. } => "exec",
            Self::Migrate { .. } => "migrate",
            Self::Forwarded { .. } => "forwarded",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Invalidate { .. } => "invalidate",
            Self::LeaseTick => "lease_tick",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Cloneable handle for sending requests to a delegate.
#[derive(Clone, Debug)]
pub struct DelegateHandle {
    id: Arc<str>,
    inbox: mpsc::Sender<Command>,
    status: watch::Receiver<LeaderStatus>,
}

impl DelegateHandle {
    /// Delegate identifier (UUIDv7).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current leadership status.
    pub fn status(&self) -> LeaderStatus {
        *self.status.borrow()
    }

    /// Receiver observing leadership changes.
    pub fn watch_status(&self) -> watch::Receiver<LeaderStatus> {
        self.status.clone()
    }

    /// Whether the delegate has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(build(reply))
            .await
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Run one statement. Writes are routed to the leader.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Result<ResultSet> {
        self.request(|reply| Command::Query {
            sql: sql.to_string(),
            params,
            reply,
        })
        .await
    }

    /// Run a batch of statements as a write.
    pub async fn exec(&self, sql: &str) -> Result<()> {
        self.request(|reply| Command::Exec {
            sql: sql.to_string(),
            reply,
        })
        .await
    }

    /// Bring the schema up to date. Returns whether anything was applied.
    pub async fn migrate(&self) -> Result<bool> {
        self.request(|reply| Command::Migrate { reply }).await
    }

    pub(crate) async fn subscribe(
        &self,
        sql: &str,
        params: Vec<Value>,
        updates: mpsc::UnboundedSender<LiveUpdate>,
    ) -> Result<Registration> {
        self.request(|reply| Command::Subscribe {
            sql: sql.to_string(),
            params,
            updates,
            reply,
        })
        .await
        .map_err(|e| match e {
            Error::Closed => Error::Subscription("delegate is unreachable".into()),
            other => other,
        })
    }

    pub(crate) async fn unsubscribe(&self, id: u64) {
        // A closed delegate already dropped every subscription.
        let _ = self.inbox.send(Command::Unsubscribe { id }).await;
    }

    pub(crate) fn try_unsubscribe(&self, id: u64) {
        let _ = self.inbox.try_send(Command::Unsubscribe { id });
    }

    /// Ask the delegate to stop. Pending requests are rejected.
    pub async fn shutdown(&self) {
        let _ = self.inbox.send(Command::Shutdown).await;
    }
}

/// An execution delegate and its thread.
pub struct Delegate {
    handle: DelegateHandle,
    thread: Option<thread::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Delegate {
    /// Start a delegate attached to `store`.
    ///
    /// Opens the store, joins leader election and returns once the delegate
    /// is ready to serve requests.
    pub async fn spawn(store: &StoreHandle, options: &ConnectOptions) -> Result<Self> {
        let id: Arc<str> = generate_delegate_id().into();
        let coordinator = Coordinator::for_namespace(&store.namespace(), options.notify_channel_size);

        let (inbox_tx, inbox_rx) = mpsc::channel(options.request_channel_size.max(1));
        let (status_tx, status_rx) = watch::channel(LeaderStatus::Follower);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        // Subscribe before anything can commit so no change is missed.
        let events = coordinator.bus().subscribe();
        coordinator.attach(Arc::clone(&id), inbox_tx.clone());

        let spawned = {
            let id = Arc::clone(&id);
            let store = store.clone();
            let options = options.clone();
            let coordinator = Arc::clone(&coordinator);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("eddy-{}", store.name()))
                .spawn(move || {
                    match Worker::open(id, store, options, coordinator, inbox_rx, status_tx, cancel) {
                        Ok(mut worker) => {
                            worker.renew_lease();
                            let _ = ready_tx.send(Ok(()));
                            worker.run();
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })
        };

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                coordinator.detach(&id);
                return Err(Error::Initialization(format!(
                    "failed to spawn delegate thread: {e}"
                )));
            }
        };

        let startup = match ready_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Initialization(
                "delegate thread exited during startup".into(),
            )),
        };
        if let Err(e) = startup {
            coordinator.detach(&id);
            return Err(e);
        }

        tokio::spawn(relay_events(
            Arc::clone(&id),
            events,
            inbox_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(renew_periodically(
            options.lease_renew_interval,
            inbox_tx.clone(),
            cancel.clone(),
        ));

        let handle = DelegateHandle {
            id,
            inbox: inbox_tx,
            status: status_rx,
        };

        tracing::info!(
            delegate = %handle.id,
            store = %store.name(),
            status = ?handle.status(),
            "Delegate attached"
        );

        Ok(Self {
            handle,
            thread: Some(thread),
            cancel,
        })
    }

    /// Get a handle for sending requests.
    pub fn handle(&self) -> DelegateHandle {
        self.handle.clone()
    }

    /// Stop the delegate and wait for its thread to exit.
    pub async fn terminate(mut self) {
        self.cancel.cancel();
        self.handle.shutdown().await;

        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::error!(delegate = %self.handle.id, "Delegate thread panicked");
            }
        }
    }
}

impl Drop for Delegate {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.cancel.cancel();

        if let Err(mpsc::error::TrySendError::Full(command)) =
            self.handle.inbox.try_send(Command::Shutdown)
        {
            // Outside any runtime, so blocking here cannot stall an executor.
            let inbox = self.handle.inbox.clone();
            let _ = thread::Builder::new()
                .name("eddy-shutdown".into())
                .spawn(move || {
                    let _ = inbox.blocking_send(command);
                });
        }
    }
}

/// Turn store notifications into commands for one delegate.
async fn relay_events(
    id: Arc<str>,
    mut events: broadcast::Receiver<StoreEvent>,
    inbox: mpsc::Sender<Command>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let command = match event {
            Ok(StoreEvent::Changed { origin, tables }) if origin != id => Command::Invalidate {
                tables: Some(tables),
            },
            Ok(StoreEvent::LeaderReleased { holder }) if holder != id => Command::LeaseTick,
            Ok(_) => continue,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(delegate = %id, missed, "Notification bus lagged, refreshing every live query");
                Command::Invalidate { tables: None }
            }
            Err(RecvError::Closed) => break,
        };

        if inbox.send(command).await.is_err() {
            break;
        }
    }
}

/// Drive lease renewal for one delegate.
async fn renew_periodically(
    period: Duration,
    inbox: mpsc::Sender<Command>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already contended.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if inbox.send(Command::LeaseTick).await.is_err() {
                    break;
                }
            }
        }
    }
}
