//! Connection facade.
//!
//! A [`Connection`] is the one object application code holds. Every call
//! crosses into the connection's delegate by message passing; a clone of a
//! connection shares the same delegate.

mod init;

pub use init::{get_connection, Connections};

use futures::Stream;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::delegate::{Delegate, DelegateHandle};
use crate::error::{Error, Result};
use crate::leader::{LeaderStatus, LeadershipEvent};
use crate::live::LiveQuery;
use crate::store::rows::ResultSet;
use crate::store::StoreHandle;

/// Tuning for the delegates a connection starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Capacity of each delegate's request inbox.
    pub request_channel_size: usize,
    /// Capacity of the per-store notification bus.
    pub notify_channel_size: usize,
    /// How long a granted lease stays valid.
    pub lease_duration: Duration,
    /// How often a delegate renews or contends for the lease.
    pub lease_renew_interval: Duration,
    /// SQLite busy timeout.
    pub busy_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ConnectOptions {
    fn from(config: &Config) -> Self {
        Self {
            request_channel_size: config.request_channel_size,
            notify_channel_size: config.notify_channel_size,
            lease_duration: config.lease_duration(),
            lease_renew_interval: config.lease_renew_interval(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }
}

/// A connection to a store through its own delegate.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    store: StoreHandle,
    handle: DelegateHandle,
    /// Taken by `terminate`; dropping it stops the delegate as well.
    delegate: Mutex<Option<Delegate>>,
}

impl Connection {
    /// Start a delegate for `store` and bring the schema up to date.
    ///
    /// Prefer [`Connections::get`] or [`get_connection`], which memoize the
    /// result. Every failure is reported as [`Error::Initialization`].
    pub async fn open(store: StoreHandle, options: ConnectOptions) -> Result<Self> {
        let delegate = Delegate::spawn(&store, &options)
            .await
            .map_err(into_initialization)?;
        let handle = delegate.handle();

        match handle.migrate().await {
            Ok(applied) => {
                tracing::info!(
                    store = %store.name(),
                    delegate = %handle.id(),
                    status = ?handle.status(),
                    migrated = applied,
                    "Connection ready"
                );
            }
            Err(e) => {
                delegate.terminate().await;
                return Err(Error::Initialization(format!("schema migration failed: {e}")));
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                handle,
                delegate: Mutex::new(Some(delegate)),
            }),
        })
    }

    /// Run one statement and return its rows.
    ///
    /// Parameters bind positionally to `$1`, `?1` or `?` placeholders.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.inner.handle.query(sql, params.to_vec()).await
    }

    /// Run one or more statements that return no rows.
    pub async fn exec(&self, sql: &str) -> Result<()> {
        self.inner.handle.exec(sql).await
    }

    /// Register a live query.
    ///
    /// Returns the initial result with the subscription handle. `on_update`
    /// then receives every newer result, or the error that ended the query.
    pub async fn subscribe<F>(&self, sql: &str, params: &[Value], on_update: F) -> Result<LiveQuery>
    where
        F: FnMut(Result<ResultSet>) + Send + 'static,
    {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let registration = self
            .inner
            .handle
            .subscribe(sql, params.to_vec(), updates_tx)
            .await?;

        Ok(LiveQuery::start(
            self.inner.handle.clone(),
            registration,
            updates_rx,
            Box::new(on_update),
        ))
    }

    /// Current leadership status of this connection's delegate.
    pub fn leader_status(&self) -> LeaderStatus {
        self.inner.handle.status()
    }

    /// Stream of leadership flips, starting after the current status.
    pub fn leadership_changes(&self) -> impl Stream<Item = LeadershipEvent> + Send + 'static {
        let delegate_id = self.delegate_id().to_string();
        WatchStream::from_changes(self.inner.handle.watch_status()).map(move |status| {
            LeadershipEvent {
                delegate_id: delegate_id.clone(),
                status,
            }
        })
    }

    /// Invoke `callback` whenever local leadership flips.
    ///
    /// Rapid flips may coalesce, but the last status observed is always the
    /// current one. The callback stops when the returned guard is dropped.
    pub fn on_leader_change<F>(&self, mut callback: F) -> LeaderWatch
    where
        F: FnMut(LeadershipEvent) + Send + 'static,
    {
        let delegate_id = self.delegate_id().to_string();
        let mut status = self.inner.handle.watch_status();
        let mut last = *status.borrow_and_update();

        let task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                if current == last {
                    continue;
                }
                last = current;
                callback(LeadershipEvent {
                    delegate_id: delegate_id.clone(),
                    status: current,
                });
            }
        });

        LeaderWatch { task }
    }

    /// Identifier of this connection's delegate.
    pub fn delegate_id(&self) -> &str {
        self.inner.handle.id()
    }

    /// Store this connection is attached to.
    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    /// Whether both values are the same connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the delegate has stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.handle.is_closed()
    }

    /// Stop the delegate, releasing leadership if held.
    ///
    /// Later calls on any clone fail with [`Error::Closed`]; live queries
    /// receive a subscription error.
    pub async fn terminate(&self) {
        let delegate = self
            .inner
            .delegate
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(delegate) = delegate {
            delegate.terminate().await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("store", &self.inner.store.name())
            .field("delegate", &self.delegate_id())
            .field("status", &self.leader_status())
            .finish()
    }
}

/// Guard for an [`Connection::on_leader_change`] callback.
#[derive(Debug)]
pub struct LeaderWatch {
    task: JoinHandle<()>,
}

impl LeaderWatch {
    /// Stop invoking the callback.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for LeaderWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn into_initialization(err: Error) -> Error {
    match err {
        Error::Initialization(_) => err,
        other => Error::Initialization(other.to_string()),
    }
}
