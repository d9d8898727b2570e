//! Memoized connection initialization.
//!
//! A [`Connections`] registry holds at most one connection per store. The
//! first caller starts initialization; callers arriving while it runs await
//! the same shared future and see the same outcome. A failed attempt is
//! forgotten so the next call starts over.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use super::{ConnectOptions, Connection};
use crate::error::Result;
use crate::store::StoreHandle;

type Initialization = Shared<BoxFuture<'static, Result<Connection>>>;

enum Slot {
    Initializing {
        /// Distinguishes this attempt from later retries
        generation: u64,
        future: Initialization,
    },
    Ready(Connection),
}

/// Process-wide registry used by [`get_connection`].
static GLOBAL: OnceLock<Connections> = OnceLock::new();

/// Get the memoized connection for `store`, creating it on first use.
///
/// Uses default [`ConnectOptions`].
pub async fn get_connection(store: &StoreHandle) -> Result<Connection> {
    GLOBAL
        .get_or_init(|| Connections::new(ConnectOptions::default()))
        .get(store)
        .await
}

/// Memoized connections, one per store.
///
/// Separate registries in one process behave like separate pages sharing
/// the same stores: each gets its own delegate, and the delegates elect one
/// leader per store.
pub struct Connections {
    options: ConnectOptions,
    slots: Mutex<HashMap<PathBuf, Slot>>,
    next_generation: AtomicU64,
    initializations: AtomicUsize,
}

impl Connections {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            initializations: AtomicUsize::new(0),
        }
    }

    /// Options used for new connections.
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Get the connection for `store`, initializing it if needed.
    ///
    /// A connection that was terminated is replaced on the next call.
    pub async fn get(&self, store: &StoreHandle) -> Result<Connection> {
        let key = store.path().to_path_buf();

        let (generation, future) = {
            let mut slots = self.lock_slots();
            match slots.get(&key) {
                Some(Slot::Ready(connection)) if !connection.is_closed() => {
                    return Ok(connection.clone());
                }
                Some(Slot::Initializing { generation, future }) => (*generation, future.clone()),
                _ => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    self.initializations.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(store = %store.name(), generation, "Initializing connection");

                    let future = Connection::open(store.clone(), self.options.clone())
                        .boxed()
                        .shared();
                    slots.insert(
                        key.clone(),
                        Slot::Initializing {
                            generation,
                            future: future.clone(),
                        },
                    );
                    (generation, future)
                }
            }
        };

        let outcome = future.await;

        let mut slots = self.lock_slots();
        let current = matches!(
            slots.get(&key),
            Some(Slot::Initializing { generation: g, .. }) if *g == generation
        );
        if current {
            match &outcome {
                Ok(connection) => {
                    slots.insert(key, Slot::Ready(connection.clone()));
                }
                Err(e) => {
                    tracing::warn!(store = %store.name(), error = %e, "Connection initialization failed");
                    slots.remove(&key);
                }
            }
        }

        outcome
    }

    /// Number of initializations started so far.
    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::Relaxed)
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for Connections {
    fn default() -> Self {
        Self::new(ConnectOptions::default())
    }
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("options", &self.options)
            .field("initializations", &self.initializations())
            .finish_non_exhaustive()
    }
}
