//! Client-side handles for live queries.
//!
//! The delegate pushes refreshed results into a per-subscription channel.
//! A dispatcher task drains it and invokes the callback, skipping anything
//! not newer than what it already delivered. The callback lives in a slot
//! guarded by an async mutex held for the whole invocation; cancelling
//! empties the slot under the same mutex, so no delivery can start or still
//! be running once `cancel()` returns.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::delegate::{DelegateHandle, LiveUpdate, Registration};
use crate::error::{Error, Result};
use crate::store::rows::ResultSet;

/// Callback receiving refreshed results, or the error that ended the query.
pub type UpdateCallback = Box<dyn FnMut(Result<ResultSet>) + Send + 'static>;

type Slot = Arc<Mutex<Option<UpdateCallback>>>;

/// A live query: its first snapshot and the handle that keeps it running.
#[derive(Debug)]
pub struct LiveQuery {
    /// Result at registration time.
    pub initial: ResultSet,
    pub subscription: Subscription,
}

/// Handle to a registered live query.
///
/// Dropping it unsubscribes on a best-effort basis; call [`cancel`] to be
/// sure no further update is delivered.
///
/// [`cancel`]: Subscription::cancel
pub struct Subscription {
    id: u64,
    delegate: DelegateHandle,
    slot: Slot,
    dispatcher: JoinHandle<()>,
}

impl LiveQuery {
    pub(crate) fn start(
        delegate: DelegateHandle,
        registration: Registration,
        updates: mpsc::UnboundedReceiver<LiveUpdate>,
        on_update: UpdateCallback,
    ) -> Self {
        let slot: Slot = Arc::new(Mutex::new(Some(on_update)));
        let dispatcher = tokio::spawn(dispatch(
            registration.id,
            registration.seq,
            updates,
            Arc::clone(&slot),
        ));

        Self {
            initial: registration.initial,
            subscription: Subscription {
                id: registration.id,
                delegate,
                slot,
                dispatcher,
            },
        }
    }
}

impl Subscription {
    /// Identifier of the live query within its delegate.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether updates can still be delivered.
    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Stop the live query.
    ///
    /// Safe to call repeatedly. Waits for a callback already in progress to
    /// return; after that the callback is never invoked again.
    pub async fn cancel(&self) {
        let callback = self.slot.lock().await.take();
        self.dispatcher.abort();
        if callback.is_some() {
            self.delegate.unsubscribe(self.id).await;
            tracing::debug!(subscription = self.id, delegate = %self.delegate.id(), "Live query cancelled");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("delegate", &self.delegate.id())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.abort();
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.take();
        }
        self.delegate.try_unsubscribe(self.id);
    }
}

async fn dispatch(
    id: u64,
    mut last_seq: u64,
    mut updates: mpsc::UnboundedReceiver<LiveUpdate>,
    slot: Slot,
) {
    while let Some(update) = updates.recv().await {
        if update.seq <= last_seq {
            tracing::trace!(subscription = id, seq = update.seq, last_seq, "Dropping stale update");
            continue;
        }
        last_seq = update.seq;

        let failed = update.result.is_err();
        let mut callback = slot.lock().await;
        let Some(on_update) = callback.as_mut() else {
            return;
        };
        on_update(update.result);
        if failed {
            callback.take();
            return;
        }
    }

    // The delegate dropped the query without an error: it has stopped.
    if let Some(mut on_update) = slot.lock().await.take() {
        tracing::debug!(subscription = id, "Delegate went away under a live query");
        on_update(Err(Error::Subscription("delegate is unreachable".into())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<Result<ResultSet>>>>, Slot) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: UpdateCallback = Box::new(move |r: Result<ResultSet>| {
            sink.lock().unwrap().push(r);
        });
        (seen, Arc::new(Mutex::new(Some(callback))))
    }

    fn rows(n: usize) -> ResultSet {
        ResultSet {
            affected_rows: n,
            ..ResultSet::default()
        }
    }

    #[tokio::test]
    async fn test_stale_updates_are_dropped() {
        let (seen, slot) = recorder();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(dispatch(1, 5, rx, Arc::clone(&slot)));

        for (seq, n) in [(4, 0), (6, 1), (6, 2), (8, 3), (7, 4)] {
            tx.send(LiveUpdate {
                seq,
                result: Ok(rows(n)),
            })
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let seen = seen.lock().unwrap();
        let delivered: Vec<usize> = seen
            .iter()
            .map(|r| r.as_ref().map(|rs| rs.affected_rows).unwrap_or(usize::MAX))
            .collect();
        assert_eq!(delivered, vec![1, 3, usize::MAX]);
        assert!(matches!(seen.last(), Some(Err(Error::Subscription(_)))));
    }

    #[tokio::test]
    async fn test_error_is_delivered_once() {
        let (seen, slot) = recorder();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(dispatch(1, 0, rx, Arc::clone(&slot)));

        tx.send(LiveUpdate {
            seq: 1,
            result: Err(Error::Subscription("gone".into())),
        })
        .unwrap();
        task.await.unwrap();
        drop(tx);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(slot.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_emptied_slot_stops_delivery() {
        let (seen, slot) = recorder();
        let (tx, rx) = mpsc::unbounded_channel();
        slot.lock().await.take();
        let task = tokio::spawn(dispatch(1, 0, rx, Arc::clone(&slot)));

        tx.send(LiveUpdate {
            seq: 1,
            result: Ok(rows(1)),
        })
        .unwrap();
        task.await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }
}
