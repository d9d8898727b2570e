//! Notification bus for store changes and leadership hand-off.
//!
//! - tokio::sync::broadcast for pub-sub notifications
//! - Lightweight notifications carry table names; delegates re-run the live
//!   queries that read those tables

use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::store::tables::TableSet;

/// Event published to every delegate attached to a store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A write committed and touched `tables`.
    Changed {
        /// Delegate that committed the write
        origin: Arc<str>,
        tables: Arc<TableSet>,
    },
    /// The leader gave up its lease; followers may contend immediately.
    LeaderReleased { holder: Arc<str> },
}

/// Notification bus shared by the delegates of one store.
///
/// Delegates that fall behind lose notifications and must treat every
/// table as changed.
#[derive(Clone, Debug)]
pub struct NotificationBus {
    sender: Sender<StoreEvent>,
}

impl NotificationBus {
    /// Create a new notification bus with the given capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of buffered notifications.
    ///   Older notifications are dropped if consumers fall behind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to notifications.
    ///
    /// Returns a receiver that will receive all future notifications.
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    ///
    /// Returns the number of receivers that received it.
    pub fn notify(&self, event: StoreEvent) -> usize {
        // send() returns an error if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
