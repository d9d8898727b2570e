//! Leader election among delegates sharing a store.
//!
//! Mutual exclusion on direct writes comes from the [`lease`] row, which
//! works across processes. Within a process, delegates attached to the same
//! namespace also share a [`Coordinator`], through which followers forward
//! writes to the leader and learn about changes it commits.

pub mod lease;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;

use crate::delegate::Command;
use crate::notify::NotificationBus;

/// Leadership status of a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaderStatus {
    /// Holds the lease; performs writes against the store.
    Leader,
    /// Forwards writes to the leader.
    Follower,
}

impl LeaderStatus {
    pub fn is_leader(self) -> bool {
        self == Self::Leader
    }
}

/// Local leadership flipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipEvent {
    pub delegate_id: String,
    pub status: LeaderStatus,
}

/// Process-wide coordinators, one per namespace, held weakly so a namespace
/// with no attached delegates is dropped.
static COORDINATORS: OnceLock<Mutex<HashMap<String, Weak<Coordinator>>>> = OnceLock::new();

/// Per-namespace meeting point for delegates in this process.
#[derive(Debug)]
pub struct Coordinator {
    namespace: String,
    bus: NotificationBus,
    /// Inboxes of attached delegates, keyed by delegate id
    members: Mutex<HashMap<Arc<str>, mpsc::Sender<Command>>>,
}

impl Coordinator {
    /// Get (or create) the coordinator for `namespace`.
    ///
    /// `bus_capacity` only applies when the coordinator is created.
    pub fn for_namespace(namespace: &str, bus_capacity: usize) -> Arc<Self> {
        let registry = COORDINATORS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = registry.get(namespace).and_then(Weak::upgrade) {
            return existing;
        }

        registry.retain(|_, weak| weak.strong_count() > 0);
        let coordinator = Arc::new(Self {
            namespace: namespace.to_string(),
            bus: NotificationBus::new(bus_capacity),
            members: Mutex::new(HashMap::new()),
        });
        registry.insert(namespace.to_string(), Arc::downgrade(&coordinator));
        coordinator
    }

    /// Namespace this coordinator serves.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Notification bus for this namespace.
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Make a delegate reachable for forwarded writes.
    pub(crate) fn attach(&self, delegate_id: Arc<str>, inbox: mpsc::Sender<Command>) {
        self.lock_members().insert(delegate_id, inbox);
    }

    /// Remove a delegate.
    pub(crate) fn detach(&self, delegate_id: &str) {
        self.lock_members().remove(delegate_id);
    }

    /// Inbox of an attached delegate.
    pub(crate) fn member(&self, delegate_id: &str) -> Option<mpsc::Sender<Command>> {
        self.lock_members().get(delegate_id).cloned()
    }

    /// Number of attached delegates.
    pub fn member_count(&self) -> usize {
        self.lock_members().len()
    }

    fn lock_members(&self) -> std::sync::MutexGuard<'_, HashMap<Arc<str>, mpsc::Sender<Command>>> {
        self.members.lock().unwrap_or_else(|p| p.into_inner())
    }
}
