//! Eddy: live queries over an embedded SQLite store.
//!
//! Eddy keeps a reactive view over a local database consistent with every
//! committed write, even when several execution contexts share one store on
//! disk.
//!
//! # Architecture
//!
//! - **Delegates**: each connection owns a dedicated thread that holds the only
//!   SQLite connection of that context, reached through message passing
//! - **Leader lease**: contexts sharing a store elect one writer through a lease
//!   row; followers forward their writes to it
//! - **Live queries**: subscriptions re-run when a write touches a table they
//!   read, with stale and cancelled deliveries dropped
//! - **Observable**: tracing spans/events and OpenTelemetry metrics
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`connection`]: Connection facade and memoized initialization
//! - [`delegate`]: Execution delegate thread
//! - [`leader`]: Lease-based leader election and per-namespace coordination
//! - [`live`]: Client-side subscription handles
//! - [`notify`]: Store change notification bus
//! - [`observability`]: Metrics and tracing setup
//! - [`patients`]: Patient registry helpers
//! - [`store`]: Store handles, schema, rows and statement footprints

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // store::StoreHandle is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod connection;
pub mod delegate;
pub mod error;
pub mod leader;
pub mod live;
pub mod notify;
pub mod observability;
pub mod patients;
pub mod store;

pub use connection::{get_connection, ConnectOptions, Connection, Connections};
pub use error::{Error, Result};
pub use leader::{LeaderStatus, LeadershipEvent};
pub use live::{LiveQuery, Subscription};
pub use store::rows::{ResultSet, Row};
pub use store::StoreHandle;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) delegate ID.
///
/// # Example
///
/// ```
/// let id = eddy::generate_delegate_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_delegate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
