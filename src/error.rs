//! Error taxonomy surfaced through the connection facade.

use thiserror::Error;

/// Errors returned by connections, subscriptions and the leader lease.
///
/// `Clone` so a single failed initialization can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The delegate failed to start or the schema migration failed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Malformed SQL, type mismatch or constraint violation, with the
    /// engine's diagnostic text.
    #[error("query failed: {0}")]
    Query(String),

    /// The delegate became unreachable, or a live query could no longer be
    /// evaluated. The subscription is dead afterwards.
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// A write reached a delegate that does not (or no longer) hold the
    /// leader lease. Retry against the newly elected leader.
    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    /// The connection's delegate has terminated.
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LeadershipLost(_) | Self::Initialization(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Query(err.to_string())
    }
}

/// Result type for eddy operations.
pub type Result<T> = std::result::Result<T, Error>;
