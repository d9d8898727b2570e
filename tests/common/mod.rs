//! Test utilities for eddy integration tests.
//!
//! Provides:
//! - Temporary data directories and store handles
//! - Fast lease settings so failover tests finish quickly
//! - A callback recorder for live query updates

#![allow(dead_code)]

use eddy::{ConnectOptions, Connection, Connections, ResultSet, StoreHandle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Test fixture that manages a temporary data directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory holding store files
    pub temp_dir: TempDir,
    /// Handle for the default test store
    pub store: StoreHandle,
}

impl TestFixture {
    /// Create a new test fixture with a temporary data directory.
    pub fn new() -> Self {
        eddy::observability::tracing::init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let store = StoreHandle::new(temp_dir.path(), "test").expect("invalid store name");
        Self { temp_dir, store }
    }

    /// A registry ("page") with fast lease settings.
    pub fn connections(&self) -> Connections {
        Connections::new(fast_options())
    }

    /// Open a fresh connection on its own registry.
    pub async fn connect(&self) -> Connection {
        self.connections()
            .get(&self.store)
            .await
            .expect("failed to connect")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Lease settings tuned for tests: expiry in 400ms, renewal every 50ms.
pub fn fast_options() -> ConnectOptions {
    ConnectOptions {
        request_channel_size: 32,
        notify_channel_size: 64,
        lease_duration: Duration::from_millis(400),
        lease_renew_interval: Duration::from_millis(50),
        busy_timeout: Duration::from_millis(2000),
    }
}

/// Lease settings with a slow tick, so several changes can land between
/// two `data_version` polls.
pub fn slow_tick_options() -> ConnectOptions {
    ConnectOptions {
        lease_duration: Duration::from_secs(5),
        lease_renew_interval: Duration::from_millis(1500),
        ..fast_options()
    }
}

/// Records every result delivered to a live query callback.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<eddy::Result<ResultSet>>>>,
}

impl Recorder {
    /// Callback to pass to `subscribe`.
    pub fn callback(&self) -> impl FnMut(eddy::Result<ResultSet>) + Send + 'static {
        let seen = Arc::clone(&self.seen);
        move |update| seen.lock().unwrap().push(update)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<eddy::Result<ResultSet>> {
        self.seen.lock().unwrap().last().cloned()
    }

    pub fn all(&self) -> Vec<eddy::Result<ResultSet>> {
        self.seen.lock().unwrap().clone()
    }

    /// Row count of the last successful delivery.
    pub fn last_len(&self) -> Option<usize> {
        match self.last() {
            Some(Ok(result)) => Some(result.len()),
            _ => None,
        }
    }
}

/// Wait for a condition to become true with timeout.
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_temp_dir() {
        let fixture = TestFixture::new();
        assert!(fixture.temp_dir.path().exists());
        assert!(fixture.store.path().starts_with(fixture.temp_dir.path()));
    }
}
