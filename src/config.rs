//! Configuration parsing for eddy.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for quick start

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Eddy: live queries over an embedded SQLite store.
#[derive(Parser, Debug, Clone)]
#[command(name = "eddy")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory holding store files
    #[arg(short, long, env = "EDDY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Store name; identical names in one data directory share a store
    #[arg(short, long, env = "EDDY_STORE", default_value = "patient-registry")]
    pub store: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "EDDY_LOG_JSON")]
    pub log_json: bool,

    /// Size of each delegate's request inbox (backpressure control)
    #[arg(long, env = "EDDY_REQUEST_CHANNEL_SIZE", default_value_t = 256)]
    pub request_channel_size: usize,

    /// Size of the store notification channel
    #[arg(long, env = "EDDY_NOTIFY_CHANNEL_SIZE", default_value_t = 1024)]
    pub notify_channel_size: usize,

    /// How long a leader lease stays valid without renewal (milliseconds)
    #[arg(long, env = "EDDY_LEASE_DURATION_MS", default_value_t = 5000)]
    pub lease_duration_ms: u64,

    /// How often delegates renew or contend for the lease (milliseconds)
    #[arg(long, env = "EDDY_LEASE_RENEW_MS", default_value_t = 1000)]
    pub lease_renew_ms: u64,

    /// SQLite busy timeout (milliseconds)
    #[arg(long, env = "EDDY_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout_ms: u64,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Lease validity window.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Lease renewal period.
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_ms)
    }

    /// Create a default configuration for testing.
    #[cfg(test)]
    pub fn test_config(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            store: "test".into(),
            log_level: "debug".into(),
            log_json: false,
            request_channel_size: 32,
            notify_channel_size: 64,
            lease_duration_ms: 500,
            lease_renew_ms: 50,
            busy_timeout_ms: 1000,
            otel_endpoint: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            store: "patient-registry".into(),
            log_level: "info".into(),
            log_json: false,
            request_channel_size: 256,
            notify_channel_size: 1024,
            lease_duration_ms: 5000,
            lease_renew_ms: 1000,
            busy_timeout_ms: 5000,
            otel_endpoint: None,
        }
    }
}
