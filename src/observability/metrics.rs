//! OTLP metrics for delegates and live queries.
//!
//! Key metrics:
//! - eddy_query_total: Counter for statements run, by kind (read/write)
//! - eddy_query_latency_seconds: Histogram for statement latency
//! - eddy_live_refresh_total: Counter for live query results delivered
//! - eddy_active_subscriptions: Up/down counter of registered live queries
//! - eddy_leader: Gauge, 1 while a delegate leads

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Eddy metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Total number of statements run.
    pub query_total: Counter<u64>,
    /// Histogram of statement latency in seconds.
    pub query_latency: Histogram<f64>,
    /// Total number of refreshed results delivered to live queries.
    pub live_refresh_total: Counter<u64>,
    /// Live queries currently registered.
    pub active_subscriptions: UpDownCounter<i64>,
    /// 1 while the delegate holds the lease, 0 otherwise.
    pub leader: Gauge<i64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            query_total: meter
                .u64_counter("eddy_query_total")
                .with_description("Total number of statements run")
                .with_unit("1")
                .init(),
            query_latency: meter
                .f64_histogram("eddy_query_latency_seconds")
                .with_description("Statement latency inside the delegate")
                .with_unit("s")
                .init(),
            live_refresh_total: meter
                .u64_counter("eddy_live_refresh_total")
                .with_description("Refreshed live query results delivered")
                .with_unit("1")
                .init(),
            active_subscriptions: meter
                .i64_up_down_counter("eddy_active_subscriptions")
                .with_description("Live queries currently registered")
                .with_unit("1")
                .init(),
            leader: meter
                .i64_gauge("eddy_leader")
                .with_description("1 if the delegate holds the leader lease")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// Subsequent calls are ignored. Without an endpoint, metrics are recorded
/// but never exported.
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        let provider = match otel_endpoint {
            Some(endpoint) => {
                use opentelemetry_otlp::{Protocol, WithExportConfig};

                let exporter = opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint)
                    .with_protocol(Protocol::Grpc);

                match opentelemetry_otlp::new_pipeline()
                    .metrics(opentelemetry_sdk::runtime::Tokio)
                    .with_exporter(exporter)
                    .with_period(std::time::Duration::from_secs(10))
                    .build()
                {
                    Ok(provider) => {
                        tracing::info!(endpoint, "OTLP metrics exporter configured");
                        provider
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to create OTLP exporter, metrics stay local");
                        local_provider()
                    }
                }
            }
            None => local_provider(),
        };
        global::set_meter_provider(provider);

        Metrics::new(&global::meter("eddy"))
    });
}

fn local_provider() -> SdkMeterProvider {
    let reader = ManualReader::builder().build();
    SdkMeterProvider::builder().with_reader(reader).build()
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record one statement run by a delegate.
pub fn record_query(kind: &'static str, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("kind", kind)];
        m.query_total.add(1, &attrs);
        m.query_latency.record(latency_seconds, &attrs);
    }
}

/// Record refreshed results delivered to live queries.
pub fn record_refresh(delivered: usize) {
    if let Some(m) = METRICS.get() {
        m.live_refresh_total
            .add(u64::try_from(delivered).unwrap_or(u64::MAX), &[]);
    }
}

/// Adjust the number of registered live queries.
pub fn record_active_subscriptions(delta: i64) {
    if let Some(m) = METRICS.get() {
        m.active_subscriptions.add(delta, &[]);
    }
}

/// Record the leadership status of a delegate.
pub fn record_leadership(delegate_id: &str, leader: bool) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("delegate", delegate_id.to_string())];
        m.leader.record(i64::from(leader), &attrs);
    }
}
