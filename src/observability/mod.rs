//! Observability infrastructure.
//!
//! Provides:
//! - Structured logging through `tracing`
//! - OTLP metrics for statements, live queries and leadership

pub mod metrics;
pub mod tracing;
