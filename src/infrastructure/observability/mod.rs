//! Push-based observability: no HTTP server, no incoming requests.
//! Metrics are periodic structured JSON on stdout and, optionally,
//! Prometheus counters/gauges a caller can scrape via a pushgateway.
//! Grounded on the teacher's `infrastructure/observability` module.

pub mod metrics;
pub mod reporter;

pub use metrics::Metrics;
pub use reporter::MetricsReporter;
