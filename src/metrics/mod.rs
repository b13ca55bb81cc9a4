//! Metrics module for Prometheus-based monitoring.
//!
//! Covers generation throughput and retries, analysis scores and roast
//! flags, and publication outcomes.
//!
//! # Example
//!
//! ```ignore
//! use roast_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_publication("published");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
