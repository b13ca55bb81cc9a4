//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by roast-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all roast-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total generation requests finished, labeled by outcome status.
pub static GENERATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total retry attempts spent on generation calls.
pub static GENERATION_RETRIES: OnceLock<Counter> = OnceLock::new();

/// Wall-clock time per generation request in seconds, retries included.
pub static GENERATION_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of workers currently processing a request.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Distribution of overall analysis scores (0-100).
pub static ANALYSIS_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Total artifacts whose analysis could not be completed.
pub static ANALYSES_FAILED: OnceLock<Counter> = OnceLock::new();

/// Total artifacts flagged for roasting.
pub static ROASTS_FLAGGED: OnceLock<Counter> = OnceLock::new();

/// Total publication attempts, labeled by final status.
pub static PUBLICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let generations_total = CounterVec::new(
        Opts::new(
            "roast_forge_generations_total",
            "Total generation requests finished",
        ),
        &["status"],
    )?;

    let generation_retries = Counter::new(
        "roast_forge_generation_retries_total",
        "Total retry attempts spent on generation calls",
    )?;

    let generation_duration = Histogram::with_opts(
        HistogramOpts::new(
            "roast_forge_generation_duration_seconds",
            "Generation request duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
    )?;

    let active_workers = Gauge::new(
        "roast_forge_active_workers",
        "Number of workers currently processing a request",
    )?;

    let analysis_score = Histogram::with_opts(
        HistogramOpts::new(
            "roast_forge_analysis_score",
            "Distribution of overall analysis scores",
        )
        .buckets(vec![5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]),
    )?;

    let analyses_failed = Counter::new(
        "roast_forge_analyses_failed_total",
        "Total artifacts whose analysis failed",
    )?;

    let roasts_flagged = Counter::new(
        "roast_forge_roasts_flagged_total",
        "Total artifacts flagged for roasting",
    )?;

    let publications_total = CounterVec::new(
        Opts::new(
            "roast_forge_publications_total",
            "Total publication attempts by final status",
        ),
        &["status"],
    )?;

    registry.register(Box::new(generations_total.clone()))?;
    registry.register(Box::new(generation_retries.clone()))?;
    registry.register(Box::new(generation_duration.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(analysis_score.clone()))?;
    registry.register(Box::new(analyses_failed.clone()))?;
    registry.register(Box::new(roasts_flagged.clone()))?;
    registry.register(Box::new(publications_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = GENERATIONS_TOTAL.set(generations_total);
    let _ = GENERATION_RETRIES.set(generation_retries);
    let _ = GENERATION_DURATION.set(generation_duration);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = ANALYSIS_SCORE.set(analysis_score);
    let _ = ANALYSES_FAILED.set(analyses_failed);
    let _ = ROASTS_FLAGGED.set(roasts_flagged);
    let _ = PUBLICATIONS_TOTAL.set(publications_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| format!("# Error converting metrics: {}\n", e))
}
