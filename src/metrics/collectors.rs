//! High-level metric recording for roast-forge operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites record
//! generation, analysis and publication events with consistent labels.

use super::prometheus::{
    ACTIVE_WORKERS, ANALYSES_FAILED, ANALYSIS_SCORE, GENERATIONS_TOTAL, GENERATION_DURATION,
    GENERATION_RETRIES, PUBLICATIONS_TOTAL, ROASTS_FLAGGED,
};

/// Metrics collector for recording roast-forge operational metrics.
///
/// Every method is a no-op until [`super::init_metrics`] has run, so library
/// users that never export metrics pay nothing for the calls.
///
/// # Example
///
/// ```ignore
/// use roast_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_generation("succeeded", 2, 41.5);
/// collector.record_analysis(3.2, true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished generation request.
    ///
    /// # Arguments
    ///
    /// * `status` - Outcome label (`succeeded`, `failed` or `cancelled`)
    /// * `attempts` - Generate calls made; everything past the first is a retry
    /// * `duration_secs` - Wall-clock time spent on the request
    pub fn record_generation(&self, status: &str, attempts: u32, duration_secs: f64) {
        if let Some(total) = GENERATIONS_TOTAL.get() {
            total.with_label_values(&[status]).inc();
        }

        if let Some(retries) = GENERATION_RETRIES.get() {
            retries.inc_by(attempts.saturating_sub(1) as f64);
        }

        if let Some(duration) = GENERATION_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            attempts = attempts,
            duration_secs = duration_secs,
            "Recorded generation metric"
        );
    }

    pub fn worker_started(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    pub fn worker_finished(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }

    /// Record a scored artifact.
    pub fn record_analysis(&self, overall_score: f64, should_roast: bool) {
        if let Some(score) = ANALYSIS_SCORE.get() {
            score.observe(overall_score);
        }

        if should_roast {
            if let Some(flagged) = ROASTS_FLAGGED.get() {
                flagged.inc();
            }
        }

        tracing::trace!(
            overall_score = overall_score,
            should_roast = should_roast,
            "Recorded analysis metric"
        );
    }

    pub fn record_analysis_failure(&self) {
        if let Some(failed) = ANALYSES_FAILED.get() {
            failed.inc();
        }
    }

    /// Record the final status of a publication attempt.
    pub fn record_publication(&self, status: &str) {
        if let Some(total) = PUBLICATIONS_TOTAL.get() {
            total.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded publication metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    #[test]
    fn test_collector_records_without_panicking() {
        init_metrics().ok();
        let collector = MetricsCollector::new();
        collector.record_generation("succeeded", 3, 12.0);
        collector.record_generation("cancelled", 0, 0.0);
        collector.worker_started();
        collector.worker_finished();
        collector.record_analysis(2.5, true);
        collector.record_analysis_failure();
        collector.record_publication("published");
    }

    #[test]
    fn test_generation_retries_counted() {
        init_metrics().ok();
        let Some(retries) = GENERATION_RETRIES.get() else {
            return;
        };
        let before = retries.get();
        MetricsCollector::new().record_generation("failed", 4, 1.0);
        assert!(retries.get() >= before + 3.0);
    }
}
