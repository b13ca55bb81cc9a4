//! Aggregate statistics over a set of analysis results.

use serde::{Deserialize, Serialize};

use crate::utils::mean;

use super::engine::AnalysisResult;

/// Batch-level view of scoring results, written next to the exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Artifacts that reached analysis, scored or not.
    pub total: usize,
    pub successful: usize,
    /// Artifacts whose analysis or scoring failed.
    pub errors: usize,
    pub avg_warp_score: f64,
    pub avg_melt_rate: f64,
    pub avg_coherence_score: f64,
    pub avg_trajectory_score: f64,
    pub avg_overall_score: f64,
    pub roast_count: usize,
    pub warp_count: usize,
    pub melt_count: usize,
}

impl MetricsSummary {
    /// Summarises `results`, counting `errors` failed analyses towards the total.
    pub fn from_results(results: &[AnalysisResult], errors: usize) -> Self {
        let avg = |f: fn(&AnalysisResult) -> f64| {
            let values: Vec<f64> = results.iter().map(f).collect();
            mean(&values).unwrap_or(0.0)
        };

        Self {
            total: results.len() + errors,
            successful: results.len(),
            errors,
            avg_warp_score: avg(AnalysisResult::warp_score),
            avg_melt_rate: avg(AnalysisResult::melt_rate),
            avg_coherence_score: avg(AnalysisResult::coherence_score),
            avg_trajectory_score: avg(AnalysisResult::trajectory_score),
            avg_overall_score: avg(AnalysisResult::overall_score),
            roast_count: results.iter().filter(|r| r.should_roast()).count(),
            warp_count: results.iter().filter(|r| r.is_warped()).count(),
            melt_count: results.iter().filter(|r| r.is_melted()).count(),
        }
    }

    /// Fraction of scored artifacts flagged for roasting.
    pub fn roast_rate(&self) -> f64 {
        if self.successful == 0 {
            return 0.0;
        }
        self.roast_count as f64 / self.successful as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{RawSignals, ScoringEngine};

    #[test]
    fn test_summary_of_empty_set() {
        let summary = MetricsSummary::from_results(&[], 3);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.errors, 3);
        assert_eq!(summary.avg_overall_score, 0.0);
        assert_eq!(summary.roast_rate(), 0.0);
    }

    #[test]
    fn test_summary_counts_and_averages() {
        let engine = ScoringEngine::default();
        let clean = engine
            .score("clean", &RawSignals::new().with_flow(vec![0.0, 0.0]))
            .unwrap();
        let warped = engine
            .score("warped", &RawSignals::new().with_flow(vec![120.0, 120.0]))
            .unwrap();

        let summary = MetricsSummary::from_results(&[clean, warped], 1);

        assert_eq!(summary.total, 3);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.warp_count, 1);
        assert_eq!(summary.melt_count, 0);
        assert_eq!(summary.roast_count, 1);
        assert!((summary.avg_warp_score - 60.0).abs() < 1e-9);
        assert!((summary.roast_rate() - 0.5).abs() < 1e-12);
    }
}
