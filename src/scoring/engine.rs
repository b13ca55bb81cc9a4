//! Deterministic defect scoring.
//!
//! Aggregates raw signal series into warp, melt, coherence and trajectory
//! components, combines them into an overall 0-100 quality score and derives
//! the roast decision from configurable thresholds.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ScoringError};
use crate::utils::mean;

use super::signals::RawSignals;

/// Default weight of the warp component in the overall score.
const DEFAULT_WARP_WEIGHT: f64 = 0.3;

/// Default weight of the melt component in the overall score.
const DEFAULT_MELT_WEIGHT: f64 = 0.3;

/// Default weight of the coherence component in the overall score.
const DEFAULT_COHERENCE_WEIGHT: f64 = 0.2;

/// Default weight of the trajectory component in the overall score.
const DEFAULT_TRAJECTORY_WEIGHT: f64 = 0.2;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Score used for components whose input series are missing.
const NEUTRAL_SCORE: f64 = 100.0;

/// Detection and roast thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Mean flow magnitude above which an artifact is warped.
    pub warp_threshold: f64,
    /// Warp score that maps to a zero warp component.
    pub warp_normalization: f64,
    /// Detection confidence below which a frame counts as melted.
    pub min_detection_confidence: f64,
    /// Melted-frame fraction above which an artifact is melted.
    pub melt_threshold: f64,
    /// Change in mean displacement between steps that counts as a jump.
    pub trajectory_jump_threshold: f64,
    /// PSNR (dB) treated as a perfect frame-to-frame match.
    pub psnr_reference_db: f64,
    /// Overall score below which an artifact is roasted.
    pub roast_threshold: f64,
    pub severe_warp_threshold: f64,
    pub severe_melt_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warp_threshold: 50.0,
            warp_normalization: 200.0,
            min_detection_confidence: 0.7,
            melt_threshold: 0.3,
            trajectory_jump_threshold: 10.0,
            psnr_reference_db: 50.0,
            roast_threshold: 5.0,
            severe_warp_threshold: 100.0,
            severe_melt_threshold: 0.5,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [
            ("warp_threshold", self.warp_threshold),
            ("trajectory_jump_threshold", self.trajectory_jump_threshold),
            ("severe_warp_threshold", self.severe_warp_threshold),
        ];
        for (key, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(key, format!("must be a non-negative number, got {}", value)));
            }
        }

        let positive = [
            ("warp_normalization", self.warp_normalization),
            ("psnr_reference_db", self.psnr_reference_db),
        ];
        for (key, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(key, format!("must be positive, got {}", value)));
            }
        }

        let unit = [
            ("min_detection_confidence", self.min_detection_confidence),
            ("melt_threshold", self.melt_threshold),
            ("severe_melt_threshold", self.severe_melt_threshold),
        ];
        for (key, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, format!("must be within [0, 1], got {}", value)));
            }
        }

        if !(0.0..=100.0).contains(&self.roast_threshold) {
            return Err(invalid(
                "roast_threshold",
                format!("must be within [0, 100], got {}", self.roast_threshold),
            ));
        }
        Ok(())
    }

    /// Deformation above which a frame is counted as melted.
    fn deformation_bound(&self) -> f64 {
        1.0 - self.min_detection_confidence
    }
}

/// Component weights of the overall score. Must sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub warp: f64,
    pub melt: f64,
    pub coherence: f64,
    pub trajectory: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            warp: DEFAULT_WARP_WEIGHT,
            melt: DEFAULT_MELT_WEIGHT,
            coherence: DEFAULT_COHERENCE_WEIGHT,
            trajectory: DEFAULT_TRAJECTORY_WEIGHT,
        }
    }
}

impl Weights {
    pub fn new(warp: f64, melt: f64, coherence: f64, trajectory: f64) -> Self {
        Self {
            warp,
            melt,
            coherence,
            trajectory,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("weights.warp", self.warp),
            ("weights.melt", self.melt),
            ("weights.coherence", self.coherence),
            ("weights.trajectory", self.trajectory),
        ];
        for (key, value) in all {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, format!("must be within [0, 1], got {}", value)));
            }
        }

        let sum = self.warp + self.melt + self.coherence + self.trajectory;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::ValidationFailed(format!(
                "score weights must sum to 1.0, got {}",
                sum
            )));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}

/// Which defect a roast is about, used to pick caption templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectKind {
    Warp,
    Melt,
    /// Warped and melted at once.
    Compound,
    /// Flagged by the overall score without a dominant defect.
    LowScore,
}

impl DefectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefectKind::Warp => "warp",
            DefectKind::Melt => "melt",
            DefectKind::Compound => "compound",
            DefectKind::LowScore => "low_score",
        }
    }
}

impl std::fmt::Display for DefectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scored analysis of one artifact.
///
/// Only [`ScoringEngine::score`] constructs values of this type, so the
/// flags always agree with the scores and the thresholds in force.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    artifact_id: String,
    frame_count: usize,
    warp_score: f64,
    warp_rate: f64,
    melt_rate: f64,
    coherence_score: f64,
    trajectory_score: f64,
    overall_score: f64,
    is_warped: bool,
    is_melted: bool,
    should_roast: bool,
}

impl AnalysisResult {
    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Mean flow magnitude.
    pub fn warp_score(&self) -> f64 {
        self.warp_score
    }

    /// Fraction of flow samples above the warp threshold.
    pub fn warp_rate(&self) -> f64 {
        self.warp_rate
    }

    /// Fraction of frames whose detection confidence fell below the bound.
    pub fn melt_rate(&self) -> f64 {
        self.melt_rate
    }

    pub fn coherence_score(&self) -> f64 {
        self.coherence_score
    }

    pub fn trajectory_score(&self) -> f64 {
        self.trajectory_score
    }

    pub fn overall_score(&self) -> f64 {
        self.overall_score
    }

    pub fn is_warped(&self) -> bool {
        self.is_warped
    }

    pub fn is_melted(&self) -> bool {
        self.is_melted
    }

    pub fn should_roast(&self) -> bool {
        self.should_roast
    }

    pub fn defect_count(&self) -> usize {
        usize::from(self.is_warped) + usize::from(self.is_melted)
    }

    /// Dominant defect of a roasted artifact; `None` when not roasted.
    pub fn defect_kind(&self) -> Option<DefectKind> {
        if !self.should_roast {
            return None;
        }
        Some(match (self.is_warped, self.is_melted) {
            (true, true) => DefectKind::Compound,
            (true, false) => DefectKind::Warp,
            (false, true) => DefectKind::Melt,
            (false, false) => DefectKind::LowScore,
        })
    }
}

/// Pure scoring engine over a fixed set of thresholds and weights.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    thresholds: Thresholds,
    weights: Weights,
}

impl ScoringEngine {
    /// Creates an engine after validating thresholds and weights.
    pub fn new(thresholds: Thresholds, weights: Weights) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        weights.validate()?;
        Ok(Self {
            thresholds,
            weights,
        })
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Scores one artifact's signals.
    ///
    /// Empty series score as neutral; only malformed shapes are rejected.
    pub fn score(
        &self,
        artifact_id: &str,
        signals: &RawSignals,
    ) -> Result<AnalysisResult, ScoringError> {
        signals.validate()?;
        let t = &self.thresholds;

        let warp_score = mean(&signals.flow_magnitudes).unwrap_or(0.0);
        let warp_rate = fraction(&signals.flow_magnitudes, |m| m > t.warp_threshold);
        let melt_rate = fraction(&signals.deformation_samples, |d| d > t.deformation_bound());
        let coherence_score = self.coherence(signals);
        let trajectory_score = self.trajectory(&signals.track_displacements);
        let overall_score = self.overall(warp_score, melt_rate, coherence_score, trajectory_score);

        let is_warped = warp_score > t.warp_threshold;
        let is_melted = melt_rate > t.melt_threshold;
        let should_roast = overall_score < t.roast_threshold
            || warp_score > t.severe_warp_threshold
            || melt_rate > t.severe_melt_threshold;

        tracing::debug!(
            artifact_id = artifact_id,
            warp_score = warp_score,
            melt_rate = melt_rate,
            overall_score = overall_score,
            should_roast = should_roast,
            "Scored artifact"
        );

        Ok(AnalysisResult {
            artifact_id: artifact_id.to_string(),
            frame_count: signals.frame_count(),
            warp_score,
            warp_rate,
            melt_rate,
            coherence_score,
            trajectory_score,
            overall_score,
            is_warped,
            is_melted,
            should_roast,
        })
    }

    fn coherence(&self, signals: &RawSignals) -> f64 {
        match (mean(&signals.psnr_samples), mean(&signals.ssim_samples)) {
            (Some(psnr), Some(ssim)) => {
                ((psnr / self.thresholds.psnr_reference_db + ssim) * 50.0).clamp(0.0, 100.0)
            }
            _ => NEUTRAL_SCORE,
        }
    }

    fn trajectory(&self, displacements: &[f64]) -> f64 {
        if displacements.len() < 2 {
            return NEUTRAL_SCORE;
        }
        let steps = displacements.len() - 1;
        let jumps = displacements
            .windows(2)
            .filter(|pair| (pair[1] - pair[0]).abs() > self.thresholds.trajectory_jump_threshold)
            .count();
        (1.0 - jumps as f64 / steps as f64) * 100.0
    }

    /// Weighted combination written as 100 minus weighted penalties, so a
    /// flawless artifact lands on exactly 100.
    fn overall(&self, warp_score: f64, melt_rate: f64, coherence: f64, trajectory: f64) -> f64 {
        let w = &self.weights;
        let warp_component =
            (100.0 - warp_score / self.thresholds.warp_normalization * 100.0).max(0.0);
        let melt_component = (1.0 - melt_rate) * 100.0;

        let penalty = w.warp * (100.0 - warp_component)
            + w.melt * (100.0 - melt_component)
            + w.coherence * (100.0 - coherence)
            + w.trajectory * (100.0 - trajectory);
        (100.0 - penalty).clamp(0.0, 100.0)
    }
}

fn fraction(values: &[f64], predicate: impl Fn(f64) -> bool) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|&&v| predicate(v)).count() as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ScoringEngine {
        ScoringEngine::default()
    }

    #[test]
    fn test_clean_signals_score_perfect() {
        let signals = RawSignals::new()
            .with_flow(vec![0.0; 16])
            .with_deformation(vec![0.0; 16]);
        let result = engine().score("clean", &signals).unwrap();

        assert_eq!(result.overall_score(), 100.0);
        assert!(!result.should_roast());
        assert!(!result.is_warped());
        assert!(!result.is_melted());
        assert_eq!(result.defect_kind(), None);
        assert_eq!(result.frame_count(), 16);
    }

    #[test]
    fn test_empty_signals_are_neutral() {
        let result = engine().score("empty", &RawSignals::new()).unwrap();
        assert_eq!(result.overall_score(), 100.0);
        assert_eq!(result.coherence_score(), 100.0);
        assert_eq!(result.trajectory_score(), 100.0);
        assert_eq!(result.warp_rate(), 0.0);
        assert!(!result.should_roast());
        assert_eq!(result.frame_count(), 0);
    }

    fn warped_and_melting() -> RawSignals {
        RawSignals::new()
            .with_flow(vec![75.0; 4])
            .with_deformation(vec![0.5, 0.5, 0.1, 0.1, 0.0])
    }

    #[test]
    fn test_warped_and_melted_under_defaults() {
        let result = engine().score("b", &warped_and_melting()).unwrap();

        assert_eq!(result.warp_score(), 75.0);
        assert_eq!(result.warp_rate(), 1.0);
        assert!((result.melt_rate() - 0.4).abs() < 1e-12);
        assert!(result.is_warped());
        assert!(result.is_melted());
        assert_eq!(result.defect_count(), 2);
        // 100 - 0.3 * 37.5 - 0.3 * 40
        assert!((result.overall_score() - 76.75).abs() < 1e-9);
        // neither severe condition nor the aggregate triggers at default cut-offs
        assert!(!result.should_roast());
    }

    #[test]
    fn test_severe_melt_threshold_triggers_roast() {
        let thresholds = Thresholds {
            severe_melt_threshold: 0.35,
            ..Default::default()
        };
        let engine = ScoringEngine::new(thresholds, Weights::default()).unwrap();
        let result = engine.score("b", &warped_and_melting()).unwrap();

        assert!(result.is_warped());
        assert!(result.is_melted());
        assert!(result.should_roast());
        assert_eq!(result.defect_kind(), Some(DefectKind::Compound));
    }

    #[test]
    fn test_severe_warp_alone_triggers_roast() {
        let signals = RawSignals::new()
            .with_flow(vec![150.0, 130.0])
            .with_deformation(vec![0.0, 0.0]);
        let result = engine().score("w", &signals).unwrap();

        assert!(result.overall_score() > 5.0);
        assert!(result.should_roast());
        assert_eq!(result.defect_kind(), Some(DefectKind::Warp));
    }

    #[test]
    fn test_low_overall_score_triggers_roast() {
        let signals = RawSignals::new()
            .with_flow(vec![90.0; 3])
            .with_deformation(vec![0.2, 0.25, 0.1])
            .with_frame_quality(vec![0.0, 0.0], vec![0.0, 0.0])
            .with_track_displacements(vec![0.0, 40.0, 0.0, 40.0]);
        let thresholds = Thresholds {
            roast_threshold: 50.0,
            ..Default::default()
        };
        let engine = ScoringEngine::new(thresholds, Weights::default()).unwrap();
        let result = engine.score("low", &signals).unwrap();

        assert_eq!(result.coherence_score(), 0.0);
        assert_eq!(result.trajectory_score(), 0.0);
        assert!(!result.is_melted());
        // 100 - 0.3 * 45 - 0.2 * 100 - 0.2 * 100
        assert!((result.overall_score() - 46.5).abs() < 1e-9);
        assert!(result.should_roast());
    }

    #[test]
    fn test_worst_case_scores_zero() {
        let signals = RawSignals::new()
            .with_flow(vec![400.0; 3])
            .with_deformation(vec![1.0; 3])
            .with_frame_quality(vec![0.0; 2], vec![-1.0; 2])
            .with_track_displacements(vec![0.0, 50.0, 0.0]);
        let result = engine().score("worst", &signals).unwrap();
        assert!(result.overall_score() < 1e-9);
        assert!(result.should_roast());
    }

    #[test]
    fn test_coherence_formula() {
        let signals = RawSignals::new().with_frame_quality(vec![25.0, 35.0], vec![0.8, 0.6]);
        let result = engine().score("c", &signals).unwrap();
        // (30 / 50 + 0.7) * 50
        assert!((result.coherence_score() - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_trajectory_counts_jumps() {
        let signals = RawSignals::new().with_track_displacements(vec![1.0, 2.0, 20.0, 21.0, 22.0]);
        let result = engine().score("t", &signals).unwrap();
        // one jump out of four steps
        assert!((result.trajectory_score() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let signals = RawSignals::new()
            .with_flow(vec![12.5, 80.25, 33.0, 7.125])
            .with_deformation(vec![0.31, 0.05, 0.9])
            .with_frame_quality(vec![28.0, 31.5, 22.0], vec![0.71, 0.83, 0.4])
            .with_track_displacements(vec![3.0, 4.5, 19.0, 18.0]);
        let a = engine().score("same", &signals).unwrap();
        let b = engine().score("same", &signals).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.overall_score().to_bits(), b.overall_score().to_bits());
        assert_eq!(a.coherence_score().to_bits(), b.coherence_score().to_bits());
    }

    #[test]
    fn test_malformed_signals_rejected() {
        let signals = RawSignals::new().with_frame_quality(vec![30.0], vec![]);
        assert!(matches!(
            engine().score("bad", &signals),
            Err(ScoringError::MismatchedPairs { .. })
        ));
    }

    #[test]
    fn test_melt_bound_follows_detection_confidence() {
        // confidences 0.75 and 0.65 -> only the second frame melts
        let signals = RawSignals::new().with_detection_confidences(&[vec![0.75], vec![0.65]]);
        let result = engine().score("m", &signals).unwrap();
        assert!((result.melt_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_custom_weights_change_overall() {
        let signals = RawSignals::new().with_flow(vec![100.0; 2]);
        let warp_heavy = ScoringEngine::new(Thresholds::default(), Weights::new(1.0, 0.0, 0.0, 0.0))
            .unwrap()
            .score("x", &signals)
            .unwrap();
        let warp_blind = ScoringEngine::new(Thresholds::default(), Weights::new(0.0, 0.5, 0.25, 0.25))
            .unwrap()
            .score("x", &signals)
            .unwrap();

        assert!((warp_heavy.overall_score() - 50.0).abs() < 1e-9);
        assert_eq!(warp_blind.overall_score(), 100.0);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(Weights::default().validate().is_ok());
        assert!(Weights::new(0.5, 0.5, 0.5, 0.0).validate().is_err());
        assert!(Weights::new(-0.1, 0.5, 0.3, 0.3).validate().is_err());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(Thresholds::default().validate().is_ok());

        let negative = Thresholds {
            warp_threshold: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let out_of_range = Thresholds {
            melt_threshold: 1.5,
            ..Default::default()
        };
        assert!(out_of_range.validate().is_err());

        let zero_norm = Thresholds {
            warp_normalization: 0.0,
            ..Default::default()
        };
        assert!(ScoringEngine::new(zero_norm, Weights::default()).is_err());
    }

    #[test]
    fn test_defect_kind_labels() {
        assert_eq!(DefectKind::LowScore.to_string(), "low_score");
        assert_eq!(
            serde_json::to_string(&DefectKind::Compound).unwrap(),
            "\"compound\""
        );
    }
}
