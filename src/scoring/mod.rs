//! Defect scoring of generated artifacts.
//!
//! Raw signal series measured by a [`Detector`] are turned into an
//! [`AnalysisResult`] by the [`ScoringEngine`]:
//!
//! 1. **Warp**: mean optical-flow magnitude and the share of warped steps
//! 2. **Melt**: share of frames whose best detection confidence is too low
//! 3. **Coherence**: PSNR and SSIM between consecutive frames
//! 4. **Trajectory**: sudden jumps in tracked keypoint displacement
//!
//! The weighted combination of the four components gives the overall score;
//! the roast flag is a disjunction of a low overall score and the severe warp
//! and melt conditions, so one catastrophic defect is never averaged away.

pub mod engine;
pub mod signals;
pub mod summary;

pub use engine::{AnalysisResult, DefectKind, ScoringEngine, Thresholds, Weights};
pub use signals::{Detector, RawSignals};
pub use summary::MetricsSummary;
