//! Raw per-artifact signal series and the detector capability producing them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, ScoringError};
use crate::scheduler::Artifact;

/// Numeric series measured on one artifact by the external vision process.
///
/// Every series may be empty; the scoring engine treats a missing series as
/// neutral rather than failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSignals {
    /// Mean optical-flow magnitude between consecutive frames.
    pub flow_magnitudes: Vec<f64>,
    /// Per-frame deformation in `[0, 1]`, where 0 is a perfectly recognisable
    /// object and 1 means nothing was detected.
    pub deformation_samples: Vec<f64>,
    /// PSNR in dB between consecutive frames.
    pub psnr_samples: Vec<f64>,
    /// SSIM between the same consecutive frame pairs as `psnr_samples`.
    pub ssim_samples: Vec<f64>,
    /// Mean tracked-keypoint displacement per frame step.
    pub track_displacements: Vec<f64>,
}

impl RawSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow(mut self, magnitudes: Vec<f64>) -> Self {
        self.flow_magnitudes = magnitudes;
        self
    }

    pub fn with_deformation(mut self, samples: Vec<f64>) -> Self {
        self.deformation_samples = samples;
        self
    }

    pub fn with_frame_quality(mut self, psnr: Vec<f64>, ssim: Vec<f64>) -> Self {
        self.psnr_samples = psnr;
        self.ssim_samples = ssim;
        self
    }

    pub fn with_track_displacements(mut self, displacements: Vec<f64>) -> Self {
        self.track_displacements = displacements;
        self
    }

    /// Derives deformation samples from per-frame detection confidences.
    ///
    /// Each frame contributes `1 - max confidence`; a frame without any
    /// detection counts as fully deformed.
    pub fn with_detection_confidences(mut self, frames: &[Vec<f64>]) -> Self {
        self.deformation_samples = frames
            .iter()
            .map(|detections| {
                let best = detections.iter().copied().fold(0.0_f64, f64::max);
                (1.0 - best).clamp(0.0, 1.0)
            })
            .collect();
        self
    }

    /// Number of frames the signals describe, taken from the longest series.
    pub fn frame_count(&self) -> usize {
        [
            self.flow_magnitudes.len(),
            self.deformation_samples.len(),
            self.psnr_samples.len(),
            self.ssim_samples.len(),
            self.track_displacements.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Rejects malformed input shapes: unequal PSNR/SSIM pair counts,
    /// non-finite values and negative values where only magnitudes make sense.
    pub fn validate(&self) -> Result<(), ScoringError> {
        if self.psnr_samples.len() != self.ssim_samples.len() {
            return Err(ScoringError::MismatchedPairs {
                psnr: self.psnr_samples.len(),
                ssim: self.ssim_samples.len(),
            });
        }

        check_series("flow_magnitudes", &self.flow_magnitudes, true)?;
        check_series("deformation_samples", &self.deformation_samples, true)?;
        check_series("psnr_samples", &self.psnr_samples, true)?;
        // SSIM is defined on [-1, 1]
        check_series("ssim_samples", &self.ssim_samples, false)?;
        check_series("track_displacements", &self.track_displacements, true)?;
        Ok(())
    }
}

fn check_series(
    series: &'static str,
    values: &[f64],
    non_negative: bool,
) -> Result<(), ScoringError> {
    for (index, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(ScoringError::NonFinite { series, index });
        }
        if non_negative && value < 0.0 {
            return Err(ScoringError::Negative {
                series,
                index,
                value,
            });
        }
    }
    Ok(())
}

/// External analysis capability: measures raw signals on an artifact.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Fails with a transient [`CallError`] on download or decode trouble and
    /// with [`CallError::Permanent`] for unsupported content.
    async fn analyze(&self, artifact: &Artifact) -> Result<RawSignals, CallError>;
}
