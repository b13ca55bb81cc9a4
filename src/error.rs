//! Error types for roast-forge operations.
//!
//! Defines the error taxonomy shared by every subsystem:
//! - Remote capability calls (generation, detection, publishing)
//! - Defect scoring of raw signals
//! - Durable publication history
//! - Export of analysis results
//! - Startup configuration
//!
//! Quota and duplicate rejections are not errors; they are explicit
//! decisions returned by the publication gate.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the external capabilities (Generate, Analyze, Publish).
///
/// Every variant except [`CallError::Permanent`] is transient and may be
/// retried under a [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited by remote service: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Remote quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl CallError {
    /// Returns true when the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CallError::Permanent(_))
    }

    /// Minimum delay the remote side asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors that can occur while scoring raw signals.
///
/// Missing signals never fail; only malformed input shapes do, and those are
/// permanent.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoringError {
    #[error("Frame quality series length mismatch: {psnr} PSNR samples vs {ssim} SSIM samples")]
    MismatchedPairs { psnr: usize, ssim: usize },

    #[error("Non-finite value in {series} at index {index}")]
    NonFinite { series: &'static str, index: usize },

    #[error("Negative value {value} in {series} at index {index}")]
    Negative {
        series: &'static str,
        index: usize,
        value: f64,
    },
}

/// Errors that can occur in the durable publication history.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt history record: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop the publication gate.
///
/// Policy rejections are not errors; see [`crate::publish::GateOutcome`].
#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Errors that can occur while rendering a caption.
#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Nothing to caption: {0} has no defects")]
    NoDefect(String),
}

/// Errors that can occur during export operations.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No analysis rows to export")]
    NoRows,

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or validating configuration.
///
/// These are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_classification() {
        assert!(CallError::Transient("reset".into()).is_transient());
        assert!(CallError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CallError::QuotaExceeded("daily".into()).is_transient());
        assert!(CallError::RateLimited {
            message: "slow down".into(),
            retry_after: None
        }
        .is_transient());
        assert!(!CallError::Permanent("bad prompt".into()).is_transient());
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let err = CallError::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(CallError::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn test_scoring_error_display() {
        let err = ScoringError::MismatchedPairs { psnr: 3, ssim: 2 };
        assert!(err.to_string().contains("3 PSNR"));
    }
}
