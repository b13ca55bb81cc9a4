//! roast-forge: batch media generation with defect scoring and quota-gated
//! publication.
//!
//! Requests run through a bounded worker pool with jittered pacing and
//! retry, each artifact is scored for warping and melting, and the worst
//! ones are published under a daily quota backed by a durable history.

pub mod cli;
pub mod clients;
pub mod error;
pub mod export;
pub mod feedback;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod retry;
pub mod scheduler;
pub mod scoring;
pub mod utils;

// Re-export commonly used error types
pub use error::{
    CallError, CaptionError, ConfigError, ExportError, GateError, HistoryError, ScoringError,
};
