//! Pipeline orchestration: generation, scoring and publication.
//!
//! # Pipeline Flow
//!
//! 1. **Generate**: requests run through the bounded [`crate::scheduler::BatchRunner`]
//! 2. **Analyze**: each generated artifact's signals come from the detector
//! 3. **Score**: the [`crate::scoring::ScoringEngine`] decides what to roast
//! 4. **Export**: analysis table, roast subset, unscored artifacts and summary are written out
//! 5. **Publish**: roasts pass through the [`crate::publish::PublicationGate`]
//! 6. **Feedback**: roast scores go back to an optional [`crate::feedback::FeedbackSink`]
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use roast_forge::clients::{DryRunPublisher, HttpGenerator, SignalFileDetector};
//! use roast_forge::pipeline::{Pipeline, PipelineConfig};
//! use roast_forge::publish::{HistoryStore, PublicationGate, SystemClock};
//! use roast_forge::retry::CancellationToken;
//!
//! let config = PipelineConfig::load(Some("roast.yaml".as_ref()))?;
//! let history = HistoryStore::open(&config.storage.history_path).await?;
//! let gate = PublicationGate::open(
//!     config.gate.clone(),
//!     history,
//!     Arc::new(DryRunPublisher::new()),
//!     Arc::new(SystemClock),
//! )
//! .await?;
//!
//! let pipeline = Pipeline::new(
//!     config.clone(),
//!     Arc::new(HttpGenerator::new(config.generator.clone())?),
//!     Arc::new(SignalFileDetector::new(&config.analysis.signals_dir)),
//! )?
//! .with_gate(gate);
//!
//! let report = pipeline.run(requests, CancellationToken::new()).await?;
//! println!("published {}", report.publication.published);
//! ```

pub mod config;
pub mod orchestrator;

pub use config::{AnalysisConfig, PipelineConfig, PublisherConfig, StorageConfig};
pub use orchestrator::{
    publish_roast_file, publish_roasts, ExportPaths, Pipeline, PipelineError, PipelineReport,
    PublicationCounts, ScoredArtifact,
};
