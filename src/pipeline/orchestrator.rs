//! End-to-end pipeline: generate, analyse, score, export, publish.
//!
//! Outcomes stream out of the batch runner in completion order and are
//! analysed as they arrive, with at most `analysis.concurrency` detector calls
//! in flight. Once the batch is drained the results are exported and the
//! roast-flagged subset is pushed through the publication gate one at a time,
//! worst score first. Feedback for the same subset goes out last.
//!
//! Generated artifacts that end up without a score keep their locator in the
//! unscored export so they can be analysed again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{CaptionError, ConfigError, ExportError, GateError};
use crate::export::{
    self, write_json, write_parquet, write_roasts, write_unscored, AnalysisRow, RoastRecord,
    UnscoredReason, UnscoredRecord, ANALYSIS_FILE, FEEDBACK_FILE, ROASTS_FILE, SUMMARY_FILE,
    UNSCORED_FILE,
};
use crate::feedback::{submit_batch, Feedback, FeedbackCounts, FeedbackResult, FeedbackSink};
use crate::metrics::MetricsCollector;
use crate::publish::{
    fingerprint, render_caption, GateOutcome, PublicationGate, PublicationRequest,
};
use crate::retry::{CancellationToken, RateLimiter, RetryFailure};
use crate::scheduler::{
    Artifact, BatchRunner, Generator, Outcome, OutcomeStatus, PoolStats, Request,
};
use crate::scoring::{AnalysisResult, Detector, MetricsSummary, ScoringEngine};

use super::config::PipelineConfig;

/// Errors that stop a pipeline run.
///
/// Per-item failures never surface here; they are counted in the report.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Publication gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Caption error: {0}")]
    Caption(#[from] CaptionError),
}

/// Analysis of one generated artifact.
#[derive(Debug, Clone)]
pub struct ScoredArtifact {
    pub artifact: Artifact,
    /// Request payload the artifact was generated from.
    pub prompt: String,
    pub analysis: AnalysisResult,
}

/// Counts of publication decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublicationCounts {
    pub published: u64,
    pub rejected_quota: u64,
    pub rejected_duplicate: u64,
    pub failed_permanent: u64,
    pub deferred: u64,
    pub cancelled: u64,
}

impl PublicationCounts {
    pub fn record(&mut self, outcome: &GateOutcome) {
        match outcome {
            GateOutcome::Published(_) => self.published += 1,
            GateOutcome::RejectedQuota => self.rejected_quota += 1,
            GateOutcome::RejectedDuplicate => self.rejected_duplicate += 1,
            GateOutcome::FailedPermanent(_) => self.failed_permanent += 1,
            GateOutcome::Deferred(_) => self.deferred += 1,
            GateOutcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.published
            + self.rejected_quota
            + self.rejected_duplicate
            + self.failed_permanent
            + self.deferred
            + self.cancelled
    }
}

/// Where a run wrote its exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportPaths {
    /// `None` when no artifact was scored.
    pub analysis: Option<PathBuf>,
    pub roasts: PathBuf,
    pub unscored: PathBuf,
    /// `None` when no feedback pass ran.
    pub feedback: Option<PathBuf>,
    pub summary: PathBuf,
}

/// Batch-level summary of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub requests: u64,
    pub generated: u64,
    pub generation_failed: u64,
    pub generation_cancelled: u64,
    pub analysis_failed: u64,
    pub analysis_cancelled: u64,
    pub batch: PoolStats,
    pub scoring: MetricsSummary,
    pub publication: PublicationCounts,
    /// Set when the publication pass stopped on a gate error.
    pub publication_error: Option<String>,
    pub feedback: FeedbackCounts,
    pub exports: Option<ExportPaths>,
    pub duration_secs: f64,
}

/// Result of analysing one outcome.
enum Analyzed {
    Scored(ScoredArtifact),
    Unscored(UnscoredRecord),
    NotGenerated,
}

/// The three-stage pipeline over injected capabilities.
pub struct Pipeline {
    config: PipelineConfig,
    runner: BatchRunner,
    detector: Arc<dyn Detector>,
    engine: ScoringEngine,
    gate: Option<PublicationGate>,
    feedback: Option<Arc<dyn FeedbackSink>>,
    export: bool,
    metrics: MetricsCollector,
}

impl Pipeline {
    /// Builds a pipeline; the configuration is validated first.
    pub fn new(
        config: PipelineConfig,
        generator: Arc<dyn Generator>,
        detector: Arc<dyn Detector>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let runner = BatchRunner::new(generator, config.batch.clone())?;
        let engine = ScoringEngine::new(config.thresholds.clone(), config.weights.clone())?;
        Ok(Self {
            config,
            runner,
            detector,
            engine,
            gate: None,
            feedback: None,
            export: true,
            metrics: MetricsCollector::new(),
        })
    }

    /// Publishes roast-flagged artifacts through `gate` after scoring.
    pub fn with_gate(mut self, gate: PublicationGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Reports every roast-flagged artifact to `sink` after publication.
    pub fn with_feedback(mut self, sink: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(sink);
        self
    }

    /// Turns file exports on or off.
    pub fn with_export(mut self, enabled: bool) -> Self {
        self.export = enabled;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gate(&self) -> Option<&PublicationGate> {
        self.gate.as_ref()
    }

    /// Runs every request through the pipeline.
    ///
    /// Cancelling `cancel` stops new generation, analysis, publication and
    /// feedback work; items already running finish or are reported as
    /// cancelled. A gate error ends the publication pass early and is
    /// returned after the summary has been written.
    pub async fn run(
        &self,
        requests: Vec<Request>,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let total = requests.len() as u64;
        info!(
            requests = total,
            max_workers = self.config.batch.max_workers,
            "Pipeline run started"
        );

        let mut run = self.runner.run(requests, cancel.clone());
        let mut generated = 0u64;
        let mut generation_failed = 0u64;
        let mut generation_cancelled = 0u64;
        let mut analysis_failed = 0u64;
        let mut analysis_cancelled = 0u64;
        let mut scored = Vec::new();
        let mut unscored = Vec::new();

        {
            let mut analyzed = (&mut run)
                .map(|outcome| {
                    match &outcome.status {
                        OutcomeStatus::Succeeded(_) => generated += 1,
                        OutcomeStatus::Failed { .. } => generation_failed += 1,
                        OutcomeStatus::Cancelled => generation_cancelled += 1,
                    }
                    self.analyze(outcome, &cancel)
                })
                .buffer_unordered(self.config.analysis.concurrency);

            while let Some(result) = analyzed.next().await {
                match result {
                    Analyzed::Scored(item) => scored.push(item),
                    Analyzed::Unscored(record) => {
                        match record.reason {
                            UnscoredReason::AnalysisFailed => analysis_failed += 1,
                            UnscoredReason::Cancelled => analysis_cancelled += 1,
                        }
                        unscored.push(record);
                    }
                    Analyzed::NotGenerated => {}
                }
            }
        }
        let batch = run.stats();
        unscored.sort_by(|a, b| a.request_id.cmp(&b.request_id));

        let analyses: Vec<AnalysisResult> = scored.iter().map(|s| s.analysis.clone()).collect();
        let scoring = MetricsSummary::from_results(&analyses, analysis_failed as usize);
        let roasts = self.roast_records(&scored)?;

        info!(
            generated = generated,
            generation_failed = generation_failed,
            scored = scored.len(),
            analysis_failed = analysis_failed,
            analysis_cancelled = analysis_cancelled,
            roasts = roasts.len(),
            "Scoring complete"
        );

        let mut report = PipelineReport {
            requests: total,
            generated,
            generation_failed,
            generation_cancelled,
            analysis_failed,
            analysis_cancelled,
            batch,
            scoring,
            publication: PublicationCounts::default(),
            publication_error: None,
            feedback: FeedbackCounts::default(),
            exports: None,
            duration_secs: 0.0,
        };

        if self.export {
            report.exports = Some(self.write_exports(&scored, &roasts, &unscored)?);
        }

        let mut gate_error = None;
        if let Some(gate) = &self.gate {
            if let Err(e) = publish_into(gate, &roasts, &cancel, &mut report.publication).await {
                warn!(
                    error = %e,
                    published = report.publication.published,
                    "Publication pass aborted"
                );
                report.publication_error = Some(e.to_string());
                gate_error = Some(e);
            }
        }

        if let Some(sink) = &self.feedback {
            let entries = self.feedback_entries(&scored, &roasts);
            let results =
                submit_batch(sink.as_ref(), entries, &self.config.feedback, &cancel).await;
            report.feedback = FeedbackCounts::from_results(&results);
            if let Some(exports) = report.exports.as_mut() {
                let path = self.config.storage.output_dir.join(FEEDBACK_FILE);
                write_feedback(&results, &path)?;
                exports.feedback = Some(path);
            }
        }

        report.duration_secs = started.elapsed().as_secs_f64();
        if let Some(exports) = &report.exports {
            write_json(&report, &exports.summary)?;
        }

        if let Some(e) = gate_error {
            return Err(e.into());
        }

        info!(
            published = report.publication.published,
            feedback_submitted = report.feedback.submitted,
            duration_secs = report.duration_secs,
            "Pipeline run finished"
        );
        Ok(report)
    }

    /// Analyses and scores one generated artifact.
    async fn analyze(&self, outcome: Outcome, cancel: &CancellationToken) -> Analyzed {
        let artifact = match outcome.status {
            OutcomeStatus::Succeeded(artifact) => artifact,
            _ => return Analyzed::NotGenerated,
        };
        let prompt = outcome.request.payload;

        let detector = self.detector.as_ref();
        let signals = self
            .config
            .analysis
            .retry
            .execute(&RateLimiter::disabled(), false, cancel, |_| {
                detector.analyze(&artifact)
            })
            .await;

        let signals = match signals.result {
            Ok(signals) => signals,
            Err(RetryFailure::Cancelled) => {
                info!(request_id = %artifact.request_id, "Analysis cancelled");
                return Analyzed::Unscored(UnscoredRecord::new(
                    &artifact.request_id,
                    &artifact.locator,
                    UnscoredReason::Cancelled,
                ));
            }
            Err(failure) => {
                warn!(
                    request_id = %artifact.request_id,
                    attempts = signals.attempts,
                    error = %failure,
                    "Analysis failed"
                );
                self.metrics.record_analysis_failure();
                return Analyzed::Unscored(
                    UnscoredRecord::new(
                        &artifact.request_id,
                        &artifact.locator,
                        UnscoredReason::AnalysisFailed,
                    )
                    .with_detail(failure.to_string()),
                );
            }
        };

        match self.engine.score(&artifact.request_id, &signals) {
            Ok(analysis) => {
                self.metrics
                    .record_analysis(analysis.overall_score(), analysis.should_roast());
                Analyzed::Scored(ScoredArtifact {
                    artifact,
                    prompt,
                    analysis,
                })
            }
            Err(e) => {
                warn!(request_id = %artifact.request_id, error = %e, "Malformed signals");
                self.metrics.record_analysis_failure();
                Analyzed::Unscored(
                    UnscoredRecord::new(
                        &artifact.request_id,
                        &artifact.locator,
                        UnscoredReason::AnalysisFailed,
                    )
                    .with_detail(e.to_string()),
                )
            }
        }
    }

    /// Feedback for every roast, in roast order.
    fn feedback_entries(&self, scored: &[ScoredArtifact], roasts: &[RoastRecord]) -> Vec<Feedback> {
        let by_id: HashMap<&str, &ScoredArtifact> = scored
            .iter()
            .map(|s| (s.analysis.artifact_id(), s))
            .collect();

        roasts
            .iter()
            .filter_map(|roast| {
                let item = by_id.get(roast.artifact_id.as_str())?;
                Some(
                    Feedback::for_analysis(&item.analysis, Some(roast.caption.as_str()))
                        .with_video_url(&roast.locator)
                        .with_prompt(&item.prompt)
                        .with_opt_in(self.config.feedback.opt_in_data_share),
                )
            })
            .collect()
    }

    /// Fingerprints and captions every roast-flagged artifact, worst first.
    fn roast_records(&self, scored: &[ScoredArtifact]) -> Result<Vec<RoastRecord>, PipelineError> {
        let mut flagged: Vec<&ScoredArtifact> =
            scored.iter().filter(|s| s.analysis.should_roast()).collect();
        flagged.sort_by(|a, b| {
            a.analysis
                .overall_score()
                .total_cmp(&b.analysis.overall_score())
                .then_with(|| a.analysis.artifact_id().cmp(b.analysis.artifact_id()))
        });

        flagged
            .into_iter()
            .map(|item| {
                let fingerprint = fingerprint(&item.artifact.locator, &item.analysis);
                let caption = render_caption(&item.analysis, &fingerprint, &self.config.caption)?;
                let defect_kind = item
                    .analysis
                    .defect_kind()
                    .ok_or_else(|| CaptionError::NoDefect(item.analysis.artifact_id().to_string()))?;
                Ok(RoastRecord {
                    artifact_id: item.analysis.artifact_id().to_string(),
                    locator: item.artifact.locator.clone(),
                    fingerprint,
                    caption,
                    defect_kind,
                    overall_score: item.analysis.overall_score(),
                    warp_score: item.analysis.warp_score(),
                    melt_rate: item.analysis.melt_rate(),
                })
            })
            .collect()
    }

    fn write_exports(
        &self,
        scored: &[ScoredArtifact],
        roasts: &[RoastRecord],
        unscored: &[UnscoredRecord],
    ) -> Result<ExportPaths, PipelineError> {
        let dir = &self.config.storage.output_dir;
        let rows: Vec<AnalysisRow> = scored
            .iter()
            .map(|s| AnalysisRow::new(&s.artifact, &s.analysis))
            .collect();

        let analysis = if rows.is_empty() {
            None
        } else {
            let path = dir.join(ANALYSIS_FILE);
            write_parquet(&rows, &path)?;
            Some(path)
        };

        let roasts_path = dir.join(ROASTS_FILE);
        write_roasts(roasts, &roasts_path)?;

        let unscored_path = dir.join(UNSCORED_FILE);
        write_unscored(unscored, &unscored_path)?;

        Ok(ExportPaths {
            analysis,
            roasts: roasts_path,
            unscored: unscored_path,
            feedback: None,
            summary: dir.join(SUMMARY_FILE),
        })
    }
}

fn write_feedback(results: &[FeedbackResult], path: &std::path::Path) -> Result<(), ExportError> {
    write_json(results, path)?;
    info!(path = %path.display(), entries = results.len(), "Feedback file written");
    Ok(())
}

/// Pushes roast records through the gate in order.
///
/// Stops at the first cancellation; the remaining records are counted as
/// cancelled without touching the history.
pub async fn publish_roasts(
    gate: &PublicationGate,
    roasts: &[RoastRecord],
    cancel: &CancellationToken,
) -> Result<PublicationCounts, GateError> {
    let mut counts = PublicationCounts::default();
    publish_into(gate, roasts, cancel, &mut counts).await?;
    Ok(counts)
}

/// Publication pass that tallies into `counts` as it goes, so decisions made
/// before a gate error are kept.
async fn publish_into(
    gate: &PublicationGate,
    roasts: &[RoastRecord],
    cancel: &CancellationToken,
    counts: &mut PublicationCounts,
) -> Result<(), GateError> {
    for (index, roast) in roasts.iter().enumerate() {
        let request = PublicationRequest::new(&roast.fingerprint, &roast.artifact_id, &roast.caption)
            .with_media(&roast.locator);
        let outcome = gate.publish(&request, cancel).await?;
        counts.record(&outcome);

        if outcome == GateOutcome::Cancelled {
            counts.cancelled += (roasts.len() - index - 1) as u64;
            break;
        }
    }

    info!(
        published = counts.published,
        rejected_quota = counts.rejected_quota,
        rejected_duplicate = counts.rejected_duplicate,
        failed_permanent = counts.failed_permanent,
        deferred = counts.deferred,
        "Publication pass finished"
    );
    Ok(())
}

/// Reads a roast file and publishes it.
pub async fn publish_roast_file(
    gate: &PublicationGate,
    path: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<PublicationCounts, PipelineError> {
    let roasts = export::read_roasts(path)?;
    Ok(publish_roasts(gate, &roasts, cancel).await?)
}
