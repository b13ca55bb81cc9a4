//! Quality feedback to the generation service.
//!
//! After publication every roast-flagged artifact is reported back to the
//! generation service with its overall score, a short note and a priority.
//! Submissions run with bounded concurrency, each one paced and retried with
//! the shared [`RetryPolicy`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clients::HttpSettings;
use crate::error::{CallError, ConfigError};
use crate::retry::{CancellationToken, RateLimiter, RetryFailure, RetryPolicy};
use crate::scoring::AnalysisResult;

/// Default number of submissions in flight.
pub const DEFAULT_FEEDBACK_CONCURRENCY: usize = 5;

/// Default pause before each submission.
pub const DEFAULT_FEEDBACK_DELAY: Duration = Duration::from_secs(1);

/// Overall scores below this are always high priority.
pub const HIGH_PRIORITY_SCORE: f64 = 10.0;

/// Urgency attached to a feedback entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    /// High for near-zero scores and for any warped or melted artifact.
    pub fn for_analysis(analysis: &AnalysisResult) -> Self {
        if analysis.overall_score() < HIGH_PRIORITY_SCORE
            || analysis.is_warped()
            || analysis.is_melted()
        {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

/// Body of one feedback submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub artifact_id: String,
    pub score: f64,
    pub note: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub opt_in_data_share: bool,
}

impl Feedback {
    /// Builds feedback for a scored artifact.
    ///
    /// The caption becomes the note when there is one; otherwise the note
    /// summarises the scores.
    pub fn for_analysis(analysis: &AnalysisResult, caption: Option<&str>) -> Self {
        let note = match caption.filter(|c| !c.trim().is_empty()) {
            Some(caption) => caption.to_string(),
            None => analysis_note(analysis),
        };
        Self {
            artifact_id: analysis.artifact_id().to_string(),
            score: analysis.overall_score(),
            note,
            priority: Priority::for_analysis(analysis),
            video_url: None,
            prompt: None,
            opt_in_data_share: true,
        }
    }

    pub fn with_video_url(mut self, url: impl Into<String>) -> Self {
        self.video_url = Some(url.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into()).filter(|p: &String| !p.is_empty());
        self
    }

    pub fn with_opt_in(mut self, opt_in: bool) -> Self {
        self.opt_in_data_share = opt_in;
        self
    }
}

/// Score summary used when no caption is available.
pub fn analysis_note(analysis: &AnalysisResult) -> String {
    format!(
        "Quality analysis: score={:.1}, warp={:.1}, melt_rate={:.1}%. Defects detected: warp={}, melt={}",
        analysis.overall_score(),
        analysis.warp_score(),
        analysis.melt_rate() * 100.0,
        analysis.is_warped(),
        analysis.is_melted()
    )
}

/// External feedback capability.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// Returns the service's acknowledgement body.
    async fn submit(&self, feedback: &Feedback) -> Result<serde_json::Value, CallError>;
}

/// Feedback stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub enabled: bool,
    pub concurrency: usize,
    #[serde(with = "crate::utils::serde_secs")]
    pub delay: Duration,
    pub opt_in_data_share: bool,
    pub retry: RetryPolicy,
    pub http: HttpSettings,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: DEFAULT_FEEDBACK_CONCURRENCY,
            delay: DEFAULT_FEEDBACK_DELAY,
            opt_in_data_share: true,
            retry: RetryPolicy::default(),
            http: HttpSettings::default(),
        }
    }
}

impl FeedbackConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "feedback.concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "feedback.retry.attempt_timeout must be positive".to_string(),
            ));
        }
        if self.enabled && self.http.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "feedback.http.base_url is required when feedback is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub artifact_id: String,
    pub score: f64,
    pub priority: Priority,
    pub success: bool,
    pub cancelled: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

/// Tally of a feedback pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCounts {
    pub submitted: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl FeedbackCounts {
    pub fn from_results(results: &[FeedbackResult]) -> Self {
        let mut counts = Self::default();
        for result in results {
            if result.success {
                counts.submitted += 1;
            } else if result.cancelled {
                counts.cancelled += 1;
            } else {
                counts.failed += 1;
            }
        }
        counts
    }
}

/// Submits every entry, at most `config.concurrency` at a time.
///
/// Results come back in input order. A failed submission never stops the
/// others; cancellation turns the remaining ones into cancelled results.
pub async fn submit_batch(
    sink: &dyn FeedbackSink,
    entries: Vec<Feedback>,
    config: &FeedbackConfig,
    cancel: &CancellationToken,
) -> Vec<FeedbackResult> {
    let total = entries.len();
    let limiter = RateLimiter::new(config.delay, config.delay);

    let mut results: Vec<(usize, FeedbackResult)> = futures::stream::iter(
        entries.into_iter().enumerate(),
    )
    .map(|(index, feedback)| {
        let limiter = &limiter;
        async move {
            let outcome = config
                .retry
                .execute(limiter, true, cancel, |_| sink.submit(&feedback))
                .await;
            (index, into_result(feedback, outcome.result, outcome.attempts))
        }
    })
    .buffer_unordered(config.concurrency.max(1))
    .collect()
    .await;

    results.sort_by_key(|(index, _)| *index);
    let results: Vec<FeedbackResult> = results.into_iter().map(|(_, r)| r).collect();

    let counts = FeedbackCounts::from_results(&results);
    info!(
        total = total,
        submitted = counts.submitted,
        failed = counts.failed,
        cancelled = counts.cancelled,
        "Feedback pass finished"
    );
    results
}

fn into_result(
    feedback: Feedback,
    result: Result<serde_json::Value, RetryFailure>,
    attempts: u32,
) -> FeedbackResult {
    let mut entry = FeedbackResult {
        artifact_id: feedback.artifact_id,
        score: feedback.score,
        priority: feedback.priority,
        success: false,
        cancelled: false,
        attempts,
        error: None,
        response: None,
    };
    match result {
        Ok(response) => {
            entry.success = true;
            entry.response = Some(response);
        }
        Err(RetryFailure::Cancelled) => {
            entry.cancelled = true;
        }
        Err(failure) => {
            warn!(artifact_id = %entry.artifact_id, error = %failure, "Feedback submission failed");
            entry.error = Some(failure.to_string());
        }
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{RawSignals, ScoringEngine};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn analysis(id: &str, flow: f64, deformation: f64) -> AnalysisResult {
        let signals = RawSignals::new()
            .with_flow(vec![flow; 4])
            .with_deformation(vec![deformation; 4]);
        ScoringEngine::default().score(id, &signals).unwrap()
    }

    /// Sink that tracks concurrency and fails scripted artifact ids.
    #[derive(Default)]
    struct RecordingSink {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        failing: Vec<String>,
        seen: Mutex<Vec<Feedback>>,
    }

    #[async_trait]
    impl FeedbackSink for RecordingSink {
        async fn submit(&self, feedback: &Feedback) -> Result<serde_json::Value, CallError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(feedback.clone());

            if self.failing.contains(&feedback.artifact_id) {
                return Err(CallError::Permanent("422 Unprocessable Entity".into()));
            }
            Ok(serde_json::json!({ "status": "ok" }))
        }
    }

    fn fast_config(concurrency: usize) -> FeedbackConfig {
        FeedbackConfig::default()
            .with_concurrency(concurrency)
            .with_delay(Duration::ZERO)
            .with_retry(
                RetryPolicy::new(1, Duration::from_millis(1))
                    .with_max_retry_jitter(Duration::ZERO)
                    .with_attempt_timeout(Duration::from_secs(5)),
            )
    }

    #[test]
    fn test_priority_rules() {
        assert_eq!(Priority::for_analysis(&analysis("clean", 0.0, 0.0)), Priority::Normal);
        assert_eq!(Priority::for_analysis(&analysis("warp", 75.0, 0.0)), Priority::High);
        assert_eq!(Priority::for_analysis(&analysis("melt", 0.0, 0.6)), Priority::High);
    }

    #[test]
    fn test_note_falls_back_to_scores() {
        let result = analysis("w", 75.0, 0.0);
        let feedback = Feedback::for_analysis(&result, None);
        assert!(feedback.note.starts_with("Quality analysis: score="));
        assert!(feedback.note.contains("warp=75.0"));
        assert!(feedback.note.contains("warp=true, melt=false"));

        let captioned = Feedback::for_analysis(&result, Some("Warp score 75.0"));
        assert_eq!(captioned.note, "Warp score 75.0");
        assert_eq!(Feedback::for_analysis(&result, Some("  ")).note, feedback.note);
    }

    #[test]
    fn test_feedback_body_shape() {
        let feedback = Feedback::for_analysis(&analysis("a", 75.0, 0.0), None)
            .with_video_url("https://cdn.example/a.mp4")
            .with_prompt("")
            .with_opt_in(false);
        let json = serde_json::to_value(&feedback).unwrap();
        assert_eq!(json["priority"], "high");
        assert_eq!(json["opt_in_data_share"], false);
        assert_eq!(json["video_url"], "https://cdn.example/a.mp4");
        assert!(json.get("prompt").is_none());
    }

    #[tokio::test]
    async fn test_batch_bounded_and_ordered() {
        let sink = RecordingSink {
            failing: vec!["a-3".to_string()],
            ..Default::default()
        };
        let entries: Vec<Feedback> = (0..10)
            .map(|i| Feedback::for_analysis(&analysis(&format!("a-{}", i), 75.0, 0.0), None))
            .collect();

        let results =
            submit_batch(&sink, entries, &fast_config(3), &CancellationToken::new()).await;

        assert_eq!(results.len(), 10);
        assert!(sink.peak.load(Ordering::SeqCst) <= 3);
        let ids: Vec<String> = results.iter().map(|r| r.artifact_id.clone()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("a-{}", i)).collect();
        assert_eq!(ids, expected);

        let counts = FeedbackCounts::from_results(&results);
        assert_eq!(counts.submitted, 9);
        assert_eq!(counts.failed, 1);
        assert_eq!(results[3].attempts, 1);
        assert!(results[3].error.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_batch_submits_nothing() {
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let entries = vec![Feedback::for_analysis(&analysis("a", 75.0, 0.0), None)];

        let results = submit_batch(&sink, entries, &fast_config(2), &cancel).await;

        assert_eq!(FeedbackCounts::from_results(&results).cancelled, 1);
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(FeedbackConfig::default().validate().is_ok());
        assert!(FeedbackConfig::default().with_concurrency(0).validate().is_err());
        let enabled = FeedbackConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(enabled.validate().is_err());
    }
}
