//! Quota- and duplicate-aware publication gate.
//!
//! Every attempt passes through one critical section that checks the daily
//! quota, the fingerprint history and the minimum interval, and on admission
//! reserves a quota slot and the fingerprint. The lock is released before the
//! remote call; the reservation keeps concurrent attempts from overrunning
//! the quota or publishing the same fingerprint twice while the call is in
//! flight. A successful publish commits the record and the quota row in one
//! transaction, then settles the reservation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CallError, ConfigError, GateError};
use crate::metrics::MetricsCollector;
use crate::retry::{
    cancellable_sleep, CancellationToken, RateLimiter, RetryFailure, RetryPolicy,
};

use super::clock::{date_key, offset_from_minutes, Clock};
use super::history::{HistoryStore, PublicationRecord, PublicationStatus, QuotaState};

/// Default maximum publications per calendar day.
pub const DEFAULT_DAILY_LIMIT: u32 = 50;

/// Default minimum spacing between publications.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// What the gate does when an item arrives before the minimum interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalPolicy {
    /// Sleep for the remaining interval and try again.
    Wait,
    /// Return [`GateOutcome::Deferred`] with the remaining interval.
    Skip,
}

/// Configuration for the publication gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub daily_limit: u32,
    #[serde(with = "crate::utils::serde_secs")]
    pub min_interval: Duration,
    /// Offset from UTC, in minutes, that defines the quota's calendar day.
    pub utc_offset_minutes: i32,
    pub interval_policy: IntervalPolicy,
    pub retry: RetryPolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            min_interval: DEFAULT_MIN_INTERVAL,
            utc_offset_minutes: 0,
            interval_policy: IntervalPolicy::Wait,
            retry: RetryPolicy::default(),
        }
    }
}

impl GateConfig {
    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = limit;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_interval_policy(mut self, policy: IntervalPolicy) -> Self {
        self.interval_policy = policy;
        self
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "daily_limit must be at least 1".to_string(),
            ));
        }
        if offset_from_minutes(self.utc_offset_minutes).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "utc_offset_minutes".to_string(),
                message: format!(
                    "{} is not a valid UTC offset (must be within +/- 1439 minutes)",
                    self.utc_offset_minutes
                ),
            });
        }
        if self.retry.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "publish retry attempt_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Acknowledgement returned by the remote publishing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub url: Option<String>,
}

impl Receipt {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
        }
    }
}

/// External publishing capability.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Posts `text` with an optional media reference.
    ///
    /// A remote quota signal must be reported as [`CallError::QuotaExceeded`],
    /// which is retried like any transient failure.
    async fn publish(&self, text: &str, media: Option<&str>) -> Result<Receipt, CallError>;
}

/// One item submitted to the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRequest {
    pub fingerprint: String,
    pub artifact_id: String,
    pub text: String,
    pub media: Option<String>,
}

impl PublicationRequest {
    pub fn new(
        fingerprint: impl Into<String>,
        artifact_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            artifact_id: artifact_id.into(),
            text: text.into(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }
}

/// Result of one pass through the gate's critical section.
#[derive(Debug)]
pub enum Admission {
    /// A quota slot and the fingerprint are reserved for the caller.
    Admitted(Reservation),
    RejectedQuota { count_today: u32, daily_limit: u32 },
    RejectedDuplicate,
    /// Too soon after the previous publication; retry after this long.
    Wait(Duration),
}

/// Final result of [`PublicationGate::publish`].
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Published(Receipt),
    RejectedQuota,
    RejectedDuplicate,
    FailedPermanent(CallError),
    /// Not attempted because of the minimum interval under [`IntervalPolicy::Skip`].
    Deferred(Duration),
    /// Cancellation was observed before the item could be published.
    Cancelled,
}

impl GateOutcome {
    /// Status persisted to the history, if the outcome is recorded there.
    pub fn status(&self) -> Option<PublicationStatus> {
        match self {
            GateOutcome::Published(_) => Some(PublicationStatus::Published),
            GateOutcome::RejectedQuota => Some(PublicationStatus::RejectedQuota),
            GateOutcome::RejectedDuplicate => Some(PublicationStatus::RejectedDuplicate),
            GateOutcome::FailedPermanent(_) => Some(PublicationStatus::FailedPermanent),
            GateOutcome::Deferred(_) | GateOutcome::Cancelled => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GateOutcome::Deferred(_) => "deferred",
            GateOutcome::Cancelled => "cancelled",
            other => other.status().map_or("unknown", |s| s.as_str()),
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, GateOutcome::Published(_))
    }
}

/// Current quota usage as seen by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub date_key: String,
    pub count_today: u32,
    /// Admitted attempts whose remote call has not settled yet.
    pub in_flight: u32,
    pub daily_limit: u32,
    pub last_publish_at: Option<DateTime<Utc>>,
}

impl QuotaSnapshot {
    pub fn remaining(&self) -> u32 {
        self.daily_limit
            .saturating_sub(self.count_today)
            .saturating_sub(self.in_flight)
    }
}

#[derive(Debug)]
struct GateState {
    quota: QuotaState,
    reserved: u32,
    in_flight: HashSet<String>,
    published: HashSet<String>,
    last_admitted_at: Option<DateTime<Utc>>,
}

impl GateState {
    /// Applies the quota row returned by a commit without letting a late,
    /// older commit roll the counter back.
    fn merge_committed(&mut self, committed: QuotaState) {
        if committed.date_key > self.quota.date_key {
            self.quota = committed;
            return;
        }
        if committed.date_key == self.quota.date_key {
            self.quota.count_today = self.quota.count_today.max(committed.count_today);
        }
        self.quota.last_publish_at = self.quota.last_publish_at.max(committed.last_publish_at);
    }

    fn release(&mut self, fingerprint: &str) {
        self.reserved = self.reserved.saturating_sub(1);
        self.in_flight.remove(fingerprint);
    }
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Quota slot and fingerprint held between admission and settlement.
///
/// Dropping an unsettled reservation releases both, so an attempt that fails
/// or is cancelled never leaks quota.
#[derive(Debug)]
pub struct Reservation {
    state: Arc<Mutex<GateState>>,
    fingerprint: String,
    admitted_at: DateTime<Utc>,
    settled: bool,
}

impl Reservation {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    /// Converts the reservation into a publication after a durable commit.
    fn complete(mut self, committed: QuotaState) {
        let mut state = lock(&self.state);
        state.release(&self.fingerprint);
        state.published.insert(self.fingerprint.clone());
        state.merge_committed(committed);
        drop(state);
        self.settled = true;
    }

    /// Counts a publication that reached the remote service but could not be
    /// recorded, so this process still never repeats it.
    fn complete_unpersisted(mut self, at: DateTime<Utc>) {
        let mut state = lock(&self.state);
        state.release(&self.fingerprint);
        state.published.insert(self.fingerprint.clone());
        state.quota.count_today = state.quota.count_today.saturating_add(1);
        state.quota.last_publish_at = state.quota.last_publish_at.max(Some(at));
        drop(state);
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.state).release(&self.fingerprint);
        }
    }
}

/// Serialises publication decisions over a durable history.
pub struct PublicationGate {
    config: GateConfig,
    offset: FixedOffset,
    history: HistoryStore,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    state: Arc<Mutex<GateState>>,
    metrics: MetricsCollector,
}

impl PublicationGate {
    /// Opens a gate over `history`, restoring quota and published
    /// fingerprints from it.
    pub async fn open(
        config: GateConfig,
        history: HistoryStore,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GateError> {
        config.validate()?;
        let offset = offset_from_minutes(config.utc_offset_minutes).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "utc_offset_minutes".to_string(),
                message: config.utc_offset_minutes.to_string(),
            }
        })?;

        let today = date_key(clock.now(), offset);
        let mut quota = history
            .load_quota()
            .await?
            .unwrap_or_else(|| QuotaState::new(today.clone()));
        quota.roll_to(&today);
        let published = history.published_fingerprints().await?;

        info!(
            date_key = %quota.date_key,
            count_today = quota.count_today,
            daily_limit = config.daily_limit,
            published = published.len(),
            "Publication gate opened"
        );

        Ok(Self {
            config,
            offset,
            history,
            publisher,
            clock,
            limiter: RateLimiter::disabled(),
            state: Arc::new(Mutex::new(GateState {
                quota,
                reserved: 0,
                in_flight: HashSet::new(),
                published,
                last_admitted_at: None,
            })),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn quota(&self) -> QuotaSnapshot {
        let today = date_key(self.clock.now(), self.offset);
        let mut state = lock(&self.state);
        state.quota.roll_to(&today);
        QuotaSnapshot {
            date_key: state.quota.date_key.clone(),
            count_today: state.quota.count_today,
            in_flight: state.reserved,
            daily_limit: self.config.daily_limit,
            last_publish_at: state.quota.last_publish_at,
        }
    }

    /// Runs the quota, duplicate and interval checks for `fingerprint`.
    ///
    /// Never blocks and never touches the remote service. Items that are
    /// already published or in flight are rejected before the interval is
    /// considered, so duplicates never wait.
    pub fn admit(&self, fingerprint: &str) -> Admission {
        let now = self.clock.now();
        let today = date_key(now, self.offset);
        let mut state = lock(&self.state);
        state.quota.roll_to(&today);

        let used = state.quota.count_today.saturating_add(state.reserved);
        if used >= self.config.daily_limit {
            return Admission::RejectedQuota {
                count_today: state.quota.count_today,
                daily_limit: self.config.daily_limit,
            };
        }

        if state.published.contains(fingerprint) || state.in_flight.contains(fingerprint) {
            return Admission::RejectedDuplicate;
        }

        let anchor = state.quota.last_publish_at.max(state.last_admitted_at);
        if let Some(anchor) = anchor {
            // A clock that went backwards counts as no time elapsed.
            let elapsed = (now - anchor).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.config.min_interval {
                return Admission::Wait(self.config.min_interval - elapsed);
            }
        }

        state.reserved += 1;
        state.in_flight.insert(fingerprint.to_string());
        state.last_admitted_at = Some(now);
        drop(state);

        Admission::Admitted(Reservation {
            state: Arc::clone(&self.state),
            fingerprint: fingerprint.to_string(),
            admitted_at: now,
            settled: false,
        })
    }

    /// Takes one item through the gate and, if admitted, the publisher.
    ///
    /// Policy decisions come back as [`GateOutcome`] variants and are
    /// appended to the history. Only history failures are errors.
    pub async fn publish(
        &self,
        request: &PublicationRequest,
        cancel: &CancellationToken,
    ) -> Result<GateOutcome, GateError> {
        let reservation = loop {
            if cancel.is_cancelled() {
                return Ok(self.finish(request, GateOutcome::Cancelled));
            }

            match self.admit(&request.fingerprint) {
                Admission::Admitted(reservation) => break reservation,
                Admission::RejectedQuota {
                    count_today,
                    daily_limit,
                } => {
                    self.record_decision(
                        request,
                        PublicationStatus::RejectedQuota,
                        format!("daily limit {} reached ({} published)", daily_limit, count_today),
                    )
                    .await?;
                    return Ok(self.finish(request, GateOutcome::RejectedQuota));
                }
                Admission::RejectedDuplicate => {
                    self.record_decision(
                        request,
                        PublicationStatus::RejectedDuplicate,
                        "fingerprint already published or in flight".to_string(),
                    )
                    .await?;
                    return Ok(self.finish(request, GateOutcome::RejectedDuplicate));
                }
                Admission::Wait(wait) => match self.config.interval_policy {
                    IntervalPolicy::Skip => {
                        return Ok(self.finish(request, GateOutcome::Deferred(wait)));
                    }
                    IntervalPolicy::Wait => {
                        debug!(
                            fingerprint = %request.fingerprint,
                            wait_ms = wait.as_millis() as u64,
                            "Waiting for minimum publication interval"
                        );
                        if !cancellable_sleep(cancel, wait).await {
                            return Ok(self.finish(request, GateOutcome::Cancelled));
                        }
                    }
                },
            }
        };

        let publisher = self.publisher.as_ref();
        let text = request.text.as_str();
        let media = request.media.as_deref();
        let outcome = self
            .config
            .retry
            .execute(&self.limiter, false, cancel, |attempt| {
                debug!(fingerprint = %request.fingerprint, attempt = attempt, "Calling publisher");
                publisher.publish(text, media)
            })
            .await;

        let now = self.clock.now();
        let today = date_key(now, self.offset);

        match outcome.result {
            Ok(receipt) => {
                let record = PublicationRecord::new(
                    &request.fingerprint,
                    &request.artifact_id,
                    PublicationStatus::Published,
                    now,
                    today,
                )
                .with_receipt(&receipt.id);

                match self.history.commit_published(&record).await {
                    Ok(quota) => {
                        info!(
                            fingerprint = %request.fingerprint,
                            receipt_id = %receipt.id,
                            attempts = outcome.attempts,
                            count_today = quota.count_today,
                            "Published"
                        );
                        reservation.complete(quota);
                    }
                    Err(e) => {
                        error!(
                            fingerprint = %request.fingerprint,
                            receipt_id = %receipt.id,
                            error = %e,
                            "Published but failed to record in history"
                        );
                        reservation.complete_unpersisted(now);
                        return Err(e.into());
                    }
                }
                Ok(self.finish(request, GateOutcome::Published(receipt)))
            }
            Err(RetryFailure::Permanent(error)) | Err(RetryFailure::Exhausted(error)) => {
                drop(reservation);
                warn!(
                    fingerprint = %request.fingerprint,
                    attempts = outcome.attempts,
                    error = %error,
                    "Publication failed permanently"
                );
                let record = PublicationRecord::new(
                    &request.fingerprint,
                    &request.artifact_id,
                    PublicationStatus::FailedPermanent,
                    now,
                    today,
                )
                .with_detail(error.to_string());
                self.history.append(&record).await?;
                Ok(self.finish(request, GateOutcome::FailedPermanent(error)))
            }
            Err(RetryFailure::Cancelled) => {
                drop(reservation);
                Ok(self.finish(request, GateOutcome::Cancelled))
            }
        }
    }

    async fn record_decision(
        &self,
        request: &PublicationRequest,
        status: PublicationStatus,
        detail: String,
    ) -> Result<(), GateError> {
        let now = self.clock.now();
        let record = PublicationRecord::new(
            &request.fingerprint,
            &request.artifact_id,
            status,
            now,
            date_key(now, self.offset),
        )
        .with_detail(detail);
        self.history.append(&record).await?;
        Ok(())
    }

    fn finish(&self, request: &PublicationRequest, outcome: GateOutcome) -> GateOutcome {
        if !outcome.is_published() {
            info!(
                fingerprint = %request.fingerprint,
                artifact_id = %request.artifact_id,
                status = outcome.label(),
                "Publication not completed"
            );
        }
        self.metrics.record_publication(outcome.label());
        outcome
    }
}
