//! Bounded worker pool that drives a batch of requests through a generator.
//!
//! A producer task feeds requests into a bounded queue and blocks when it is
//! full, which keeps memory flat for arbitrarily large batches. A fixed set
//! of workers dequeue from that queue, pace and retry each Generate call, and
//! send one [`Outcome`] per request onto the output channel.
//!
//! # Features
//!
//! - Configurable number of workers and queue capacity
//! - Jittered pacing before every outbound call
//! - Retry with exponential backoff for transient failures
//! - Run-level cancellation that still reports every request
//! - Pool statistics tracking

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::error::{CallError, ConfigError};
use crate::metrics::MetricsCollector;
use crate::retry::{
    CancellationToken, RateLimiter, RetryFailure, RetryPolicy, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY,
};

use super::job::{Artifact, Outcome, OutcomeStatus, Request};

/// Default number of concurrent workers.
pub const DEFAULT_MAX_WORKERS: usize = 100;

/// Default capacity of the pending-request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// External generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Turns one request into an artifact.
    ///
    /// Implementations classify failures into [`CallError`] variants; only
    /// `Permanent` skips the retry budget.
    async fn generate(&self, request: &Request) -> Result<Artifact, CallError>;
}

/// Configuration for a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Number of worker tasks to spawn.
    pub max_workers: usize,
    /// Pending requests held before the producer blocks.
    pub queue_capacity: usize,
    /// Lower bound of the pre-call pacing window.
    #[serde(with = "crate::utils::serde_secs")]
    pub pacing_min: Duration,
    /// Upper bound of the pre-call pacing window.
    #[serde(with = "crate::utils::serde_secs")]
    pub pacing_max: Duration,
    pub retry: RetryPolicy,
    /// Seed for reproducible jitter; `None` draws from the thread RNG.
    pub jitter_seed: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pacing_min: DEFAULT_MIN_DELAY,
            pacing_max: DEFAULT_MAX_DELAY,
            retry: RetryPolicy::default(),
            jitter_seed: None,
        }
    }
}

impl BatchConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_pacing(mut self, min: Duration, max: Duration) -> Self {
        self.pacing_min = min;
        self.pacing_max = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Checks the configuration for values a run cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.pacing_min > self.pacing_max {
            return Err(ConfigError::ValidationFailed(format!(
                "pacing_min ({:?}) must not exceed pacing_max ({:?})",
                self.pacing_min, self.pacing_max
            )));
        }
        if self.retry.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "retry.attempt_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the pacing limiter described by this configuration.
    pub fn rate_limiter(&self) -> RateLimiter {
        match self.jitter_seed {
            Some(seed) => RateLimiter::seeded(self.pacing_min, self.pacing_max, seed),
            None => RateLimiter::new(self.pacing_min, self.pacing_max),
        }
    }
}

/// Statistics about a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub max_workers: usize,
    /// Requests pulled from the input so far.
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Generate calls beyond the first attempt of each request.
    pub retries: u64,
    /// Workers currently inside a Generate call or its pacing/backoff.
    pub active_workers: usize,
    /// Highest value `active_workers` reached during the run.
    pub peak_active_workers: usize,
    /// Average time spent per request that reached a worker.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the number of requests with a terminal outcome.
    pub fn total_processed(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    worked: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
    peak_active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            worked: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            peak_active_workers: AtomicU64::new(0),
        }
    }

    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    fn record_outcome(&self, outcome: &Outcome) {
        let counter = match outcome.status {
            OutcomeStatus::Succeeded(_) => &self.succeeded,
            OutcomeStatus::Failed { .. } => &self.failed,
            OutcomeStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.retries
            .fetch_add(outcome.attempts.saturating_sub(1) as u64, Ordering::SeqCst);
        if outcome.worker_id.is_some() {
            self.worked.fetch_add(1, Ordering::SeqCst);
            self.total_duration_ms
                .fetch_add(outcome.duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    fn increment_active(&self) {
        let now = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_workers.fetch_max(now, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, max_workers: usize) -> PoolStats {
        let worked = self.worked.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let average_duration = if worked > 0 {
            Duration::from_millis(total_duration_ms / worked)
        } else {
            Duration::ZERO
        };

        PoolStats {
            max_workers,
            submitted: self.submitted.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            peak_active_workers: self.peak_active_workers.load(Ordering::SeqCst) as usize,
            average_duration,
        }
    }
}

/// Starts batch runs against a generator.
///
/// A runner can start any number of runs; each run is independent and owns
/// its own queue, workers and statistics.
pub struct BatchRunner {
    generator: Arc<dyn Generator>,
    config: BatchConfig,
    limiter: Arc<RateLimiter>,
    metrics: MetricsCollector,
}

impl BatchRunner {
    /// Creates a runner after validating `config`.
    pub fn new(generator: Arc<dyn Generator>, config: BatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = Arc::new(config.rate_limiter());
        Ok(Self {
            generator,
            config,
            limiter,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Starts a run over `requests` and returns its outcome stream.
    ///
    /// Must be called from within a Tokio runtime. The stream yields exactly
    /// one outcome per request, in completion order, and ends once every
    /// request has been reported. Cancelling `cancel` stops dequeuing; queued
    /// and not-yet-submitted requests come back as `Cancelled` outcomes.
    pub fn run<I>(&self, requests: I, cancel: CancellationToken) -> BatchRun
    where
        I: IntoIterator<Item = Request>,
        I::IntoIter: Send + 'static,
    {
        let max_workers = self.config.max_workers;
        let stats = Arc::new(SharedPoolStats::new());
        let (queue_tx, queue_rx) = mpsc::channel::<Request>(self.config.queue_capacity);
        let (out_tx, out_rx) = mpsc::channel::<Outcome>(max_workers.saturating_mul(2).max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        info!(
            max_workers = max_workers,
            queue_capacity = self.config.queue_capacity,
            "Starting batch run"
        );

        let producer = tokio::spawn(produce(
            requests.into_iter(),
            queue_tx,
            out_tx.clone(),
            cancel.clone(),
            Arc::clone(&stats),
        ));

        let workers: Vec<JoinHandle<()>> = (0..max_workers)
            .map(|i| {
                let worker = Worker {
                    id: format!("worker-{}", i),
                    generator: Arc::clone(&self.generator),
                    queue: Arc::clone(&queue_rx),
                    outcomes: out_tx.clone(),
                    retry: self.config.retry.clone(),
                    limiter: Arc::clone(&self.limiter),
                    cancel: cancel.clone(),
                    stats: Arc::clone(&stats),
                    metrics: self.metrics.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let supervisor = tokio::spawn(supervise(
            producer,
            workers,
            queue_rx,
            out_tx,
            Arc::clone(&stats),
            max_workers,
        ));

        BatchRun {
            outcomes: ReceiverStream::new(out_rx),
            cancel,
            stats,
            max_workers,
            finished: false,
            _supervisor: supervisor,
        }
    }
}

/// Handle to an in-progress batch run.
///
/// Implements [`Stream`] over the run's outcomes. Dropping the handle before
/// the stream is exhausted cancels the run.
pub struct BatchRun {
    outcomes: ReceiverStream<Outcome>,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
    max_workers: usize,
    finished: bool,
    _supervisor: JoinHandle<()>,
}

impl BatchRun {
    /// Requests cancellation of the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns current run statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.max_workers)
    }

    /// Drains the run, returning every outcome.
    pub async fn collect_all(mut self) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl Stream for BatchRun {
    type Item = Outcome;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Outcome>> {
        let polled = self.outcomes.poll_next_unpin(cx);
        if let Poll::Ready(None) = polled {
            self.finished = true;
        }
        polled
    }
}

impl Drop for BatchRun {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

/// Feeds requests into the bounded queue until the input ends or the run is
/// cancelled. Requests not enqueued before cancellation are reported directly.
async fn produce<I>(
    requests: I,
    queue: mpsc::Sender<Request>,
    outcomes: mpsc::Sender<Outcome>,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
) where
    I: Iterator<Item = Request>,
{
    let mut requests = requests;
    let mut enqueued = 0u64;

    while let Some(request) = requests.next() {
        stats.record_submitted();

        // The permit borrows the queue, so it must be gone before the queue is dropped.
        let refused = {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = queue.reserve() => permit.ok(),
            };
            match permit {
                Some(permit) => {
                    permit.send(request);
                    None
                }
                None => Some(request),
            }
        };

        let Some(request) = refused else {
            enqueued += 1;
            continue;
        };

        drop(queue);
        let mut skipped = 0u64;
        for request in std::iter::once(request).chain(requests.by_ref()) {
            if skipped > 0 {
                stats.record_submitted();
            }
            skipped += 1;
            let outcome = Outcome::never_started(request);
            stats.record_outcome(&outcome);
            if outcomes.send(outcome).await.is_err() {
                break;
            }
        }
        info!(
            enqueued = enqueued,
            skipped = skipped,
            "Producer stopped by cancellation"
        );
        return;
    }

    debug!(enqueued = enqueued, "Producer finished");
}

/// Waits for the producer and every worker, then reports anything still
/// queued as cancelled. Dropping the last outcome sender ends the stream.
async fn supervise(
    producer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    queue: Arc<Mutex<mpsc::Receiver<Request>>>,
    outcomes: mpsc::Sender<Outcome>,
    stats: Arc<SharedPoolStats>,
    max_workers: usize,
) {
    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task panicked");
        }
    }
    if let Err(e) = producer.await {
        error!(error = %e, "Producer task panicked");
    }

    let mut queue = queue.lock().await;
    queue.close();
    let mut leftover = 0u64;
    while let Ok(request) = queue.try_recv() {
        leftover += 1;
        let outcome = Outcome::never_started(request);
        stats.record_outcome(&outcome);
        if outcomes.send(outcome).await.is_err() {
            break;
        }
    }
    if leftover > 0 {
        warn!(count = leftover, "Queued requests cancelled before dequeue");
    }

    let final_stats = stats.to_pool_stats(max_workers);
    info!(
        succeeded = final_stats.succeeded,
        failed = final_stats.failed,
        cancelled = final_stats.cancelled,
        retries = final_stats.retries,
        "Batch run finished"
    );
}

/// A single worker that processes requests from the queue.
struct Worker {
    id: String,
    generator: Arc<dyn Generator>,
    queue: Arc<Mutex<mpsc::Receiver<Request>>>,
    outcomes: mpsc::Sender<Outcome>,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Dequeues until the queue is closed and empty, the run is cancelled or
    /// nobody is listening for outcomes anymore.
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                request = async { self.queue.lock().await.recv().await } => request,
            };
            let Some(request) = next else {
                break;
            };

            let outcome = self.process(request).await;
            self.stats.record_outcome(&outcome);
            self.metrics.record_generation(
                outcome.status.label(),
                outcome.attempts,
                outcome.duration.as_secs_f64(),
            );
            if self.outcomes.send(outcome).await.is_err() {
                warn!(worker_id = %self.id, "Outcome receiver dropped, stopping");
                break;
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, request: Request) -> Outcome {
        let started = Instant::now();
        self.stats.increment_active();
        self.metrics.worker_started();

        let generator: &dyn Generator = self.generator.as_ref();
        let request_ref = &request;
        let last_attempt = AtomicU32::new(0);
        let last_attempt_ref = &last_attempt;

        let call = self
            .retry
            .execute(&self.limiter, true, &self.cancel, move |attempt| {
                last_attempt_ref.store(attempt, Ordering::SeqCst);
                debug!(request_id = %request_ref.id, attempt = attempt, "Calling generator");
                generator.generate(request_ref)
            });
        let result = AssertUnwindSafe(call).catch_unwind().await;

        self.stats.decrement_active();
        self.metrics.worker_finished();

        let (status, attempts) = match result {
            Ok(outcome) => {
                let status = match outcome.result {
                    Ok(artifact) => OutcomeStatus::Succeeded(artifact),
                    Err(RetryFailure::Permanent(error)) => OutcomeStatus::Failed {
                        error,
                        retries_exhausted: false,
                    },
                    Err(RetryFailure::Exhausted(error)) => OutcomeStatus::Failed {
                        error,
                        retries_exhausted: true,
                    },
                    Err(RetryFailure::Cancelled) => OutcomeStatus::Cancelled,
                };
                (status, outcome.attempts)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker_id = %self.id, request_id = %request.id, panic = %message, "Generator panicked");
                let status = OutcomeStatus::Failed {
                    error: CallError::Permanent(format!("generator panicked: {}", message)),
                    retries_exhausted: false,
                };
                (status, last_attempt.load(Ordering::SeqCst))
            }
        };

        match &status {
            OutcomeStatus::Succeeded(artifact) => {
                info!(worker_id = %self.id, request_id = %request.id, locator = %artifact.locator, attempts = attempts, "Generation succeeded");
            }
            OutcomeStatus::Failed { error, .. } => {
                warn!(worker_id = %self.id, request_id = %request.id, attempts = attempts, error = %error, "Generation failed");
            }
            OutcomeStatus::Cancelled => {
                info!(worker_id = %self.id, request_id = %request.id, "Generation cancelled");
            }
        }

        Outcome {
            request,
            status,
            attempts,
            worker_id: Some(self.id.clone()),
            duration: started.elapsed(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    /// Generator that sleeps, tracks concurrency and follows a per-request script.
    struct ScriptedGenerator {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        transient_failures: HashMap<String, u32>,
        permanent: HashSet<String>,
        panics: HashSet<String>,
        attempts: std::sync::Mutex<HashMap<String, u32>>,
    }

    impl ScriptedGenerator {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                transient_failures: HashMap::new(),
                permanent: HashSet::new(),
                panics: HashSet::new(),
                attempts: std::sync::Mutex::new(HashMap::new()),
            }
        }

        fn fail_transiently(mut self, id: &str, times: u32) -> Self {
            self.transient_failures.insert(id.to_string(), times);
            self
        }

        fn fail_permanently(mut self, id: &str) -> Self {
            self.permanent.insert(id.to_string());
            self
        }

        fn panic_on(mut self, id: &str) -> Self {
            self.panics.insert(id.to_string());
            self
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, request: &Request) -> Result<Artifact, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panics.contains(&request.id) {
                panic!("decoder blew up");
            }
            if self.permanent.contains(&request.id) {
                return Err(CallError::Permanent("400 Bad Request".into()));
            }
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let entry = attempts.entry(request.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if let Some(&failures) = self.transient_failures.get(&request.id) {
                if attempt <= failures {
                    return Err(CallError::Transient("503 Service Unavailable".into()));
                }
            }
            Ok(Artifact::new(
                request.id.clone(),
                format!("https://cdn.example/{}.mp4", request.id),
            ))
        }
    }

    fn fast_config(max_workers: usize) -> BatchConfig {
        BatchConfig::new(max_workers)
            .with_queue_capacity(8)
            .with_pacing(Duration::ZERO, Duration::ZERO)
            .with_retry(
                RetryPolicy::new(3, Duration::from_millis(5))
                    .with_max_retry_jitter(Duration::ZERO)
                    .with_attempt_timeout(Duration::from_secs(5)),
            )
    }

    fn requests(n: usize) -> Vec<Request> {
        (0..n)
            .map(|i| Request::new(format!("req-{}", i), format!("prompt {}", i)))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.max_workers, 100);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.pacing_min, Duration::from_secs(1));
        assert_eq!(config.pacing_max, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::new(0).validate().is_err());
        assert!(BatchConfig::new(1).with_queue_capacity(0).validate().is_err());
        assert!(BatchConfig::new(1)
            .with_pacing(Duration::from_secs(5), Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_pool_stats_rates() {
        let stats = PoolStats {
            succeeded: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_processed(), 4);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_every_request_yields_one_outcome() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(2)));
        let runner = BatchRunner::new(generator, fast_config(4)).unwrap();

        let outcomes = runner.run(requests(25), CancellationToken::new()).collect_all().await;

        assert_eq!(outcomes.len(), 25);
        let ids: HashSet<_> = outcomes.iter().map(|o| o.request.id.clone()).collect();
        assert_eq!(ids.len(), 25);
        assert!(outcomes.iter().all(|o| o.is_success() && o.attempts == 1));
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_max_workers() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(10)));
        let runner = BatchRunner::new(generator.clone(), fast_config(3)).unwrap();

        let run = runner.run(requests(30), CancellationToken::new());
        let outcomes = run.collect_all().await;

        assert_eq!(outcomes.len(), 30);
        assert!(generator.peak.load(Ordering::SeqCst) <= 3);
        assert!(generator.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_with_backoff() {
        let generator =
            Arc::new(ScriptedGenerator::new(Duration::ZERO).fail_transiently("req-0", 2));
        let config = fast_config(1).with_retry(
            RetryPolicy::new(3, Duration::from_millis(20)).with_max_retry_jitter(Duration::ZERO),
        );
        let runner = BatchRunner::new(generator, config).unwrap();

        let started = Instant::now();
        let outcomes = runner.run(requests(1), CancellationToken::new()).collect_all().await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].attempts, 3);
        // 20ms after the first failure, 40ms after the second
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_failed_outcome() {
        let generator =
            Arc::new(ScriptedGenerator::new(Duration::ZERO).fail_transiently("req-0", 10));
        let runner = BatchRunner::new(generator, fast_config(1)).unwrap();

        let outcomes = runner.run(requests(1), CancellationToken::new()).collect_all().await;

        assert_eq!(outcomes[0].attempts, 4);
        assert!(matches!(
            outcomes[0].status,
            OutcomeStatus::Failed {
                retries_exhausted: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried_and_isolated() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO).fail_permanently("req-2"));
        let runner = BatchRunner::new(generator.clone(), fast_config(2)).unwrap();

        let run = runner.run(requests(5), CancellationToken::new());
        let outcomes = run.collect_all().await;

        assert_eq!(outcomes.len(), 5);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request.id, "req-2");
        assert_eq!(failed[0].attempts, 1);
        assert_eq!(
            failed[0].error(),
            Some(&CallError::Permanent("400 Bad Request".into()))
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_panicking_generator_fails_only_its_request() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO).panic_on("req-1"));
        let runner = BatchRunner::new(generator, fast_config(2)).unwrap();

        let outcomes = runner.run(requests(4), CancellationToken::new()).collect_all().await;

        assert_eq!(outcomes.len(), 4);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request.id, "req-1");
    }

    #[tokio::test]
    async fn test_duplicate_requests_are_independent() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let runner = BatchRunner::new(generator.clone(), fast_config(2)).unwrap();
        let request = Request::new("same", "samurai vs T-rex");

        let outcomes = runner
            .run(vec![request.clone(), request], CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capacity_one_queue_completes() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(1)));
        let runner =
            BatchRunner::new(generator, fast_config(2).with_queue_capacity(1)).unwrap();

        let outcomes = runner.run(requests(12), CancellationToken::new()).collect_all().await;
        assert_eq!(outcomes.len(), 12);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_secs(10)));
        let runner = BatchRunner::new(generator, fast_config(1).with_queue_capacity(2)).unwrap();

        let run = runner.run(requests(1000), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // one request in the worker, two queued, one waiting for a slot
        let stats = run.stats();
        assert!(stats.submitted <= 2 + 1 + 1, "submitted {}", stats.submitted);
        assert!(stats.submitted >= 3);
        run.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_reports_every_request() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(100)));
        let runner = BatchRunner::new(generator, fast_config(2).with_queue_capacity(4)).unwrap();
        let cancel = CancellationToken::new();

        let run = runner.run(requests(50), cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcomes = run.collect_all().await;

        assert_eq!(outcomes.len(), 50);
        let ids: HashSet<_> = outcomes.iter().map(|o| o.request.id.clone()).collect();
        assert_eq!(ids.len(), 50);
        let cancelled = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Cancelled)
            .count();
        assert!(cancelled >= 40);
        // the calls already in flight when cancel fired are allowed to finish
        assert!(outcomes.iter().filter(|o| o.is_success()).count() <= 2);
    }

    #[tokio::test]
    async fn test_stats_after_run() {
        let generator =
            Arc::new(ScriptedGenerator::new(Duration::ZERO).fail_transiently("req-0", 1));
        let runner = BatchRunner::new(generator, fast_config(2)).unwrap();

        let mut run = runner.run(requests(6), CancellationToken::new());
        let mut seen = 0;
        while let Some(_outcome) = run.next().await {
            seen += 1;
        }
        let stats = run.stats();

        assert_eq!(seen, 6);
        assert_eq!(stats.submitted, 6);
        assert_eq!(stats.succeeded, 6);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.active_workers, 0);
        assert!(stats.peak_active_workers <= 2);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let runner = BatchRunner::new(generator, fast_config(3)).unwrap();

        let outcomes = runner
            .run(Vec::<Request>::new(), CancellationToken::new())
            .collect_all()
            .await;
        assert!(outcomes.is_empty());
    }
}
