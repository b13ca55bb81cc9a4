//! Pacing, retry and cancellation primitives shared by every remote call site.
//!
//! - **RateLimiter**: draws jittered delays for pre-call pacing and retry offsets
//! - **RetryPolicy**: per-attempt timeout plus exponential backoff on transient errors
//! - **CancellationToken**: run-level cancellation observed at every suspension point
//!
//! The same policy drives both the generation workers and the publication
//! gate, so the two call sites classify and back off identically.

mod cancel;
mod limiter;
mod policy;

pub use cancel::{cancellable_sleep, CancellationToken};
pub use limiter::{RateLimiter, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY};
pub use policy::{RetryFailure, RetryOutcome, RetryPolicy};
