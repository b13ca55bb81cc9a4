//! Bounded-concurrency batch generation.
//!
//! - **Request / Artifact / Outcome**: the values flowing through a run
//! - **BatchRunner**: spawns a producer and a fixed pool of workers per run
//! - **BatchRun**: the run handle, a stream of outcomes in completion order
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │ (request it) │
//!                      └──────┬───────┘
//!                             │ blocks when full
//!                      ┌──────▼───────┐
//!                      │   Bounded    │
//!                      │    Queue     │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                      ┌──────────────┐
//!                      │ Outcome chan │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use roast_forge::retry::CancellationToken;
//! use roast_forge::scheduler::{BatchConfig, BatchRunner, Request};
//! use futures::StreamExt;
//!
//! let runner = BatchRunner::new(generator, BatchConfig::new(8))?;
//! let requests = vec![Request::new("r1", "samurai vs T-rex")];
//!
//! let mut run = runner.run(requests, CancellationToken::new());
//! while let Some(outcome) = run.next().await {
//!     println!("{} -> {}", outcome.request.id, outcome.status.label());
//! }
//! ```
//!
//! # Reliability
//!
//! - **No silent loss**: every request yields exactly one outcome, including
//!   requests that were still queued or unsubmitted when the run was cancelled
//! - **Failure isolation**: a failed or panicking request never stops the batch
//! - **Backpressure**: a slow consumer stalls workers, which stalls the producer

pub mod job;
pub mod worker_pool;

pub use job::{Artifact, Outcome, OutcomeStatus, Request};
pub use worker_pool::{BatchConfig, BatchRun, BatchRunner, Generator, PoolStats};
