//! Request, artifact and outcome definitions for batch generation.
//!
//! A [`Request`] is consumed exactly once by a batch run and always comes
//! back as exactly one [`Outcome`]: succeeded with an [`Artifact`], failed,
//! or cancelled.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// A single generation request (one prompt variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier within a batch.
    pub id: String,
    /// Opaque request body forwarded to the generation service.
    pub payload: String,
    /// Free-form tags, e.g. the mutation strategy that produced the variant.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Request {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub request_id: String,
    /// URI of the generated media.
    pub locator: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(request_id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            locator: locator.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Terminal state of a request within a batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Succeeded(Artifact),
    Failed {
        error: CallError,
        /// True when the error was transient and every retry was spent.
        retries_exhausted: bool,
    },
    /// The run was cancelled before this request could complete.
    Cancelled,
}

impl OutcomeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded(_) => "succeeded",
            OutcomeStatus::Failed { .. } => "failed",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one request, emitted in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub request: Request,
    pub status: OutcomeStatus,
    /// Number of Generate calls made for this request.
    pub attempts: u32,
    /// Worker that processed the request; `None` if it was never dequeued.
    pub worker_id: Option<String>,
    pub duration: Duration,
}

impl Outcome {
    /// Outcome for a request that no worker picked up before cancellation.
    pub fn never_started(request: Request) -> Self {
        Self {
            request,
            status: OutcomeStatus::Cancelled,
            attempts: 0,
            worker_id: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Succeeded(_))
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match &self.status {
            OutcomeStatus::Succeeded(artifact) => Some(artifact),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        match &self.status {
            OutcomeStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}
