use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::error::CallError;
use crate::publish::{Publisher, Receipt};

/// Publisher that logs each post and returns a synthetic receipt.
#[derive(Debug, Default)]
pub struct DryRunPublisher {
    posted: AtomicU64,
}

impl DryRunPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of posts accepted so far.
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(&self, text: &str, media: Option<&str>) -> Result<Receipt, CallError> {
        let n = self.posted.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            seq = n,
            chars = text.chars().count(),
            media = media.unwrap_or("-"),
            "[dry-run] would publish: {}",
            text
        );
        Ok(Receipt::new(format!("dry-run-{}", n)))
    }
}
