//! Run-level cancellation.
//!
//! Runs share one [`CancellationToken`]; once cancelled it stays cancelled,
//! so a fresh token is needed for a new run.

use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Sleeps for `duration` unless `cancel` fires first.
///
/// Returns `true` when the full duration elapsed and `false` on cancellation.
pub async fn cancellable_sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
