//! Jittered pacing before outbound calls.

use std::sync::Mutex;
use std::time::Duration;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

/// Default lower bound of the pacing window.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound of the pacing window.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Pacing policy that spreads outbound calls across a uniform jitter window.
///
/// Holds no call history: every delay is an independent uniform draw, so
/// concurrent workers do not line up into synchronized bursts. A seeded
/// limiter draws from a ChaCha8 stream for reproducible runs.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    max_delay: Duration,
    rng: Option<Mutex<ChaCha8Rng>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter {
    /// Creates a limiter drawing from `[min_delay, max_delay]`.
    ///
    /// Bounds given in the wrong order are swapped.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let (min_delay, max_delay) = if min_delay <= max_delay {
            (min_delay, max_delay)
        } else {
            (max_delay, min_delay)
        };
        Self {
            min_delay,
            max_delay,
            rng: None,
        }
    }

    /// Creates a limiter with a deterministic jitter stream.
    pub fn seeded(min_delay: Duration, max_delay: Duration, seed: u64) -> Self {
        let mut limiter = Self::new(min_delay, max_delay);
        limiter.rng = Some(Mutex::new(ChaCha8Rng::seed_from_u64(seed)));
        limiter
    }

    /// A limiter that never delays before calls.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay to wait before the next outbound call.
    pub fn next_delay(&self) -> Duration {
        self.uniform(self.min_delay, self.max_delay)
    }

    /// Random offset in `[0, max]` added to retry backoff.
    pub fn jitter(&self, max: Duration) -> Duration {
        self.uniform(Duration::ZERO, max)
    }

    fn uniform(&self, low: Duration, high: Duration) -> Duration {
        if high <= low {
            return low;
        }
        let range = low.as_secs_f64()..=high.as_secs_f64();
        let secs = match &self.rng {
            Some(rng) => {
                let mut rng = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                rng.random_range(range)
            }
            None => rand::rng().random_range(range),
        };
        Duration::try_from_secs_f64(secs)
            .unwrap_or(high)
            .clamp(low, high)
    }
}
