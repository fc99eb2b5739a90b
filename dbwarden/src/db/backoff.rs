//! Exponential backoff with jitter and a wall-clock budget.

use std::time::Duration;

use rand::prelude::RngExt;
use rand::rng;
use tokio::time::Instant;

use crate::config::RetrySettings;

/// Yields successively longer, randomized waits until the elapsed budget runs out.
///
/// The final wait is clamped so the last attempt lands on the budget boundary rather than
/// overshooting it; after that [`ExponentialBackoff::next_backoff`] returns `None`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: RetrySettings,
    current_interval: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            current_interval: settings.initial_interval,
            settings,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn max_elapsed_time(&self) -> Duration {
        self.settings.max_elapsed_time
    }

    /// The next wait, or `None` once the budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let remaining = self.settings.max_elapsed_time.checked_sub(self.elapsed())?;
        if remaining.is_zero() {
            return None;
        }

        let wait = randomize(self.current_interval, self.settings.randomization_factor);
        self.current_interval = self
            .current_interval
            .mul_f64(self.settings.multiplier)
            .min(self.settings.max_interval);

        Some(wait.min(remaining))
    }
}

/// Pick uniformly from `interval * [1 - factor, 1 + factor]`.
fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let delta = interval.as_secs_f64() * factor;
    let low = interval.as_secs_f64() - delta;
    let spread = rng().random_range(0.0..1.0) * 2.0 * delta;
    Duration::from_secs_f64((low + spread).max(0.0))
}
