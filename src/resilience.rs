//! Backoff and cancellation utilities for reconnection polling.
//!
//! - [`BackoffConfig`]: capped exponential backoff within a total budget
//! - [`cancellable_sleep`]: a sleep that ends early when a shutdown flag flips
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use affinity_engine::resilience::{cancellable_sleep, BackoffConfig};
//! use tokio::sync::watch;
//!
//! let backoff = BackoffConfig::default();
//! let (_cancel_tx, mut cancel_rx) = watch::channel(false);
//!
//! for attempt in 1..=3 {
//!     // probe().await ...
//!     if !cancellable_sleep(backoff.delay_for_attempt(attempt), &mut cancel_rx).await {
//!         break; // cancelled
//!     }
//! }
//! # }
//! ```

use crate::config::ReconnectPolicy;
use std::time::Duration;
use tokio::sync::watch;

/// Configuration for reconnection backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Maximum delay between attempts (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Total time budget across all attempts.
    pub max_duration: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(&ReconnectPolicy::default())
    }
}

impl From<&ReconnectPolicy> for BackoffConfig {
    fn from(policy: &ReconnectPolicy) -> Self {
        Self {
            initial_delay: policy.backoff_base(),
            max_delay: policy.max_backoff(),
            backoff_factor: policy.backoff_factor,
            max_duration: policy.max_duration(),
        }
    }
}

impl BackoffConfig {
    /// Fast-fail backoff for tests.
    pub fn testing() -> Self {
        Self::from(&ReconnectPolicy::testing())
    }

    /// Calculate delay for a given attempt number (1-indexed).
    ///
    /// ```text
    /// Attempt  Delay (defaults)
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// 4        8s
    /// 5        16s
    /// 6+       30s (cap)
    /// ```
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent so powi never overflows to inf for huge attempts.
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Delay for `attempt`, clipped so it never runs past the budget.
    ///
    /// Returns `None` once `elapsed` has used up the budget.
    pub fn next_delay(&self, attempt: usize, elapsed: Duration) -> Option<Duration> {
        let remaining = self.max_duration.checked_sub(elapsed)?;
        if remaining.is_zero() {
            return None;
        }
        Some(std::cmp::min(self.delay_for_attempt(attempt), remaining))
    }
}

/// Sleep for `delay` unless the cancellation flag is (or becomes) `true`.
///
/// Returns `true` if the full delay elapsed, `false` if cancelled. A closed
/// cancellation channel counts as cancelled.
pub async fn cancellable_sleep(delay: Duration, cancel_rx: &mut watch::Receiver<bool>) -> bool {
    if *cancel_rx.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return false;
                }
            }
        }
    }
}
