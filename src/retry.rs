//! Retry classification and backoff policy
//!
//! A pure component: given an error and the attempt number it decides
//! whether to retry and how long to sleep first. No shared counters; the
//! per-item `attempt_count` lives on the checkpointed item record.

use crate::config::RetryConfig;
use crate::error::{CaptureError, ErrorCategory};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Ephemeral outcome of classifying one failure
///
/// `delay` is `None` when the error must not be retried, either because it
/// is permanent or because the attempt budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub category: ErrorCategory,
    pub delay: Option<Duration>,
}

/// Classification plus exponential backoff
///
/// Delay for attempt `n` (1-based) is `base * multiplier^(n-1)`, clamped to
/// `max_delay`, with optional ±20% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, max_attempts: usize) -> Self {
        Self {
            base: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Classify an error into transient / permanent / unknown.
    pub fn classify(&self, error: &CaptureError) -> ErrorCategory {
        error.category()
    }

    /// Backoff delay before retrying after the given attempt (1-based).
    pub fn next_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let mut delay = Duration::from_millis(millis as u64).min(self.max_delay);

        if self.jitter {
            delay = apply_jitter(delay);
        }
        delay
    }

    /// Full decision for one failed attempt.
    ///
    /// Permanent errors are never retried; transient and unknown errors are
    /// retried while attempts remain.
    pub fn decide(&self, error: &CaptureError, attempt: usize) -> RetryDecision {
        let category = self.classify(error);
        let delay = match category {
            ErrorCategory::Permanent => None,
            ErrorCategory::Transient | ErrorCategory::Unknown => {
                if attempt < self.max_attempts {
                    Some(self.next_delay(attempt))
                } else {
                    None
                }
            }
        };
        RetryDecision { category, delay }
    }
}

/// Scale a delay by a factor in [0.8, 1.2] derived from the clock's
/// sub-second noise, so workers retrying the same host spread out.
fn apply_jitter(delay: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let factor = 0.8 + (nanos % 1000) as f64 / 1000.0 * 0.4;
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}
