//! Retry policy as data: attempt counts and remaining budget in, decision out.
//!
//! The invoker owns the clock and the sleeping; this module only answers
//! "given what has happened so far, what next?". Keeping the decision pure
//! lets tests walk the whole backoff schedule without waiting on timers.
//!
//! With the defaults (1 s initial delay, factor 2, 3 retries) the schedule
//! before jitter is 1 s → 2 s → 4 s. Jitter multiplies each delay by a
//! uniform factor in `[0.5, 1.5]` so concurrent requests that failed together
//! do not retry together.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower and upper bound of the jitter multiplier.
pub const JITTER_RANGE: (f64, f64) = (0.5, 1.5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. Default: 3 (4 attempts total).
    pub max_retries: u32,
    /// Delay before the first retry. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied per retry. Default: 2.0.
    pub backoff_factor: f64,
    /// Randomise each delay within [`JITTER_RANGE`]. Default: true.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

/// What the invoker should do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then attempt again.
    Retry { delay: Duration },
    /// The retry budget is spent.
    Exhausted,
    /// Sleeping for `delay` would reach the deadline; abort now.
    OutOfBudget { delay: Duration, remaining: Duration },
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry_index` (0-based).
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let exp = i32::try_from(retry_index).unwrap_or(i32::MAX);
        saturating_scale(self.initial_delay, self.backoff_factor.powi(exp))
    }

    /// Draw a jitter multiplier, or `1.0` when jitter is disabled.
    pub fn sample_jitter(&self) -> f64 {
        if self.jitter {
            rand::thread_rng().gen_range(JITTER_RANGE.0..=JITTER_RANGE.1)
        } else {
            1.0
        }
    }

    /// Decide the next step after `retries_used` retries have already been
    /// made and the latest attempt failed transiently.
    ///
    /// `jitter_factor` is clamped into [`JITTER_RANGE`].
    pub fn decide(&self, retries_used: u32, remaining: Duration, jitter_factor: f64) -> RetryDecision {
        if retries_used >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        let factor = jitter_factor.clamp(JITTER_RANGE.0, JITTER_RANGE.1);
        let delay = saturating_scale(self.base_delay(retries_used), factor);
        if delay >= remaining {
            return RetryDecision::OutOfBudget { delay, remaining };
        }
        RetryDecision::Retry { delay }
    }
}

fn saturating_scale(d: Duration, factor: f64) -> Duration {
    if d.is_zero() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
