//! Retry decisions for failed item attempts.
//!
//! Pure functions: classify an error, then map `(class, attempt)` to either
//! a delayed retry or a permanent failure. The only source of randomness is
//! the jitter sample in [`RetryPolicy::decide`]; tests use
//! [`RetryPolicy::decide_with_jitter`] with a fixed sample.

use std::time::Duration;

use rand::Rng;

use crate::batch::DEFAULT_MAX_ATTEMPTS;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network timeouts, rate limiting, upstream 5xx.
    Transient,
    /// Validation failures, invalid credentials, content-policy rejections.
    Permanent,
}

/// Classify an HTTP status code returned by the external API.
///
/// 408, 425, 429 and every 5xx are transient; any other non-success status
/// is permanent.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        408 | 425 | 429 | 500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Fail,
}

/// Exponential backoff with jitter and a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed per item, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS as u32,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after attempt number `attempt` (1-based) failed.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        let unit: f64 = rand::rng().random();
        self.decide_with_jitter(class, attempt, unit)
    }

    /// Deterministic form of [`decide`](Self::decide). `jitter_unit` is a
    /// sample in `0.0..=1.0`.
    pub fn decide_with_jitter(&self, class: ErrorClass, attempt: u32, jitter_unit: f64) -> RetryDecision {
        match class {
            ErrorClass::Permanent => RetryDecision::Fail,
            ErrorClass::Transient if attempt >= self.max_attempts => RetryDecision::Fail,
            ErrorClass::Transient => RetryDecision::Retry {
                delay: self.jittered_delay(attempt, jitter_unit),
            },
        }
    }

    /// `base_delay * 2^attempt`, clamped to `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Equal jitter: half of the backoff is fixed, the other half scales
    /// with `jitter_unit`.
    pub fn jittered_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let capped = self.backoff(attempt);
        let half = capped / 2;
        half + half.mul_f64(jitter_unit.clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
