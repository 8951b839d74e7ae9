//! Retry policy: backoff computation and retry eligibility.
//!
//! The decision is a pure function of the failure classification and the
//! task's counters, so it can be unit-tested without performing any I/O.
//! Randomness only enters through the jitter sample, which callers may pin.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::RetryConfig;
use crate::tools::ErrorClass;

/// What a failed attempt looks like to the policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureKind {
    /// The handler ran (or validation failed) and the error was classified
    Attempt {
        class: ErrorClass,
        /// Server-supplied minimum delay, honored for rate limits
        retry_after: Option<Duration>,
    },
    /// Rejected by an open circuit; `retry_in` is the remaining cooldown
    CircuitOpen { retry_in: Duration },
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Re-queue the task after `delay`
    Retry { delay: Duration },
    /// Fail the task now
    GiveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// Permanent or unknown failure
    NotRetryable,
    AttemptsExhausted,
    DeferralsExhausted,
}

impl std::fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRetryable => write!(f, "not retryable"),
            Self::AttemptsExhausted => write!(f, "attempts exhausted"),
            Self::DeferralsExhausted => write!(f, "circuit deferrals exhausted"),
        }
    }
}

/// Exponential backoff with jitter.
///
/// `delay = min(max_delay, base * 2^(attempt - 1)) * (1 - jitter * sample)`
/// where `sample` is uniform in `[0, 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    max_circuit_deferrals: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter.clamp(0.0, 1.0),
            max_circuit_deferrals: config.max_circuit_deferrals,
        }
    }
}

impl RetryPolicy {
    pub fn max_circuit_deferrals(&self) -> u32 {
        self.max_circuit_deferrals
    }

    /// Backoff before the retry that follows attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let factor = 1.0 - self.jitter * jitter_sample.clamp(0.0, 1.0);
        if factor >= 1.0 {
            return raw;
        }
        raw.mul_f64(factor)
    }

    /// Decide whether a task gets another attempt.
    ///
    /// `attempts` is the task's attempt count including the one that just
    /// failed; `deferrals` likewise counts circuit-open rejections.
    pub fn decide(
        &self,
        failure: FailureKind,
        attempts: u32,
        max_attempts: u32,
        deferrals: u32,
    ) -> RetryDecision {
        self.decide_with(failure, attempts, max_attempts, deferrals, rand::thread_rng().gen())
    }

    /// [`decide`](Self::decide) with a fixed jitter sample in `[0, 1)`.
    pub fn decide_with(
        &self,
        failure: FailureKind,
        attempts: u32,
        max_attempts: u32,
        deferrals: u32,
        jitter_sample: f64,
    ) -> RetryDecision {
        match failure {
            FailureKind::Attempt { class, retry_after } => {
                if !class.is_retryable() {
                    return RetryDecision::GiveUp {
                        reason: GiveUpReason::NotRetryable,
                    };
                }
                if attempts >= max_attempts {
                    return RetryDecision::GiveUp {
                        reason: GiveUpReason::AttemptsExhausted,
                    };
                }
                let delay = match (class, retry_after) {
                    (ErrorClass::RateLimited, Some(hint)) => hint,
                    _ => self.backoff(attempts.max(1), jitter_sample),
                };
                RetryDecision::Retry { delay }
            }
            FailureKind::CircuitOpen { retry_in } => {
                if deferrals >= self.max_circuit_deferrals {
                    return RetryDecision::GiveUp {
                        reason: GiveUpReason::DeferralsExhausted,
                    };
                }
                // Extended backoff: never wake before the breaker could admit us
                let backoff = self.backoff(attempts.max(1), jitter_sample);
                RetryDecision::Retry {
                    delay: backoff.max(retry_in),
                }
            }
        }
    }
}
