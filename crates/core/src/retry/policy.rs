//! Retry decisions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{ErrorKind, Stage};

use super::config::RetryConfig;

/// What to do with a failed stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Run the stage again after `delay`. `counted` is false for transport
    /// failures below the ceiling, which do not consume attempt budget.
    Retry { delay: Duration, counted: bool },
    /// Switch Encode to the other worker class with a fresh budget.
    Fallback,
    /// Stop and fail the job.
    GiveUp,
}

impl RetryDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryDecision::Retry { counted: true, .. } => "retry",
            RetryDecision::Retry { counted: false, .. } => "retry_uncounted",
            RetryDecision::Fallback => "fallback",
            RetryDecision::GiveUp => "give_up",
        }
    }
}

/// Attempt counters for the failure being decided, the failure itself
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttemptState {
    /// Counted attempts on the stage (Encode: on the current worker class)
    /// if this failure is counted.
    pub attempts: u32,
    /// Consecutive transport failures including this one.
    pub transport_failures: u32,
    /// Whether Encode may still switch worker class.
    pub fallback_available: bool,
}

/// Pure retry policy over [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Highest value `attempts[stage]` may reach before the job fails or
    /// moves on.
    pub fn ceiling(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Encode => self.config.encode_attempts_per_class.saturating_mul(2),
            _ => self.config.max_attempts,
        }
    }

    pub fn decide(&self, stage: Stage, state: &AttemptState, kind: ErrorKind) -> RetryDecision {
        match kind {
            ErrorKind::IdentifyAmbiguous | ErrorKind::Cancelled => return RetryDecision::GiveUp,
            ErrorKind::TransportError
                if stage == Stage::Encode
                    && state.transport_failures < self.config.transport_retry_ceiling =>
            {
                return RetryDecision::Retry {
                    delay: Duration::ZERO,
                    counted: false,
                };
            }
            _ => {}
        }

        if stage == Stage::Encode {
            if state.attempts < self.config.encode_attempts_per_class {
                RetryDecision::Retry {
                    delay: self.backoff_delay(state.attempts),
                    counted: true,
                }
            } else if state.fallback_available {
                RetryDecision::Fallback
            } else {
                RetryDecision::GiveUp
            }
        } else if state.attempts < self.config.max_attempts {
            RetryDecision::Retry {
                delay: self.backoff_delay(state.attempts),
                counted: true,
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Delay after the `attempt`-th counted failure:
    /// `initial * multiplier^(attempt - 1)`, capped at the maximum.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.config.initial_delay_secs as f64
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.config.max_delay_secs as f64);
        Duration::from_secs_f64(capped.max(0.0))
    }
}
