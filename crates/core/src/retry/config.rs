//! Retry configuration.

use serde::{Deserialize, Serialize};

/// Retry ceilings and backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum counted attempts for Acquire, Extract, Identify and Organize.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in seconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Maximum delay between retries in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Counted Encode attempts allowed on one worker class before falling
    /// back to the other class.
    #[serde(default = "default_encode_attempts_per_class")]
    pub encode_attempts_per_class: u32,

    /// Consecutive transport failures that are retried for free. The one
    /// reaching this number is counted as a normal failure.
    #[serde(default = "default_transport_ceiling")]
    pub transport_retry_ceiling: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    30
}

fn default_max_delay() -> u64 {
    1800 // 30 minutes
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_encode_attempts_per_class() -> u32 {
    2
}

fn default_transport_ceiling() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            encode_attempts_per_class: default_encode_attempts_per_class(),
            transport_retry_ceiling: default_transport_ceiling(),
        }
    }
}

impl RetryConfig {
    /// Sets the attempt ceiling for non-encode stages.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Sets the backoff delays.
    pub fn with_delays(mut self, initial_secs: u64, max_secs: u64) -> Self {
        self.initial_delay_secs = initial_secs;
        self.max_delay_secs = max_secs;
        self
    }

    /// Sets the per-class encode budget.
    pub fn with_encode_attempts_per_class(mut self, attempts: u32) -> Self {
        self.encode_attempts_per_class = attempts;
        self
    }

    /// Sets the transport retry ceiling.
    pub fn with_transport_ceiling(mut self, ceiling: u32) -> Self {
        self.transport_retry_ceiling = ceiling;
        self
    }
}
