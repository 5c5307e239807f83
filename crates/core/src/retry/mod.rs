//! Retry policy: maps a stage failure to retry, fallback or give up.

mod config;
mod policy;

pub use config::RetryConfig;
pub use policy::{AttemptState, RetryDecision, RetryPolicy};
