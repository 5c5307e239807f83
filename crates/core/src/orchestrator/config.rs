//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::Stage;

/// Configuration for the pipeline orchestrator (`[orchestrator]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Start the scheduling loop with the server.
    /// When disabled, jobs are accepted but nothing runs until started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to look for due jobs (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How often every worker is probed for liveness.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Deadline for a single health probe; exceeding it counts as a miss.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Consecutive missed heartbeats before a worker is marked offline.
    #[serde(default = "default_miss_threshold")]
    pub heartbeat_miss_threshold: u32,

    /// Maximum stage executions in flight across all jobs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_dispatches: usize,

    /// Maximum executions in flight per stage.
    #[serde(default)]
    pub stage_concurrency: StageConcurrency,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    1000 // 1 second
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    10
}

fn default_miss_threshold() -> u32 {
    crate::worker::DEFAULT_MISS_THRESHOLD
}

fn default_max_concurrent() -> usize {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            heartbeat_miss_threshold: default_miss_threshold(),
            max_concurrent_dispatches: default_max_concurrent(),
            stage_concurrency: StageConcurrency::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_dispatches = max;
        self
    }
}

/// Per-stage concurrency caps (`[orchestrator.stage_concurrency]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConcurrency {
    #[serde(default = "default_acquire")]
    pub acquire: usize,
    #[serde(default = "default_extract")]
    pub extract: usize,
    #[serde(default = "default_encode")]
    pub encode: usize,
    #[serde(default = "default_identify")]
    pub identify: usize,
    #[serde(default = "default_organize")]
    pub organize: usize,
}

fn default_acquire() -> usize {
    4
}

fn default_extract() -> usize {
    2
}

fn default_encode() -> usize {
    4
}

fn default_identify() -> usize {
    4
}

fn default_organize() -> usize {
    2
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            acquire: default_acquire(),
            extract: default_extract(),
            encode: default_encode(),
            identify: default_identify(),
            organize: default_organize(),
        }
    }
}

impl StageConcurrency {
    /// Cap for a work stage; terminal stages never run.
    pub fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Acquire => self.acquire,
            Stage::Extract => self.extract,
            Stage::Encode => self.encode,
            Stage::Identify => self.identify,
            Stage::Organize => self.organize,
            Stage::Done | Stage::Failed => 0,
        }
    }

    /// The same cap for every stage.
    pub fn uniform(cap: usize) -> Self {
        Self {
            acquire: cap,
            extract: cap,
            encode: cap,
            identify: cap,
            organize: cap,
        }
    }
}
