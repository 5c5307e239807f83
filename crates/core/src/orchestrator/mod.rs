//! Pipeline orchestrator.
//!
//! Moves jobs through Acquire, Extract, Encode, Identify and Organize,
//! applying the retry policy and dispatching encodes to workers.

mod config;
mod dispatch;
mod runner;
mod scheduler;
mod types;

pub use config::{OrchestratorConfig, StageConcurrency};
pub use dispatch::drive_encode;
pub use runner::PipelineOrchestrator;
pub use scheduler::{PipelineScheduler, SchedulerSettings};
pub use types::{
    Dispatch, DispatchReport, DispatchWork, OrchestratorError, OrchestratorStatus, ProgressUpdate,
};
