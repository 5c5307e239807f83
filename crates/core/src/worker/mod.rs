//! Encoding worker registry.
//!
//! Workers are never persisted. The registry is rebuilt from configuration
//! at startup and kept current by heartbeats.

mod registry;
mod selection;
mod types;

pub use registry::{LivenessCell, LivenessTransition, WorkerRegistry, DEFAULT_MISS_THRESHOLD};
pub use selection::select_candidate;
pub use types::{HardwareAccel, Liveness, WorkerClass, WorkerPreference, WorkerRecord, WorkerSpec};
