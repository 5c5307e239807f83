//! Jobs and their durable state.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use store::{JobError, JobFilter, JobStore};
pub use types::{
    EncodeProgress, EncodeState, ErrorDescriptor, ErrorKind, Job, JobArtifacts, JobOptions,
    PasswordCandidate, Stage, StageAttempts, StageStatus,
};
