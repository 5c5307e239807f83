//! Non-encode pipeline stages: collaborator interfaces, the executor that
//! wraps them, and filesystem implementations.

mod builtin;
mod config;
mod executor;
mod traits;
mod types;

pub use builtin::{FileNameIdentifier, FsOrganizer, LocalFileAcquirer, PassthroughExtractor};
pub use config::{LibraryConfig, StageTimeouts, StagesConfig};
pub use executor::StageExecutor;
pub use traits::{AcquireService, ExtractService, IdentifyService, OrganizeService, StageServices};
pub use types::{MediaRef, StageInput, StageOutcome, StagePayload};
