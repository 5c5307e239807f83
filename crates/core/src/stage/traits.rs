//! Collaborator interfaces for the non-encode stages.
//!
//! Implementations must not retry internally. They classify failures in the
//! returned [`StageOutcome`] and leave retries to the orchestrator.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::{MediaRef, StageOutcome};

/// Fetches the raw item named by a job's source reference.
#[async_trait]
pub trait AcquireService: Send + Sync {
    async fn fetch(&self, source_ref: &str) -> StageOutcome;
}

/// Unpacks an acquired item, trying password candidates in the given order.
#[async_trait]
pub trait ExtractService: Send + Sync {
    async fn extract(&self, item: &MediaRef, password_candidates: &[String]) -> StageOutcome;
}

/// Resolves metadata for a media file. No match or an ambiguous match is
/// reported as a non-retryable `IdentifyAmbiguous` failure.
#[async_trait]
pub trait IdentifyService: Send + Sync {
    async fn identify(&self, media: &MediaRef) -> StageOutcome;
}

/// Moves a finished file into the library.
#[async_trait]
pub trait OrganizeService: Send + Sync {
    async fn place(
        &self,
        media: &MediaRef,
        metadata: Option<&serde_json::Value>,
        dest_dir: Option<&Path>,
    ) -> StageOutcome;
}

/// The collaborators used by a [`StageExecutor`](super::StageExecutor).
#[derive(Clone)]
pub struct StageServices {
    pub acquire: Arc<dyn AcquireService>,
    pub extract: Arc<dyn ExtractService>,
    pub identify: Arc<dyn IdentifyService>,
    pub organize: Arc<dyn OrganizeService>,
}
