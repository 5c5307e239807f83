//! Encoding worker protocol.

use std::path::Path;

use async_trait::async_trait;

use crate::stage::MediaRef;

use super::error::EncoderError;
use super::types::{EncodeHandle, EncodePoll, EncodeRequest};

/// Client for one encoding worker, local or remote.
///
/// Progress is pulled with [`poll`](Self::poll). Implementations never retry
/// internally; failures are classified through [`EncoderError::kind`].
#[async_trait]
pub trait EncodingWorkerClient: Send + Sync {
    /// Registry id of the worker this client talks to.
    fn worker_id(&self) -> &str;

    /// Cheap reachability probe used by heartbeats.
    async fn health(&self) -> Result<(), EncoderError>;

    /// Hand the input to the worker and start encoding.
    async fn submit(&self, request: EncodeRequest) -> Result<EncodeHandle, EncoderError>;

    async fn poll(&self, handle: &EncodeHandle) -> Result<EncodePoll, EncoderError>;

    /// Stop the encode and discard its output. Cancelling an encode the
    /// worker no longer knows about is not an error.
    async fn cancel(&self, handle: &EncodeHandle) -> Result<(), EncoderError>;

    /// Fetch the finished output into `dest_dir`.
    async fn retrieve_output(
        &self,
        handle: &EncodeHandle,
        dest_dir: &Path,
    ) -> Result<MediaRef, EncoderError>;
}
