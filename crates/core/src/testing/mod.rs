//! Testing utilities and mock implementations.
//!
//! Mocks for every collaborator the orchestrator talks to, so pipelines can
//! be exercised end to end without ffmpeg, remote workers or real media.
//!
//! # Example
//!
//! ```rust,ignore
//! use mediarelay_core::testing::{MockEncoderClient, MockEncodeBehavior, MockStageServices};
//!
//! let stages = MockStageServices::new();
//! let remote = MockEncoderClient::new("remote-a");
//! remote.push_behavior(MockEncodeBehavior::FailEncode).await;
//! ```

mod mock_encoder;
mod mock_stages;

pub use mock_encoder::{MockEncodeBehavior, MockEncoderClient};
pub use mock_stages::MockStageServices;
