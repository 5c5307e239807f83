//! Encoding workers: the client protocol, the local ffmpeg worker and the
//! remote HTTP worker.

mod config;
mod error;
mod local;
mod remote;
mod traits;
mod types;

pub use config::{EncodingConfig, LocalEncoderConfig, RemoteWorkerConfig};
pub use error::EncoderError;
pub use local::LocalEncoderClient;
pub use remote::RemoteEncoderClient;
pub use traits::EncodingWorkerClient;
pub use types::{
    pick_accel, AudioCodec, Container, EncodeHandle, EncodeParams, EncodePoll, EncodeRequest,
    EncodeStatus, VideoCodec,
};
