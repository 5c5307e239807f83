//! Error types for encoding worker clients.

use std::path::PathBuf;
use thiserror::Error;

use crate::job::ErrorKind;

/// Errors returned by [`EncodingWorkerClient`](super::EncodingWorkerClient)
/// implementations.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Worker unreachable or the exchange broke down.
    #[error("transport error talking to {worker_id}: {message}")]
    Transport { worker_id: String, message: String },

    /// The worker ran the encode and it failed, or refused the request.
    #[error("encode failed: {reason}")]
    EncodeFailed {
        reason: String,
        stderr: Option<String>,
    },

    #[error("encode timed out: {0}")]
    Timeout(String),

    #[error("FFmpeg not found at path: {path}")]
    FfmpegNotFound { path: PathBuf },

    #[error("input file not found: {path}")]
    InputNotFound { path: PathBuf },

    #[error("unknown encode handle: {0}")]
    UnknownHandle(String),

    #[error("output checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncoderError {
    pub fn transport(worker_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }

    pub fn encode_failed(reason: impl Into<String>, stderr: Option<String>) -> Self {
        Self::EncodeFailed {
            reason: reason.into(),
            stderr,
        }
    }

    /// Failure classification used by the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::TransportError,
            Self::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::EncodeError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EncoderError::transport("gpu", "refused").kind(),
            ErrorKind::TransportError
        );
        assert_eq!(
            EncoderError::Timeout("stalled".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            EncoderError::encode_failed("exit 1", None).kind(),
            ErrorKind::EncodeError
        );
        assert_eq!(
            EncoderError::UnknownHandle("x".into()).kind(),
            ErrorKind::EncodeError
        );
    }

    #[test]
    fn test_display() {
        let err = EncoderError::transport("gpu-1", "connection refused");
        assert_eq!(
            err.to_string(),
            "transport error talking to gpu-1: connection refused"
        );
    }
}
