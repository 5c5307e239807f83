//! Stage execution types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::job::{ErrorDescriptor, ErrorKind, Job};

/// Reference to a media file on the orchestrator host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl MediaRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size_bytes: None,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name as a string, empty when the path has none.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// What a successful stage produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StagePayload {
    #[default]
    None,
    Media(MediaRef),
    Metadata(serde_json::Value),
}

/// Uniform result of one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub retryable: bool,
    pub message: Option<String>,
    #[serde(default)]
    pub output: StagePayload,
}

impl StageOutcome {
    pub fn succeeded(output: StagePayload) -> Self {
        Self {
            success: true,
            error_kind: None,
            retryable: false,
            message: None,
            output,
        }
    }

    /// A failure the retry policy may retry.
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            retryable: true,
            message: Some(message.into()),
            output: StagePayload::None,
        }
    }

    /// A failure that fails the job immediately.
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::failed(kind, message)
        }
    }

    pub fn cancelled() -> Self {
        Self::fatal(ErrorKind::Cancelled, "cancelled")
    }

    /// Error descriptor for a failed outcome; `fallback` names the kind used
    /// when the collaborator did not classify the failure.
    pub fn error(&self, fallback: ErrorKind) -> Option<ErrorDescriptor> {
        if self.success {
            return None;
        }
        let kind = self.error_kind.unwrap_or(fallback);
        Some(ErrorDescriptor::new(
            kind,
            self.message.clone().unwrap_or_default(),
        ))
    }
}

/// Everything a stage collaborator needs for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInput {
    pub job_id: String,
    pub source_ref: String,
    /// 1-based counted attempt number this execution would be.
    pub attempt: u32,
    pub media: Option<MediaRef>,
    pub metadata: Option<serde_json::Value>,
    pub passwords: Vec<String>,
    pub dest_dir: Option<PathBuf>,
}

impl StageInput {
    pub fn from_job(job: &Job, attempt: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            source_ref: job.source_ref.clone(),
            attempt,
            media: job.artifacts.current_media().cloned(),
            metadata: job.artifacts.metadata.clone(),
            passwords: job.options.ordered_passwords(),
            dest_dir: job.options.dest_dir.clone(),
        }
    }

    /// Password candidates starting at the one for this attempt, so that
    /// successive attempts lead with successive candidates.
    pub fn rotated_passwords(&self) -> Vec<String> {
        let mut passwords = self.passwords.clone();
        if !passwords.is_empty() {
            let shift = (self.attempt.saturating_sub(1) as usize) % passwords.len();
            passwords.rotate_left(shift);
        }
        passwords
    }
}
