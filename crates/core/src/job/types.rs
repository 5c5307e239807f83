//! Job domain types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoder::EncodeParams;
use crate::stage::MediaRef;
use crate::worker::{HardwareAccel, WorkerClass, WorkerPreference};

/// Pipeline position of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquire,
    Extract,
    Encode,
    Identify,
    Organize,
    Done,
    Failed,
}

impl Stage {
    /// Work stages in execution order.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Acquire,
        Stage::Extract,
        Stage::Encode,
        Stage::Identify,
        Stage::Organize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Extract => "extract",
            Stage::Encode => "encode",
            Stage::Identify => "identify",
            Stage::Organize => "organize",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// The work stage after this one, `None` after Organize and for
    /// terminal stages.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Acquire => Some(Stage::Extract),
            Stage::Extract => Some(Stage::Encode),
            Stage::Encode => Some(Stage::Identify),
            Stage::Identify => Some(Stage::Organize),
            Stage::Organize | Stage::Done | Stage::Failed => None,
        }
    }

    /// Error kind reported when a collaborator fails without naming one.
    pub fn default_error_kind(&self) -> ErrorKind {
        match self {
            Stage::Acquire => ErrorKind::AcquireError,
            Stage::Extract => ErrorKind::ExtractionError,
            Stage::Encode => ErrorKind::EncodeError,
            Stage::Identify => ErrorKind::IdentifyError,
            Stage::Organize | Stage::Done | Stage::Failed => ErrorKind::OrganizeError,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acquire" => Ok(Stage::Acquire),
            "extract" => Ok(Stage::Extract),
            "encode" => Ok(Stage::Encode),
            "identify" => Ok(Stage::Identify),
            "organize" => Ok(Stage::Organize),
            "done" => Ok(Stage::Done),
            "failed" => Ok(Stage::Failed),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

/// Status of the job within its current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    AwaitingRetry,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::AwaitingRetry => "awaiting_retry",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "succeeded" => Ok(StageStatus::Succeeded),
            "failed" => Ok(StageStatus::Failed),
            "awaiting_retry" => Ok(StageStatus::AwaitingRetry),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Failure classification shared by stage collaborators and worker clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Could not reach or talk to a worker.
    TransportError,
    /// The worker ran the encode and it failed.
    EncodeError,
    /// An encode exceeded its deadline or stalled.
    Timeout,
    ExtractionError,
    /// Identify found no match or several equally good ones.
    IdentifyAmbiguous,
    Cancelled,
    AcquireError,
    IdentifyError,
    OrganizeError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportError => "transport_error",
            ErrorKind::EncodeError => "encode_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExtractionError => "extraction_error",
            ErrorKind::IdentifyAmbiguous => "identify_ambiguous",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::AcquireError => "acquire_error",
            ErrorKind::IdentifyError => "identify_error",
            ErrorKind::OrganizeError => "organize_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            kind.as_str().to_string()
        } else {
            message
        };
        Self { kind, message }
    }
}

/// Counted attempts per work stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    #[serde(default)]
    pub acquire: u32,
    #[serde(default)]
    pub extract: u32,
    #[serde(default)]
    pub encode: u32,
    #[serde(default)]
    pub identify: u32,
    #[serde(default)]
    pub organize: u32,
}

impl StageAttempts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Acquire => self.acquire,
            Stage::Extract => self.extract,
            Stage::Encode => self.encode,
            Stage::Identify => self.identify,
            Stage::Organize => self.organize,
            Stage::Done | Stage::Failed => 0,
        }
    }

    /// Increment and return the new count. Terminal stages are ignored.
    pub fn increment(&mut self, stage: Stage) -> u32 {
        let slot = match stage {
            Stage::Acquire => &mut self.acquire,
            Stage::Extract => &mut self.extract,
            Stage::Encode => &mut self.encode,
            Stage::Identify => &mut self.identify,
            Stage::Organize => &mut self.organize,
            Stage::Done | Stage::Failed => return 0,
        };
        *slot += 1;
        *slot
    }
}

/// Archive password candidate, tried in descending priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordCandidate {
    pub password: String,
    #[serde(default)]
    pub priority: i32,
}

/// Per-job settings given at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the configured default worker preference.
    #[serde(default)]
    pub encode_preference: Option<WorkerPreference>,
    /// Only workers offering this acceleration may encode the job.
    #[serde(default)]
    pub required_accel: Option<HardwareAccel>,
    #[serde(default)]
    pub password_candidates: Vec<PasswordCandidate>,
    /// Overrides the configured default encode parameters.
    #[serde(default)]
    pub encode: Option<EncodeParams>,
    /// Overrides the organizer's library root.
    #[serde(default)]
    pub dest_dir: Option<PathBuf>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
}

impl JobOptions {
    /// Password candidates ordered by descending priority, stable for ties.
    pub fn ordered_passwords(&self) -> Vec<String> {
        let mut candidates = self.password_candidates.clone();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates.into_iter().map(|c| c.password).collect()
    }
}

/// Encode stage bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeState {
    /// Current worker preference; flipped on fallback.
    pub preference: WorkerPreference,
    /// Whether the class switch has been spent.
    #[serde(default)]
    pub fallback_used: bool,
    /// Counted attempts on the current class.
    #[serde(default)]
    pub class_attempts: u32,
    /// Consecutive transport failures since the last counted outcome.
    #[serde(default)]
    pub transport_failures: u32,
    #[serde(default)]
    pub last_worker_class: Option<WorkerClass>,
}

impl EncodeState {
    pub fn new(preference: WorkerPreference) -> Self {
        Self {
            preference,
            fallback_used: false,
            class_attempts: 0,
            transport_failures: 0,
            last_worker_class: None,
        }
    }

    pub fn fallback_available(&self) -> bool {
        !self.fallback_used && self.preference.allows_fallback()
    }
}

/// Outputs produced by finished stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placed: Option<MediaRef>,
}

impl JobArtifacts {
    /// Most processed media produced so far.
    pub fn current_media(&self) -> Option<&MediaRef> {
        self.encoded
            .as_ref()
            .or(self.extracted.as_ref())
            .or(self.acquired.as_ref())
    }
}

/// Last progress reported by an encoding worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeProgress {
    pub worker_id: String,
    pub percent: f32,
    #[serde(default)]
    pub eta_secs: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// One media item's progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source_ref: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub attempts: StageAttempts,
    /// Set only while Encode is running.
    pub assigned_worker: Option<String>,
    pub last_error: Option<ErrorDescriptor>,
    /// Stage the job was in when it failed.
    pub failed_stage: Option<Stage>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub options: JobOptions,
    pub encode: EncodeState,
    pub artifacts: JobArtifacts,
    pub progress: Option<EncodeProgress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// New job at Acquire/Pending.
    pub fn new(
        source_ref: impl Into<String>,
        options: JobOptions,
        default_preference: WorkerPreference,
        now: DateTime<Utc>,
    ) -> Self {
        let preference = options.encode_preference.unwrap_or(default_preference);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_ref: source_ref.into(),
            stage: Stage::Acquire,
            status: StageStatus::Pending,
            attempts: StageAttempts::default(),
            assigned_worker: None,
            last_error: None,
            failed_stage: None,
            next_attempt_at: None,
            options,
            encode: EncodeState::new(preference),
            artifacts: JobArtifacts::default(),
            progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Whether the scheduler may start the current stage at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            StageStatus::Pending => !self.is_terminal(),
            StageStatus::AwaitingRetry => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Acquire.next(), Some(Stage::Extract));
        assert_eq!(Stage::Identify.next(), Some(Stage::Organize));
        assert_eq!(Stage::Organize.next(), None);
        assert_eq!(Stage::Failed.next(), None);
        assert!(Stage::Done.is_terminal());
        assert!(!Stage::Encode.is_terminal());
    }

    #[test]
    fn test_stage_from_str_roundtrip() {
        for stage in Stage::PIPELINE {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("nope".parse::<Stage>().is_err());
    }

    #[test]
    fn test_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&StageStatus::AwaitingRetry).unwrap();
        assert_eq!(json, "\"awaiting_retry\"");
    }

    #[test]
    fn test_error_descriptor_never_empty() {
        let desc = ErrorDescriptor::new(ErrorKind::EncodeError, "  ");
        assert_eq!(desc.message, "encode_error");
    }

    #[test]
    fn test_attempts_increment() {
        let mut attempts = StageAttempts::default();
        assert_eq!(attempts.increment(Stage::Extract), 1);
        assert_eq!(attempts.increment(Stage::Extract), 2);
        assert_eq!(attempts.get(Stage::Extract), 2);
        assert_eq!(attempts.get(Stage::Encode), 0);
        assert_eq!(attempts.increment(Stage::Done), 0);
    }

    #[test]
    fn test_new_job_starts_at_acquire_pending() {
        let job = Job::new("/tmp/a.mkv", JobOptions::default(), WorkerPreference::PreferRemote, Utc::now());
        assert_eq!(job.stage, Stage::Acquire);
        assert_eq!(job.status, StageStatus::Pending);
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn test_option_preference_overrides_default() {
        let options = JobOptions {
            encode_preference: Some(WorkerPreference::ServerOnly),
            ..Default::default()
        };
        let job = Job::new("x", options, WorkerPreference::PreferRemote, Utc::now());
        assert_eq!(job.encode.preference, WorkerPreference::ServerOnly);
        assert!(!job.encode.fallback_available());
    }

    #[test]
    fn test_ordered_passwords() {
        let options = JobOptions {
            password_candidates: vec![
                PasswordCandidate { password: "low".into(), priority: 0 },
                PasswordCandidate { password: "high".into(), priority: 10 },
                PasswordCandidate { password: "low2".into(), priority: 0 },
            ],
            ..Default::default()
        };
        assert_eq!(options.ordered_passwords(), vec!["high", "low", "low2"]);
    }

    #[test]
    fn test_awaiting_retry_due_after_deadline() {
        let now = Utc::now();
        let mut job = Job::new("x", JobOptions::default(), WorkerPreference::PreferRemote, now);
        job.status = StageStatus::AwaitingRetry;
        job.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(30)));
    }
}
