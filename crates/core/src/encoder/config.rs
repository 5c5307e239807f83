//! Encoding configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::worker::{HardwareAccel, WorkerPreference, WorkerSpec};

use super::types::EncodeParams;

/// Encode stage settings (`[encoding]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingConfig {
    /// Worker preference for jobs that don't set one.
    #[serde(default)]
    pub default_preference: WorkerPreference,

    /// How often a running encode is polled (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Overall deadline for one encode dispatch in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Deadline without any progress change before the encode is
    /// considered stalled.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Consecutive failed polls tolerated before the dispatch is reported
    /// as a transport failure.
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,

    /// Where finished outputs are retrieved to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Default encode parameters.
    #[serde(default)]
    pub params: EncodeParams,

    /// The in-process ffmpeg worker.
    #[serde(default)]
    pub local: LocalEncoderConfig,
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_timeout() -> u64 {
    6 * 3600
}

fn default_stall_timeout() -> u64 {
    600
}

fn default_max_poll_failures() -> u32 {
    3
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("mediarelay-encoded")
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            default_preference: WorkerPreference::default(),
            poll_interval_ms: default_poll_interval(),
            timeout_secs: default_timeout(),
            stall_timeout_secs: default_stall_timeout(),
            max_poll_failures: default_max_poll_failures(),
            output_dir: default_output_dir(),
            params: EncodeParams::default(),
            local: LocalEncoderConfig::default(),
        }
    }
}

impl EncodingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Local ffmpeg worker (`[encoding.local]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEncoderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_local_id")]
    pub id: String,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,

    /// Scratch directory for in-progress outputs.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_local_max_jobs")]
    pub max_concurrent_jobs: u32,

    /// Acceleration available on this host.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<HardwareAccel>,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[serde(default = "default_log_level")]
    pub ffmpeg_log_level: String,

    /// Additional ffmpeg arguments placed before the output.
    #[serde(default)]
    pub extra_ffmpeg_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_local_id() -> String {
    "local".to_string()
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("mediarelay-local")
}

fn default_local_max_jobs() -> u32 {
    2
}

fn default_capabilities() -> Vec<HardwareAccel> {
    vec![HardwareAccel::Software]
}

fn default_log_level() -> String {
    "warning".to_string()
}

impl Default for LocalEncoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            id: default_local_id(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            work_dir: default_work_dir(),
            max_concurrent_jobs: default_local_max_jobs(),
            capabilities: default_capabilities(),
            ffmpeg_log_level: default_log_level(),
            extra_ffmpeg_args: Vec::new(),
        }
    }
}

impl LocalEncoderConfig {
    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec::local(self.id.clone(), self.max_concurrent_jobs)
            .with_capabilities(self.capabilities.clone())
    }
}

/// Remote encoding worker (`[[workers]]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWorkerConfig {
    pub id: String,

    /// Base URL, e.g. `http://gpu-box:8700`.
    pub url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_remote_max_jobs")]
    pub max_concurrent_jobs: u32,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<HardwareAccel>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upload/download chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
}

fn default_remote_max_jobs() -> u32 {
    1
}

fn default_request_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024 // 8 MB
}

impl RemoteWorkerConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            api_key: None,
            max_concurrent_jobs: default_remote_max_jobs(),
            capabilities: default_capabilities(),
            request_timeout_secs: default_request_timeout(),
            chunk_size_bytes: default_chunk_size(),
        }
    }

    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec::remote(self.id.clone(), self.max_concurrent_jobs)
            .with_capabilities(self.capabilities.clone())
    }
}
