//! Worker domain types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an encoding worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    /// In-process ffmpeg on the orchestrator host.
    Local,
    /// Separate machine reached over HTTP.
    Remote,
}

impl WorkerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerClass::Local => "local",
            WorkerClass::Remote => "remote",
        }
    }

    /// The other class.
    pub fn opposite(&self) -> WorkerClass {
        match self {
            WorkerClass::Local => WorkerClass::Remote,
            WorkerClass::Remote => WorkerClass::Local,
        }
    }
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reachability of a worker as observed by heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Online,
    Offline,
    Unknown,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Online => "online",
            Liveness::Offline => "offline",
            Liveness::Unknown => "unknown",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Liveness::Unknown => 0,
            Liveness::Online => 1,
            Liveness::Offline => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Liveness::Online,
            2 => Liveness::Offline,
            _ => Liveness::Unknown,
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware acceleration a worker can offer for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareAccel {
    /// CPU encoders (libx265, libx264, libsvtav1).
    Software,
    /// NVIDIA NVENC.
    Nvenc,
    /// Intel Quick Sync.
    Qsv,
    /// AMD AMF.
    Amf,
}

impl HardwareAccel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareAccel::Software => "software",
            HardwareAccel::Nvenc => "nvenc",
            HardwareAccel::Qsv => "qsv",
            HardwareAccel::Amf => "amf",
        }
    }
}

impl fmt::Display for HardwareAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which worker class the Encode stage should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPreference {
    /// Least-loaded online remote worker, local when no remote is available.
    #[default]
    PreferRemote,
    /// Remote workers only.
    RemoteOnly,
    /// The local worker only.
    ServerOnly,
    /// Least-loaded worker of any class.
    LoadBalance,
}

impl WorkerPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPreference::PreferRemote => "prefer_remote",
            WorkerPreference::RemoteOnly => "remote_only",
            WorkerPreference::ServerOnly => "server_only",
            WorkerPreference::LoadBalance => "load_balance",
        }
    }

    /// Whether a class switch is allowed once the current class has
    /// exhausted its attempts. Pinned preferences never switch.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            WorkerPreference::PreferRemote | WorkerPreference::LoadBalance
        )
    }

    /// Preference to use after falling back from `last_class`.
    pub fn fallback(&self, last_class: Option<WorkerClass>) -> WorkerPreference {
        let from = last_class.unwrap_or(match self {
            WorkerPreference::ServerOnly => WorkerClass::Local,
            _ => WorkerClass::Remote,
        });
        match from.opposite() {
            WorkerClass::Local => WorkerPreference::ServerOnly,
            WorkerClass::Remote => WorkerPreference::RemoteOnly,
        }
    }
}

impl fmt::Display for WorkerPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a worker, taken from configuration or a
/// registration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub class: WorkerClass,
    pub capabilities: Vec<HardwareAccel>,
    pub max_concurrent_jobs: u32,
}

impl WorkerSpec {
    pub fn local(id: impl Into<String>, max_concurrent_jobs: u32) -> Self {
        Self {
            id: id.into(),
            class: WorkerClass::Local,
            capabilities: vec![HardwareAccel::Software],
            max_concurrent_jobs,
        }
    }

    pub fn remote(id: impl Into<String>, max_concurrent_jobs: u32) -> Self {
        Self {
            id: id.into(),
            class: WorkerClass::Remote,
            capabilities: vec![HardwareAccel::Software],
            max_concurrent_jobs,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<HardwareAccel>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Point-in-time view of a registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub class: WorkerClass,
    pub capabilities: Vec<HardwareAccel>,
    pub liveness: Liveness,
    pub current_load: u32,
    pub max_concurrent_jobs: u32,
    pub total_jobs: u64,
    pub succeeded_jobs: u64,
    pub failed_jobs: u64,
}

impl WorkerRecord {
    pub fn supports(&self, accel: HardwareAccel) -> bool {
        self.capabilities.contains(&accel)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_jobs
    }

    /// Percentage of finished jobs that succeeded, 0 when none finished.
    pub fn success_rate(&self) -> f64 {
        let finished = self.succeeded_jobs + self.failed_jobs;
        if finished == 0 {
            0.0
        } else {
            self.succeeded_jobs as f64 * 100.0 / finished as f64
        }
    }
}
