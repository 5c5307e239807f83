//! Stage toggles, timeouts and built-in collaborator settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::job::Stage;

/// Which stages run. A disabled stage is skipped as if it succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_true")]
    pub acquire: bool,
    #[serde(default = "default_true")]
    pub extract: bool,
    #[serde(default = "default_true")]
    pub encode: bool,
    #[serde(default = "default_true")]
    pub identify: bool,
    #[serde(default = "default_true")]
    pub organize: bool,
    #[serde(default)]
    pub timeouts: StageTimeouts,
}

fn default_true() -> bool {
    true
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            acquire: true,
            extract: true,
            encode: true,
            identify: true,
            organize: true,
            timeouts: StageTimeouts::default(),
        }
    }
}

impl StagesConfig {
    pub fn is_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Acquire => self.acquire,
            Stage::Extract => self.extract,
            Stage::Encode => self.encode,
            Stage::Identify => self.identify,
            Stage::Organize => self.organize,
            Stage::Done | Stage::Failed => false,
        }
    }

    /// Enable or disable a single stage.
    pub fn with_stage(mut self, stage: Stage, enabled: bool) -> Self {
        match stage {
            Stage::Acquire => self.acquire = enabled,
            Stage::Extract => self.extract = enabled,
            Stage::Encode => self.encode = enabled,
            Stage::Identify => self.identify = enabled,
            Stage::Organize => self.organize = enabled,
            Stage::Done | Stage::Failed => {}
        }
        self
    }

    /// First enabled work stage at or after `stage`.
    pub fn first_enabled_from(&self, stage: Stage) -> Option<Stage> {
        let mut current = Some(stage);
        while let Some(s) = current {
            if self.is_enabled(s) {
                return Some(s);
            }
            current = s.next();
        }
        None
    }
}

/// Per-stage execution deadlines for the non-encode stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_acquire_timeout")]
    pub acquire_secs: u64,
    #[serde(default = "default_extract_timeout")]
    pub extract_secs: u64,
    #[serde(default = "default_identify_timeout")]
    pub identify_secs: u64,
    #[serde(default = "default_organize_timeout")]
    pub organize_secs: u64,
}

fn default_acquire_timeout() -> u64 {
    3600
}

fn default_extract_timeout() -> u64 {
    1800
}

fn default_identify_timeout() -> u64 {
    120
}

fn default_organize_timeout() -> u64 {
    1800
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            acquire_secs: default_acquire_timeout(),
            extract_secs: default_extract_timeout(),
            identify_secs: default_identify_timeout(),
            organize_secs: default_organize_timeout(),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Acquire => self.acquire_secs,
            Stage::Extract => self.extract_secs,
            Stage::Identify => self.identify_secs,
            _ => self.organize_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Settings for the built-in organizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Library root used when a job has no destination directory.
    #[serde(default = "default_library_root")]
    pub root: PathBuf,
    /// Copy buffer size for cross-filesystem moves.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_library_root() -> PathBuf {
    PathBuf::from("library")
}

fn default_buffer_size() -> usize {
    8 * 1024 * 1024 // 8 MB
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: default_library_root(),
            buffer_size: default_buffer_size(),
        }
    }
}
