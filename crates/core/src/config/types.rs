use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::encoder::{EncodingConfig, RemoteWorkerConfig};
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryConfig;
use crate::stage::{LibraryConfig, StagesConfig};
use crate::worker::HardwareAccel;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    /// Remote encoding workers (`[[workers]]`).
    #[serde(default)]
    pub workers: Vec<RemoteWorkerConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("mediarelay.db")
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub stages: StagesConfig,
    pub retry: RetryConfig,
    pub encoding: EncodingConfig,
    pub library: LibraryConfig,
    pub workers: Vec<SanitizedWorkerConfig>,
}

/// Remote worker config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedWorkerConfig {
    pub id: String,
    pub url: String,
    pub api_key_configured: bool,
    pub max_concurrent_jobs: u32,
    pub capabilities: Vec<HardwareAccel>,
    pub request_timeout_secs: u64,
    pub chunk_size_bytes: usize,
}

impl From<&RemoteWorkerConfig> for SanitizedWorkerConfig {
    fn from(worker: &RemoteWorkerConfig) -> Self {
        Self {
            id: worker.id.clone(),
            url: worker.url.clone(),
            api_key_configured: worker.api_key.as_deref().is_some_and(|k| !k.is_empty()),
            max_concurrent_jobs: worker.max_concurrent_jobs,
            capabilities: worker.capabilities.clone(),
            request_timeout_secs: worker.request_timeout_secs,
            chunk_size_bytes: worker.chunk_size_bytes,
        }
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            orchestrator: config.orchestrator.clone(),
            stages: config.stages.clone(),
            retry: config.retry.clone(),
            encoding: config.encoding.clone(),
            library: config.library.clone(),
            workers: config.workers.iter().map(SanitizedWorkerConfig::from).collect(),
        }
    }
}
