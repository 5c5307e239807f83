use std::collections::HashSet;

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Concurrency caps, retry ceilings and intervals are not 0
/// - Worker ids are unique (the local worker included)
/// - Remote workers have a URL and a non-zero chunk size
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return invalid("server.port cannot be 0");
    }

    let orchestrator = &config.orchestrator;
    if orchestrator.max_concurrent_dispatches == 0 {
        return invalid("orchestrator.max_concurrent_dispatches cannot be 0");
    }
    if orchestrator.heartbeat_miss_threshold == 0 {
        return invalid("orchestrator.heartbeat_miss_threshold cannot be 0");
    }

    if config.retry.max_attempts == 0 {
        return invalid("retry.max_attempts cannot be 0");
    }
    if config.retry.encode_attempts_per_class == 0 {
        return invalid("retry.encode_attempts_per_class cannot be 0");
    }
    if config.retry.backoff_multiplier < 1.0 {
        return invalid("retry.backoff_multiplier cannot be below 1.0");
    }

    let local = &config.encoding.local;
    if local.enabled && local.max_concurrent_jobs == 0 {
        return invalid("encoding.local.max_concurrent_jobs cannot be 0");
    }

    let mut ids = HashSet::new();
    if local.enabled {
        ids.insert(local.id.as_str());
    }
    for worker in &config.workers {
        if worker.id.trim().is_empty() {
            return invalid("workers.id cannot be empty");
        }
        if !ids.insert(worker.id.as_str()) {
            return invalid(&format!("duplicate worker id: {}", worker.id));
        }
        if worker.url.trim().is_empty() {
            return invalid(&format!("workers.{}.url cannot be empty", worker.id));
        }
        if worker.max_concurrent_jobs == 0 {
            return invalid(&format!(
                "workers.{}.max_concurrent_jobs cannot be 0",
                worker.id
            ));
        }
        if worker.chunk_size_bytes == 0 {
            return invalid(&format!("workers.{}.chunk_size_bytes cannot be 0", worker.id));
        }
    }

    Ok(())
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::encoder::RemoteWorkerConfig;
    use std::net::IpAddr;

    #[test]
    fn test_validate_valid_config() {
        let mut config = Config::default();
        config
            .workers
            .push(RemoteWorkerConfig::new("gpu-box", "http://gpu-box:8700"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".parse::<IpAddr>().unwrap(),
                port: 0,
            },
            ..Default::default()
        };
        let result = validate_config(&config);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_zero_caps_fail() {
        let mut config = Config::default();
        config.orchestrator.max_concurrent_dispatches = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.retry.encode_attempts_per_class = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_duplicate_worker_ids() {
        let mut config = Config::default();
        config
            .workers
            .push(RemoteWorkerConfig::new("gpu-box", "http://a:8700"));
        config
            .workers
            .push(RemoteWorkerConfig::new("gpu-box", "http://b:8700"));

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate worker id: gpu-box"));
    }

    #[test]
    fn test_validate_remote_worker_shadowing_local_id() {
        let mut config = Config::default();
        let local_id = config.encoding.local.id.clone();
        config
            .workers
            .push(RemoteWorkerConfig::new(local_id, "http://a:8700"));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_worker_without_url_or_chunk() {
        let mut config = Config::default();
        config.workers.push(RemoteWorkerConfig::new("gpu-box", ""));
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        let mut worker = RemoteWorkerConfig::new("gpu-box", "http://a:8700");
        worker.chunk_size_bytes = 0;
        config.workers.push(worker);
        assert!(validate_config(&config).is_err());
    }
}
