//! Wiring of the orchestrator from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use mediarelay_core::stage::{
    FileNameIdentifier, FsOrganizer, LocalFileAcquirer, PassthroughExtractor,
};
use mediarelay_core::{
    AuditHandle, Config, EncodingWorkerClient, JobStore, LocalEncoderClient,
    PipelineOrchestrator, PipelineScheduler, RemoteEncoderClient, SchedulerSettings,
    StageExecutor, StageServices,
};

/// Filesystem collaborators for the non-encode stages.
pub fn builtin_services(config: &Config) -> StageServices {
    StageServices {
        acquire: Arc::new(LocalFileAcquirer),
        extract: Arc::new(PassthroughExtractor),
        identify: Arc::new(FileNameIdentifier),
        organize: Arc::new(FsOrganizer::new(config.library.clone())),
    }
}

/// Scheduler settings derived from the loaded configuration.
pub fn scheduler_settings(config: &Config) -> SchedulerSettings {
    SchedulerSettings {
        orchestrator: config.orchestrator.clone(),
        stages: config.stages.clone(),
        retry: config.retry.clone(),
        default_preference: config.encoding.default_preference,
        default_params: config.encoding.params.clone(),
    }
}

/// Build the orchestrator. No workers are registered yet.
pub fn build_orchestrator(
    config: &Config,
    store: Arc<dyn JobStore>,
    audit: Option<AuditHandle>,
    services: StageServices,
) -> PipelineOrchestrator {
    let mut scheduler = PipelineScheduler::new(store, scheduler_settings(config));
    if let Some(audit) = audit {
        scheduler = scheduler.with_audit(audit);
    }
    let executor = StageExecutor::new(services, config.stages.timeouts.clone());

    PipelineOrchestrator::new(
        config.orchestrator.clone(),
        config.encoding.clone(),
        scheduler,
        executor,
    )
}

/// Register the local ffmpeg worker (when enabled) and every `[[workers]]`
/// entry. Returns the number of workers registered.
pub async fn register_configured_workers(
    orchestrator: &PipelineOrchestrator,
    config: &Config,
) -> Result<usize> {
    let mut registered = 0;

    let local = &config.encoding.local;
    if local.enabled {
        let client: Arc<dyn EncodingWorkerClient> =
            Arc::new(LocalEncoderClient::new(local.clone()));
        orchestrator
            .add_worker(local.worker_spec(), client)
            .await
            .with_context(|| format!("Failed to register local worker {}", local.id))?;
        registered += 1;
    } else {
        info!("Local encoding worker disabled");
    }

    for worker in &config.workers {
        let client: Arc<dyn EncodingWorkerClient> = Arc::new(
            RemoteEncoderClient::new(worker.clone())
                .with_context(|| format!("Failed to create client for worker {}", worker.id))?,
        );
        orchestrator
            .add_worker(worker.worker_spec(), client)
            .await
            .with_context(|| format!("Failed to register worker {}", worker.id))?;
        registered += 1;
    }

    Ok(registered)
}
