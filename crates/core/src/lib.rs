pub mod audit;
pub mod config;
pub mod encoder;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod stage;
pub mod testing;
pub mod worker;

pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditFilter, AuditHandle, AuditRecord,
    AuditStore, AuditWriter, SqliteAuditStore,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use encoder::{
    EncodeParams, EncodeRequest, EncoderError, EncodingConfig, EncodingWorkerClient,
    LocalEncoderClient, RemoteEncoderClient, RemoteWorkerConfig,
};
pub use job::{
    ErrorDescriptor, ErrorKind, Job, JobError, JobFilter, JobOptions, JobStore, SqliteJobStore,
    Stage, StageStatus,
};
pub use orchestrator::{
    OrchestratorConfig, OrchestratorError, OrchestratorStatus, PipelineOrchestrator,
    PipelineScheduler, SchedulerSettings,
};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use stage::{
    MediaRef, StageExecutor, StageInput, StageOutcome, StagePayload, StageServices, StagesConfig,
};
pub use worker::{
    HardwareAccel, Liveness, WorkerClass, WorkerPreference, WorkerRecord, WorkerRegistry,
    WorkerSpec,
};
