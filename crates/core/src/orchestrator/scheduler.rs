//! Single-writer scheduling core.
//!
//! [`PipelineScheduler`] owns every mutation of jobs and worker load. It is
//! synchronous and takes the current time as an argument; the async
//! [`PipelineOrchestrator`](super::PipelineOrchestrator) drives it from one
//! task and runs the dispatches it produces.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::encoder::{pick_accel, EncodeParams, EncodeRequest};
use crate::job::{
    EncodeProgress, ErrorDescriptor, ErrorKind, Job, JobError, JobFilter, JobOptions, JobStore,
    Stage, StageStatus,
};
use crate::metrics;
use crate::retry::{AttemptState, RetryConfig, RetryDecision, RetryPolicy};
use crate::stage::{StageInput, StageOutcome, StagePayload, StagesConfig};
use crate::worker::{
    Liveness, LivenessTransition, WorkerClass, WorkerPreference, WorkerRecord, WorkerRegistry,
    WorkerSpec,
};

use super::config::OrchestratorConfig;
use super::types::{Dispatch, DispatchReport, DispatchWork, OrchestratorStatus, ProgressUpdate};

/// Everything the scheduler needs besides the store.
#[derive(Debug, Clone, Default)]
pub struct SchedulerSettings {
    pub orchestrator: OrchestratorConfig,
    pub stages: StagesConfig,
    pub retry: RetryConfig,
    /// Worker preference for jobs that don't set one.
    pub default_preference: WorkerPreference,
    /// Encode parameters for jobs that don't set them.
    pub default_params: EncodeParams,
}

#[derive(Debug)]
struct InFlight {
    dispatch_id: u64,
    stage: Stage,
    worker_id: Option<String>,
    cancel: CancellationToken,
}

/// Decides what runs next and applies stage results.
pub struct PipelineScheduler {
    store: Arc<dyn JobStore>,
    registry: WorkerRegistry,
    policy: RetryPolicy,
    settings: SchedulerSettings,
    in_flight: HashMap<String, InFlight>,
    next_dispatch_id: u64,
    audit: Option<AuditHandle>,
}

impl PipelineScheduler {
    pub fn new(store: Arc<dyn JobStore>, settings: SchedulerSettings) -> Self {
        Self {
            registry: WorkerRegistry::new(settings.orchestrator.heartbeat_miss_threshold),
            policy: RetryPolicy::new(settings.retry.clone()),
            store,
            settings,
            in_flight: HashMap::new(),
            next_dispatch_id: 1,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub(crate) fn audit(&self) -> Option<&AuditHandle> {
        self.audit.as_ref()
    }

    fn emit(&self, now: DateTime<Utc>, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.try_emit_at(now, event);
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    pub fn register_worker(&mut self, spec: WorkerSpec, now: DateTime<Utc>) -> WorkerRecord {
        let record = self.registry.register(spec);
        self.emit(
            now,
            AuditEvent::WorkerRegistered {
                worker_id: record.id.clone(),
                class: record.class,
                max_concurrent_jobs: record.max_concurrent_jobs,
            },
        );
        record
    }

    /// Remove a worker. Encodes already running on it finish normally.
    pub fn deregister_worker(&mut self, id: &str, now: DateTime<Utc>) -> Option<WorkerRecord> {
        let removed = self.registry.deregister(id)?;
        self.emit(
            now,
            AuditEvent::WorkerDeregistered {
                worker_id: id.to_string(),
            },
        );
        Some(removed)
    }

    /// Apply one heartbeat result to a worker's liveness.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        reachable: bool,
        now: DateTime<Utc>,
    ) -> Option<LivenessTransition> {
        let transition = self.registry.heartbeat(worker_id, reachable)?;
        note_liveness_transition(self.audit.as_ref(), worker_id, transition, now);
        Some(transition)
    }

    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.registry.snapshot()
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Reset jobs left Running by a previous process to Pending. No attempt
    /// is consumed.
    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<usize, JobError> {
        let filter = JobFilter::new().with_status(StageStatus::Running);
        let mut recovered = 0;
        loop {
            let batch: Vec<Job> = self
                .store
                .list(&filter)?
                .into_iter()
                .filter(|job| !self.in_flight.contains_key(&job.id))
                .collect();
            if batch.is_empty() {
                break;
            }
            for mut job in batch {
                job.status = StageStatus::Pending;
                job.assigned_worker = None;
                job.progress = None;
                job.updated_at = now;
                self.store.save(&job)?;
                info!(job_id = %job.id, stage = %job.stage, "Recovered interrupted job");
                self.emit(
                    now,
                    AuditEvent::JobRecovered {
                        job_id: job.id.clone(),
                        stage: job.stage,
                    },
                );
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} interrupted jobs", recovered);
        }
        Ok(recovered)
    }

    /// Create a job at Acquire/Pending.
    pub fn enqueue(
        &mut self,
        source_ref: impl Into<String>,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError> {
        let job = Job::new(source_ref, options, self.settings.default_preference, now);
        self.store.create(&job)?;

        info!(
            job_id = %job.id,
            source = %job.source_ref,
            priority = job.options.priority,
            "Enqueued job"
        );
        self.emit(
            now,
            AuditEvent::JobEnqueued {
                job_id: job.id.clone(),
                source_ref: job.source_ref.clone(),
                priority: job.options.priority,
                preference: job.encode.preference,
            },
        );
        Ok(job)
    }

    pub fn status(&self, job_id: &str) -> Result<Job, JobError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Start every due job the concurrency caps allow.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<Dispatch>, JobError> {
        let max = self.settings.orchestrator.max_concurrent_dispatches;
        let mut dispatches = Vec::new();
        if self.in_flight.len() >= max {
            return Ok(dispatches);
        }

        // Jobs that cannot start must not hide the ones behind them.
        let batch = (max * 4).max(16) as i64;
        let mut cursor: Option<Job> = None;
        'pages: loop {
            let page = self.store.list_due(now, cursor.as_ref(), batch)?;
            let exhausted = (page.len() as i64) < batch;
            cursor = page.last().cloned();

            for job in page {
                if self.in_flight.len() >= max {
                    break 'pages;
                }
                if self.in_flight.contains_key(&job.id) {
                    continue;
                }
                let job_id = job.id.clone();
                match self.advance_job(job, now) {
                    Ok(Some(dispatch)) => dispatches.push(dispatch),
                    Ok(None) => {}
                    Err(e) => warn!(job_id = %job_id, "Failed to advance job: {}", e),
                }
            }

            if exhausted {
                break;
            }
        }

        if !dispatches.is_empty() {
            debug!(count = dispatches.len(), in_flight = self.in_flight.len(), "Dispatched jobs");
        }
        Ok(dispatches)
    }

    /// Start the current stage of one job if it is due and capacity allows.
    /// Returns `None` for jobs that are running, terminal, waiting for a
    /// retry deadline, or waiting for capacity.
    pub fn advance(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<Option<Dispatch>, JobError> {
        if self.in_flight.contains_key(job_id) {
            return Ok(None);
        }
        let job = self.status(job_id)?;
        self.advance_job(job, now)
    }

    fn advance_job(&mut self, mut job: Job, now: DateTime<Utc>) -> Result<Option<Dispatch>, JobError> {
        if !job.is_due(now) {
            return Ok(None);
        }

        let mut changed = false;
        if !self.settings.stages.is_enabled(job.stage) {
            let from = job.stage;
            self.enter_stage(&mut job, Some(from), now);
            job.updated_at = now;
            changed = true;
            if job.is_terminal() {
                self.store.save(&job)?;
                return Ok(None);
            }
        }

        let stage = job.stage;
        let stage_cap = self.settings.orchestrator.stage_concurrency.for_stage(stage);
        let in_stage = self.in_flight.values().filter(|f| f.stage == stage).count();
        if self.in_flight.len() >= self.settings.orchestrator.max_concurrent_dispatches
            || in_stage >= stage_cap
        {
            if changed {
                self.store.save(&job)?;
            }
            return Ok(None);
        }

        let attempt = job.attempts.get(stage) + 1;
        let (work, worker_id) = if stage == Stage::Encode {
            let Some(input) = job.artifacts.current_media().cloned() else {
                let error = ErrorDescriptor::new(ErrorKind::EncodeError, "no media to encode");
                self.fail_job(&mut job, error, now);
                self.store.save(&job)?;
                return Ok(None);
            };

            let Some(worker) = self
                .registry
                .select(job.encode.preference, job.options.required_accel)
            else {
                debug!(
                    job_id = %job.id,
                    preference = %job.encode.preference,
                    "No encoding worker available, job waits"
                );
                if changed {
                    self.store.save(&job)?;
                }
                return Ok(None);
            };

            // Landing on the local worker under PreferRemote spends the
            // one class switch the job is allowed.
            if job.encode.preference == WorkerPreference::PreferRemote
                && worker.class == WorkerClass::Local
            {
                info!(job_id = %job.id, worker_id = %worker.id, "No remote worker available, using local encoder");
                self.apply_fallback(&mut job, WorkerPreference::ServerOnly, now);
            }

            job.assigned_worker = Some(worker.id.clone());
            job.encode.last_worker_class = Some(worker.class);
            metrics::ENCODE_DISPATCHES
                .with_label_values(&[worker.class.as_str()])
                .inc();

            let request = EncodeRequest {
                job_id: job.id.clone(),
                input,
                params: job
                    .options
                    .encode
                    .clone()
                    .unwrap_or_else(|| self.settings.default_params.clone()),
                accel: pick_accel(job.options.required_accel, &worker.capabilities),
            };
            (
                DispatchWork::Encode {
                    worker_id: worker.id.clone(),
                    request,
                },
                Some(worker.id),
            )
        } else {
            (DispatchWork::Stage(StageInput::from_job(&job, attempt)), None)
        };

        job.status = StageStatus::Running;
        job.next_attempt_at = None;
        job.progress = None;
        job.updated_at = now;
        if let Err(e) = self.store.save(&job) {
            if let Some(id) = &worker_id {
                self.registry.release(id, None);
            }
            return Err(e);
        }

        let dispatch_id = self.next_dispatch_id;
        self.next_dispatch_id += 1;
        let cancel = CancellationToken::new();
        self.in_flight.insert(
            job.id.clone(),
            InFlight {
                dispatch_id,
                stage,
                worker_id: worker_id.clone(),
                cancel: cancel.clone(),
            },
        );

        debug!(job_id = %job.id, stage = %stage, attempt, dispatch_id, "Starting stage");
        self.emit(
            now,
            AuditEvent::StageStarted {
                job_id: job.id.clone(),
                stage,
                attempt,
                worker_id,
            },
        );

        Ok(Some(Dispatch {
            dispatch_id,
            job_id: job.id,
            stage,
            attempt,
            cancel,
            work,
        }))
    }

    /// Apply the result of a dispatch. Reports for dispatches that are no
    /// longer current (the job was cancelled) are discarded and `None` is
    /// returned.
    pub fn apply(&mut self, report: DispatchReport, now: DateTime<Utc>) -> Result<Option<Job>, JobError> {
        let Some(flight) = self.in_flight.remove(&report.job_id) else {
            debug!(job_id = %report.job_id, dispatch_id = report.dispatch_id, "Discarding late stage result");
            return Ok(None);
        };
        if flight.dispatch_id != report.dispatch_id {
            debug!(job_id = %report.job_id, dispatch_id = report.dispatch_id, "Discarding stale stage result");
            self.in_flight.insert(report.job_id.clone(), flight);
            return Ok(None);
        }

        if let Some(worker_id) = &flight.worker_id {
            self.registry.release(worker_id, Some(report.outcome.success));
        }

        let Some(mut job) = self.store.get(&report.job_id)? else {
            warn!(job_id = %report.job_id, "Stage result for a job that no longer exists");
            return Ok(None);
        };
        if job.status != StageStatus::Running || job.stage != flight.stage {
            warn!(
                job_id = %job.id,
                stage = %job.stage,
                status = %job.status,
                "Stage result does not match job state, discarding"
            );
            return Ok(None);
        }

        let stage = job.stage;
        let result = if report.outcome.success {
            "success"
        } else if report.outcome.error_kind == Some(ErrorKind::Cancelled) {
            "cancelled"
        } else {
            "failure"
        };
        metrics::STAGE_EXECUTIONS
            .with_label_values(&[stage.as_str(), result])
            .inc();

        let worker_id = job.assigned_worker.take();
        if stage == Stage::Encode {
            job.progress = None;
        }

        if report.outcome.success {
            self.on_success(&mut job, report.outcome.output, now);
        } else {
            self.on_failure(&mut job, &report.outcome, worker_id.as_deref(), now);
        }

        job.updated_at = now;
        self.store.save(&job)?;
        Ok(Some(job))
    }

    fn on_success(&self, job: &mut Job, output: StagePayload, now: DateTime<Utc>) {
        let stage = job.stage;
        let attempt = job.attempts.increment(stage);

        match (stage, output) {
            (Stage::Acquire, StagePayload::Media(media)) => job.artifacts.acquired = Some(media),
            (Stage::Extract, StagePayload::Media(media)) => job.artifacts.extracted = Some(media),
            (Stage::Encode, StagePayload::Media(media)) => job.artifacts.encoded = Some(media),
            (Stage::Identify, StagePayload::Metadata(value)) => job.artifacts.metadata = Some(value),
            (Stage::Organize, StagePayload::Media(media)) => job.artifacts.placed = Some(media),
            _ => {}
        }
        job.last_error = None;
        if stage == Stage::Encode {
            job.encode.transport_failures = 0;
        }

        info!(job_id = %job.id, stage = %stage, attempt, "Stage succeeded");
        self.emit(
            now,
            AuditEvent::StageSucceeded {
                job_id: job.id.clone(),
                stage,
                attempt,
            },
        );

        self.enter_stage(job, stage.next(), now);
    }

    fn on_failure(
        &self,
        job: &mut Job,
        outcome: &StageOutcome,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let stage = job.stage;
        let is_encode = stage == Stage::Encode;
        let error = outcome
            .error(stage.default_error_kind())
            .unwrap_or_else(|| ErrorDescriptor::new(stage.default_error_kind(), ""));
        let kind = error.kind;

        if kind == ErrorKind::TransportError {
            if let Some(worker_id) = worker_id {
                metrics::TRANSPORT_ERRORS.with_label_values(&[worker_id]).inc();
            }
            if is_encode {
                job.encode.transport_failures += 1;
            }
        }
        job.last_error = Some(error.clone());

        if !outcome.retryable {
            self.count_attempt(job);
            self.emit_stage_failed(job, &error, false, now);
            self.fail_job(job, error, now);
            return;
        }

        let state = AttemptState {
            attempts: if is_encode {
                job.encode.class_attempts + 1
            } else {
                job.attempts.get(stage) + 1
            },
            transport_failures: if is_encode {
                job.encode.transport_failures
            } else {
                0
            },
            fallback_available: is_encode && job.encode.fallback_available(),
        };
        let decision = self.policy.decide(stage, &state, kind);
        metrics::RETRY_DECISIONS
            .with_label_values(&[stage.as_str(), decision.as_str()])
            .inc();

        if !matches!(decision, RetryDecision::Retry { counted: false, .. }) {
            self.count_attempt(job);
        }
        self.emit_stage_failed(job, &error, true, now);

        warn!(
            job_id = %job.id,
            stage = %stage,
            error_kind = %kind,
            decision = decision.as_str(),
            "Stage failed: {}",
            error.message
        );

        match decision {
            RetryDecision::Retry { delay, counted } => {
                let at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                job.status = StageStatus::AwaitingRetry;
                job.next_attempt_at = Some(at);
                self.emit(
                    now,
                    AuditEvent::RetryScheduled {
                        job_id: job.id.clone(),
                        stage,
                        delay_secs: delay.as_secs(),
                        counted,
                        next_attempt_at: at,
                    },
                );
            }
            RetryDecision::Fallback => {
                let to = job.encode.preference.fallback(job.encode.last_worker_class);
                self.apply_fallback(job, to, now);
                job.status = StageStatus::AwaitingRetry;
                job.next_attempt_at = Some(now);
            }
            RetryDecision::GiveUp => self.fail_job(job, error, now),
        }
    }

    /// Consume one counted attempt of the current stage.
    fn count_attempt(&self, job: &mut Job) {
        job.attempts.increment(job.stage);
        if job.stage == Stage::Encode {
            job.encode.class_attempts += 1;
            job.encode.transport_failures = 0;
        }
    }

    fn emit_stage_failed(&self, job: &Job, error: &ErrorDescriptor, retryable: bool, now: DateTime<Utc>) {
        self.emit(
            now,
            AuditEvent::StageFailed {
                job_id: job.id.clone(),
                stage: job.stage,
                attempt: job.attempts.get(job.stage),
                error_kind: error.kind,
                message: error.message.clone(),
                retryable,
            },
        );
    }

    fn apply_fallback(&self, job: &mut Job, to: WorkerPreference, now: DateTime<Utc>) {
        let from = job.encode.preference;
        job.encode.preference = to;
        job.encode.fallback_used = true;
        job.encode.class_attempts = 0;
        job.encode.transport_failures = 0;

        metrics::FALLBACKS_APPLIED.inc();
        info!(job_id = %job.id, from = %from, to = %to, "Applied worker class fallback");
        self.emit(
            now,
            AuditEvent::FallbackApplied {
                job_id: job.id.clone(),
                from,
                to,
            },
        );
    }

    /// Move the job to the first enabled stage starting at `candidate`, or
    /// to Done when none is left.
    fn enter_stage(&self, job: &mut Job, mut candidate: Option<Stage>, now: DateTime<Utc>) {
        while let Some(stage) = candidate {
            if self.settings.stages.is_enabled(stage) {
                job.stage = stage;
                job.status = StageStatus::Pending;
                job.next_attempt_at = None;
                return;
            }
            debug!(job_id = %job.id, stage = %stage, "Skipping disabled stage");
            self.emit(
                now,
                AuditEvent::StageSkipped {
                    job_id: job.id.clone(),
                    stage,
                },
            );
            candidate = stage.next();
        }
        self.complete_job(job, now);
    }

    fn complete_job(&self, job: &mut Job, now: DateTime<Utc>) {
        job.stage = Stage::Done;
        job.status = StageStatus::Succeeded;
        job.assigned_worker = None;
        job.next_attempt_at = None;
        job.updated_at = now;

        metrics::JOBS_FINISHED.with_label_values(&["done", ""]).inc();
        info!(job_id = %job.id, "Job completed");
        self.emit(
            now,
            AuditEvent::JobCompleted {
                job_id: job.id.clone(),
                placed_path: job
                    .artifacts
                    .placed
                    .as_ref()
                    .map(|m| m.path.display().to_string()),
            },
        );
    }

    fn fail_job(&self, job: &mut Job, error: ErrorDescriptor, now: DateTime<Utc>) {
        let stage = job.stage;
        if !stage.is_terminal() {
            job.failed_stage = Some(stage);
        }
        job.stage = Stage::Failed;
        job.status = StageStatus::Failed;
        job.assigned_worker = None;
        job.next_attempt_at = None;
        job.updated_at = now;

        metrics::JOBS_FINISHED
            .with_label_values(&["failed", error.kind.as_str()])
            .inc();
        warn!(
            job_id = %job.id,
            stage = %stage,
            error_kind = %error.kind,
            "Job failed: {}",
            error.message
        );
        self.emit(
            now,
            AuditEvent::JobFailed {
                job_id: job.id.clone(),
                stage,
                error_kind: error.kind,
                message: error.message.clone(),
            },
        );
        job.last_error = Some(error);
    }

    /// Cancel a job wherever it is. An in-flight execution is signalled and
    /// its result will be discarded.
    pub fn cancel(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<Job, JobError> {
        let mut job = self.status(job_id)?;
        if job.is_terminal() {
            return Err(JobError::InvalidState {
                job_id: job_id.to_string(),
                operation: "cancel".to_string(),
                reason: format!("job is already {}", job.stage),
            });
        }

        if let Some(flight) = self.in_flight.remove(job_id) {
            flight.cancel.cancel();
            if let Some(worker_id) = &flight.worker_id {
                self.registry.release(worker_id, None);
            }
        }

        self.emit(
            now,
            AuditEvent::JobCancelled {
                job_id: job.id.clone(),
                stage: job.stage,
            },
        );
        self.fail_job(
            &mut job,
            ErrorDescriptor::new(ErrorKind::Cancelled, "cancelled by request"),
            now,
        );
        self.store.save(&job)?;
        Ok(job)
    }

    /// Store encode progress for the current dispatch of a job.
    pub fn record_progress(&mut self, update: ProgressUpdate, now: DateTime<Utc>) -> Result<(), JobError> {
        let current = self
            .in_flight
            .get(&update.job_id)
            .map_or(false, |f| f.dispatch_id == update.dispatch_id);
        if !current {
            return Ok(());
        }
        let Some(mut job) = self.store.get(&update.job_id)? else {
            return Ok(());
        };
        job.progress = Some(EncodeProgress {
            worker_id: update.worker_id,
            percent: update.percent,
            eta_secs: update.eta_secs,
            updated_at: now,
        });
        job.updated_at = now;
        self.store.save(&job)
    }

    /// Signal every in-flight execution and release its worker slot.
    ///
    /// The jobs stay Running in the store and are picked up again by
    /// [`recover`](Self::recover).
    pub fn abort_in_flight(&mut self) -> usize {
        let count = self.in_flight.len();
        for (_, flight) in self.in_flight.drain() {
            flight.cancel.cancel();
            if let Some(worker_id) = &flight.worker_id {
                self.registry.release(worker_id, None);
            }
        }
        count
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight.contains_key(job_id)
    }

    pub fn summary(&self, running: bool) -> OrchestratorStatus {
        let count = |filter: JobFilter| self.store.count(&filter).unwrap_or(0) as usize;

        let mut in_flight_by_stage = BTreeMap::new();
        for flight in self.in_flight.values() {
            *in_flight_by_stage
                .entry(flight.stage.as_str().to_string())
                .or_insert(0) += 1;
        }

        let workers = self.registry.snapshot();
        OrchestratorStatus {
            running,
            in_flight: self.in_flight.len(),
            in_flight_by_stage,
            pending_count: count(JobFilter::new().with_status(StageStatus::Pending)),
            running_count: count(JobFilter::new().with_status(StageStatus::Running)),
            awaiting_retry_count: count(JobFilter::new().with_status(StageStatus::AwaitingRetry)),
            done_count: count(JobFilter::new().with_stage(Stage::Done)),
            failed_count: count(JobFilter::new().with_stage(Stage::Failed)),
            workers_total: workers.len(),
            workers_online: workers
                .iter()
                .filter(|w| w.liveness == Liveness::Online)
                .count(),
        }
    }
}

/// Log, count and audit a liveness change observed by a heartbeat.
pub(crate) fn note_liveness_transition(
    audit: Option<&AuditHandle>,
    worker_id: &str,
    transition: LivenessTransition,
    now: DateTime<Utc>,
) {
    metrics::WORKER_LIVENESS_CHANGES
        .with_label_values(&[worker_id, transition.to.as_str()])
        .inc();
    if transition.to == Liveness::Offline {
        warn!(worker_id = %worker_id, from = %transition.from, "Worker went offline");
    }
    if let Some(audit) = audit {
        audit.try_emit_at(
            now,
            AuditEvent::WorkerLivenessChanged {
                worker_id: worker_id.to_string(),
                from: transition.from,
                to: transition.to,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SqliteJobStore;
    use crate::orchestrator::StageConcurrency;
    use crate::stage::MediaRef;
    use chrono::Duration;

    fn scheduler_with(settings: SchedulerSettings) -> PipelineScheduler {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        PipelineScheduler::new(store, settings)
    }

    fn scheduler() -> PipelineScheduler {
        let mut s = scheduler_with(SchedulerSettings::default());
        s.register_worker(WorkerSpec::local("local", 2), Utc::now());
        s
    }

    fn success_for(stage: Stage) -> StageOutcome {
        match stage {
            Stage::Identify => {
                StageOutcome::succeeded(StagePayload::Metadata(serde_json::json!({"title": "Heat"})))
            }
            other => StageOutcome::succeeded(StagePayload::Media(MediaRef::new(format!(
                "/work/{}.mkv",
                other
            )))),
        }
    }

    fn report(dispatch: &Dispatch, outcome: StageOutcome) -> DispatchReport {
        DispatchReport {
            dispatch_id: dispatch.dispatch_id,
            job_id: dispatch.job_id.clone(),
            stage: dispatch.stage,
            outcome,
        }
    }

    fn single(s: &mut PipelineScheduler, now: DateTime<Utc>) -> Dispatch {
        let mut dispatches = s.tick(now).unwrap();
        assert_eq!(dispatches.len(), 1, "expected exactly one dispatch");
        dispatches.remove(0)
    }

    #[test]
    fn test_enqueue_then_status() {
        let mut s = scheduler();
        let now = Utc::now();
        let job = s.enqueue("/downloads/heat.mkv", JobOptions::default(), now).unwrap();

        let fetched = s.status(&job.id).unwrap();
        assert_eq!(fetched.stage, Stage::Acquire);
        assert_eq!(fetched.status, StageStatus::Pending);
    }

    #[test]
    fn test_happy_path_reaches_done() {
        let mut s = scheduler();
        let now = Utc::now();
        let job = s.enqueue("/downloads/heat.mkv", JobOptions::default(), now).unwrap();

        let mut stages = Vec::new();
        for _ in 0..5 {
            let d = single(&mut s, now);
            stages.push(d.stage);
            s.apply(report(&d, success_for(d.stage)), now).unwrap();
        }

        assert_eq!(stages, Stage::PIPELINE.to_vec());
        let done = s.status(&job.id).unwrap();
        assert_eq!(done.stage, Stage::Done);
        assert_eq!(done.status, StageStatus::Succeeded);
        assert!(done.last_error.is_none());
        assert_eq!(
            done.artifacts.placed,
            Some(MediaRef::new("/work/organize.mkv"))
        );
        assert_eq!(s.registry().get("local").unwrap().current_load, 0);
    }

    #[test]
    fn test_advance_on_running_job_is_noop() {
        let mut s = scheduler();
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
        let d = s.advance(&job.id, now).unwrap().unwrap();

        assert!(s.advance(&job.id, now).unwrap().is_none());
        assert!(s.tick(now).unwrap().is_empty());
        assert_eq!(s.in_flight_count(), 1);
        assert_eq!(s.status(&job.id).unwrap().status, StageStatus::Running);
        assert_eq!(d.attempt, 1);
    }

    #[test]
    fn test_blocked_encodes_do_not_starve_newer_jobs() {
        // No worker registered: every Encode job waits.
        let mut s = scheduler_with(SchedulerSettings::default());
        let now = Utc::now();
        for i in 0..40 {
            let mut job = Job::new(
                format!("/in/{}.mkv", i),
                JobOptions::default(),
                WorkerPreference::PreferRemote,
                now - Duration::seconds(100 - i),
            );
            job.stage = Stage::Encode;
            job.artifacts.extracted = Some(MediaRef::new(format!("/work/{}.mkv", i)));
            s.store().create(&job).unwrap();
        }
        let fresh = s.enqueue("/in/fresh.mkv", JobOptions::default(), now).unwrap();

        let d = single(&mut s, now);
        assert_eq!(d.job_id, fresh.id);
        assert_eq!(d.stage, Stage::Acquire);
        assert_eq!(s.status(&fresh.id).unwrap().status, StageStatus::Running);

        let waiting = JobFilter {
            stage: Some(Stage::Encode),
            status: Some(StageStatus::Pending),
            ..Default::default()
        };
        assert_eq!(s.store().count(&waiting).unwrap(), 40);
    }

    #[test]
    fn test_disabled_stages_are_skipped() {
        let settings = SchedulerSettings {
            stages: StagesConfig::default()
                .with_stage(Stage::Extract, false)
                .with_stage(Stage::Encode, false),
            ..Default::default()
        };
        let mut s = scheduler_with(settings);
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();

        let d = single(&mut s, now);
        let after = s.apply(report(&d, success_for(d.stage)), now).unwrap().unwrap();
        assert_eq!(after.stage, Stage::Identify);
        assert_eq!(after.status, StageStatus::Pending);
        assert_eq!(s.status(&job.id).unwrap().attempts.encode, 0);
    }

    #[test]
    fn test_all_stages_disabled_completes_on_first_advance() {
        let mut stages = StagesConfig::default();
        for stage in Stage::PIPELINE {
            stages = stages.with_stage(stage, false);
        }
        let mut s = scheduler_with(SchedulerSettings {
            stages,
            ..Default::default()
        });
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();

        assert!(s.tick(now).unwrap().is_empty());
        assert_eq!(s.status(&job.id).unwrap().stage, Stage::Done);
    }

    #[test]
    fn test_retry_backoff_then_give_up() {
        let mut s = scheduler();
        let start = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), start).unwrap();
        let initial = s.policy().config().initial_delay_secs as i64;

        let d = single(&mut s, start);
        let after = s
            .apply(report(&d, StageOutcome::failed(ErrorKind::AcquireError, "503")), start)
            .unwrap()
            .unwrap();
        assert_eq!(after.status, StageStatus::AwaitingRetry);
        assert_eq!(after.next_attempt_at, Some(start + Duration::seconds(initial)));
        assert_eq!(after.attempts.acquire, 1);

        // Not due yet.
        assert!(s.tick(start).unwrap().is_empty());

        let mut now = start;
        for _ in 0..2 {
            now += Duration::days(1);
            let d = single(&mut s, now);
            s.apply(report(&d, StageOutcome::failed(ErrorKind::AcquireError, "503")), now)
                .unwrap();
        }

        let failed = s.status(&job.id).unwrap();
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.failed_stage, Some(Stage::Acquire));
        assert_eq!(failed.attempts.acquire, 3);
        assert_eq!(failed.last_error.unwrap().kind, ErrorKind::AcquireError);
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let mut s = scheduler();
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
        for _ in 0..3 {
            let d = single(&mut s, now);
            s.apply(report(&d, success_for(d.stage)), now).unwrap();
        }

        let d = single(&mut s, now);
        assert_eq!(d.stage, Stage::Identify);
        s.apply(
            report(&d, StageOutcome::fatal(ErrorKind::IdentifyAmbiguous, "two candidates")),
            now,
        )
        .unwrap();

        let failed = s.status(&job.id).unwrap();
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.attempts.identify, 1);
        let error = failed.last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::IdentifyAmbiguous);
        assert_eq!(error.message, "two candidates");
    }

    #[test]
    fn test_encode_waits_without_worker() {
        let mut s = scheduler_with(SchedulerSettings::default());
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
        for _ in 0..2 {
            let d = single(&mut s, now);
            s.apply(report(&d, success_for(d.stage)), now).unwrap();
        }

        assert!(s.tick(now).unwrap().is_empty());
        let waiting = s.status(&job.id).unwrap();
        assert_eq!(waiting.stage, Stage::Encode);
        assert_eq!(waiting.status, StageStatus::Pending);
        assert_eq!(waiting.attempts.encode, 0);

        s.register_worker(WorkerSpec::local("local", 1), now);
        let d = single(&mut s, now);
        assert!(matches!(d.work, DispatchWork::Encode { ref worker_id, .. } if worker_id == "local"));
    }

    #[test]
    fn test_late_result_after_cancel_is_discarded() {
        let mut s = scheduler();
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
        let d = single(&mut s, now);

        let cancelled = s.cancel(&job.id, now).unwrap();
        assert!(d.cancel.is_cancelled());
        assert_eq!(cancelled.stage, Stage::Failed);
        assert_eq!(cancelled.last_error.as_ref().unwrap().kind, ErrorKind::Cancelled);

        assert!(s.apply(report(&d, success_for(d.stage)), now).unwrap().is_none());
        let after = s.status(&job.id).unwrap();
        assert_eq!(after.stage, Stage::Failed);
        assert_eq!(after.failed_stage, Some(Stage::Acquire));
    }

    #[test]
    fn test_cancel_terminal_job_is_rejected() {
        let mut s = scheduler();
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
        s.cancel(&job.id, now).unwrap();

        let err = s.cancel(&job.id, now).unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
        assert!(matches!(s.cancel("missing", now), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_stage_and_global_caps() {
        let mut settings = SchedulerSettings::default();
        settings.orchestrator.stage_concurrency = StageConcurrency {
            acquire: 1,
            ..StageConcurrency::default()
        };
        let mut s = scheduler_with(settings);
        let now = Utc::now();
        for i in 0..3 {
            s.enqueue(format!("/in/{}.mkv", i), JobOptions::default(), now).unwrap();
        }
        assert_eq!(s.tick(now).unwrap().len(), 1);

        let mut settings = SchedulerSettings::default();
        settings.orchestrator.max_concurrent_dispatches = 2;
        let mut s = scheduler_with(settings);
        for i in 0..3 {
            s.enqueue(format!("/in/{}.mkv", i), JobOptions::default(), now).unwrap();
        }
        assert_eq!(s.tick(now).unwrap().len(), 2);
        assert!(s.tick(now).unwrap().is_empty());
    }

    #[test]
    fn test_priority_runs_first() {
        let mut settings = SchedulerSettings::default();
        settings.orchestrator.max_concurrent_dispatches = 1;
        let mut s = scheduler_with(settings);
        let now = Utc::now();
        s.enqueue("/in/low.mkv", JobOptions::default(), now).unwrap();
        let urgent = s
            .enqueue(
                "/in/urgent.mkv",
                JobOptions {
                    priority: 10,
                    ..Default::default()
                },
                now + Duration::seconds(1),
            )
            .unwrap();

        let d = single(&mut s, now + Duration::seconds(2));
        assert_eq!(d.job_id, urgent.id);
    }

    #[test]
    fn test_recover_resets_running_jobs() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let now = Utc::now();
        let job_id = {
            let mut first = PipelineScheduler::new(Arc::clone(&store), SchedulerSettings::default());
            let job = first.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
            single(&mut first, now);
            job.id
        };
        assert_eq!(store.get(&job_id).unwrap().unwrap().status, StageStatus::Running);

        let mut second = PipelineScheduler::new(Arc::clone(&store), SchedulerSettings::default());
        assert_eq!(second.recover(now).unwrap(), 1);

        let job = second.status(&job_id).unwrap();
        assert_eq!(job.status, StageStatus::Pending);
        assert_eq!(job.attempts.acquire, 0);
        assert_eq!(single(&mut second, now).job_id, job_id);
    }

    #[test]
    fn test_progress_only_for_current_dispatch() {
        let mut s = scheduler();
        let now = Utc::now();
        let job = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
        let d = single(&mut s, now);

        let update = |dispatch_id| ProgressUpdate {
            dispatch_id,
            job_id: job.id.clone(),
            worker_id: "local".to_string(),
            percent: 42.0,
            eta_secs: Some(60),
        };
        s.record_progress(update(d.dispatch_id + 100), now).unwrap();
        assert!(s.status(&job.id).unwrap().progress.is_none());

        s.record_progress(update(d.dispatch_id), now).unwrap();
        assert_eq!(s.status(&job.id).unwrap().progress.unwrap().percent, 42.0);
    }

    #[test]
    fn test_summary_counts() {
        let mut s = scheduler();
        let now = Utc::now();
        let a = s.enqueue("/in/a.mkv", JobOptions::default(), now).unwrap();
        s.enqueue("/in/b.mkv", JobOptions::default(), now).unwrap();
        s.advance(&a.id, now).unwrap();

        let status = s.summary(true);
        assert!(status.running);
        assert_eq!(status.in_flight, 1);
        assert_eq!(status.in_flight_by_stage.get("acquire"), Some(&1));
        assert_eq!(status.running_count, 1);
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.workers_total, 1);
        assert_eq!(status.workers_online, 1);
    }
}
