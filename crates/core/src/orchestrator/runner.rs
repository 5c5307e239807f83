//! Pipeline orchestrator.
//!
//! Owns the [`PipelineScheduler`] from a single event loop task:
//! - Commands (enqueue, cancel, worker changes) arrive over a channel
//! - Each dispatch runs in its own task and reports back over a channel
//! - Heartbeat probes run concurrently and only touch per-worker liveness
//!
//! While stopped, the scheduler is parked and commands run on it directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::AuditHandle;
use crate::encoder::{EncodingConfig, EncodingWorkerClient};
use crate::job::{ErrorKind, Job, JobFilter, JobOptions, JobStore};
use crate::metrics;
use crate::stage::{StageExecutor, StageOutcome};
use crate::worker::{Liveness, LivenessCell, WorkerRecord, WorkerSpec};

use super::config::OrchestratorConfig;
use super::dispatch::drive_encode;
use super::scheduler::{note_liveness_transition, PipelineScheduler};
use super::types::{
    Dispatch, DispatchReport, DispatchWork, OrchestratorError, OrchestratorStatus, ProgressUpdate,
};

type Clients = Arc<RwLock<HashMap<String, Arc<dyn EncodingWorkerClient>>>>;
type SchedulerOp = Box<dyn FnOnce(&mut PipelineScheduler) + Send>;

enum Command {
    Run(SchedulerOp),
    Tick(oneshot::Sender<usize>),
}

/// Drives jobs through the pipeline.
pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    encoding: Arc<EncodingConfig>,
    store: Arc<dyn JobStore>,
    executor: StageExecutor,
    clients: Clients,
    audit: Option<AuditHandle>,

    // Runtime state
    parked: Mutex<Option<PipelineScheduler>>,
    commands: RwLock<Option<mpsc::Sender<Command>>>,
    loop_handle: Mutex<Option<JoinHandle<PipelineScheduler>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        encoding: EncodingConfig,
        scheduler: PipelineScheduler,
        executor: StageExecutor,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            encoding: Arc::new(encoding),
            store: Arc::clone(scheduler.store()),
            audit: scheduler.audit().cloned(),
            executor,
            clients: Arc::new(RwLock::new(HashMap::new())),
            parked: Mutex::new(Some(scheduler)),
            commands: RwLock::new(None),
            loop_handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start the scheduling loop. Jobs left Running by a previous run are
    /// recovered first.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return Ok(());
        }

        let Some(mut scheduler) = self.parked.lock().await.take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(OrchestratorError::LoopStopped);
        };

        info!("Starting pipeline orchestrator");

        if let Err(e) = scheduler.recover(Utc::now()) {
            warn!("Failed to recover interrupted jobs: {}", e);
        }

        let (tx, rx) = mpsc::channel(64);
        *self.commands.write().await = Some(tx);

        let context = LoopContext {
            config: self.config.clone(),
            runtime: DispatchRuntime {
                executor: self.executor.clone(),
                encoding: Arc::clone(&self.encoding),
                clients: Arc::clone(&self.clients),
                reports: None,
                progress: None,
            },
            audit: self.audit.clone(),
        };
        let handle = tokio::spawn(run_loop(
            scheduler,
            context,
            rx,
            self.shutdown_tx.subscribe(),
        ));
        *self.loop_handle.lock().await = Some(handle);

        info!("Pipeline orchestrator started");
        Ok(())
    }

    /// Stop the scheduling loop.
    ///
    /// In-flight executions are signalled to stop; their jobs stay Running
    /// and are recovered by the next [`start`](Self::start).
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping pipeline orchestrator");

        self.commands.write().await.take();
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.loop_handle.lock().await.take() {
            match handle.await {
                Ok(mut scheduler) => {
                    let aborted = scheduler.abort_in_flight();
                    if aborted > 0 {
                        info!("Abandoned {} in-flight stage executions", aborted);
                    }
                    *self.parked.lock().await = Some(scheduler);
                }
                Err(e) => error!("Scheduling loop terminated abnormally: {}", e),
            }
        }

        info!("Pipeline orchestrator stopped");
    }

    /// Run `op` on the scheduler, inside the loop when it is running.
    async fn execute<R, F>(&self, op: F) -> Result<R, OrchestratorError>
    where
        R: Send + 'static,
        F: FnOnce(&mut PipelineScheduler) -> R + Send + 'static,
    {
        let sender = self.commands.read().await.clone();
        if let Some(tx) = sender {
            let (reply_tx, reply_rx) = oneshot::channel();
            let command = Command::Run(Box::new(move |scheduler| {
                let _ = reply_tx.send(op(scheduler));
            }));
            tx.send(command)
                .await
                .map_err(|_| OrchestratorError::LoopStopped)?;
            return reply_rx.await.map_err(|_| OrchestratorError::LoopStopped);
        }

        let mut parked = self.parked.lock().await;
        let scheduler = parked.as_mut().ok_or(OrchestratorError::LoopStopped)?;
        Ok(op(scheduler))
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Register an encoding worker together with its client.
    pub async fn add_worker(
        &self,
        spec: WorkerSpec,
        client: Arc<dyn EncodingWorkerClient>,
    ) -> Result<WorkerRecord, OrchestratorError> {
        {
            let mut clients = self.clients.write().await;
            if clients.contains_key(&spec.id) {
                return Err(OrchestratorError::DuplicateWorker(spec.id));
            }
            clients.insert(spec.id.clone(), client);
        }

        self.execute(move |s| s.register_worker(spec, Utc::now()))
            .await
    }

    /// Deregister a worker. Encodes already running on it finish normally.
    pub async fn remove_worker(&self, id: &str) -> Result<WorkerRecord, OrchestratorError> {
        let worker_id = id.to_string();
        let removed = self
            .execute(move |s| s.deregister_worker(&worker_id, Utc::now()))
            .await?
            .ok_or_else(|| OrchestratorError::WorkerNotFound(id.to_string()))?;
        self.clients.write().await.remove(id);
        info!(worker_id = %id, "Deregistered encoding worker");
        Ok(removed)
    }

    pub async fn workers(&self) -> Result<Vec<WorkerRecord>, OrchestratorError> {
        self.execute(|s| s.workers()).await
    }

    /// Probe every worker once and return the resulting liveness.
    pub async fn heartbeat(&self) -> Result<Vec<(String, Liveness)>, OrchestratorError> {
        let targets = self.execute(|s| heartbeat_targets(s)).await?;
        let clients = self.clients.read().await.clone();
        Ok(probe_workers(
            targets,
            clients,
            self.config.heartbeat_timeout(),
            self.audit.clone(),
        )
        .await)
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn enqueue(
        &self,
        source_ref: impl Into<String>,
        options: JobOptions,
    ) -> Result<Job, OrchestratorError> {
        let source_ref = source_ref.into();
        Ok(self
            .execute(move |s| s.enqueue(source_ref, options, Utc::now()))
            .await??)
    }

    pub async fn status(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| OrchestratorError::Job(crate::job::JobError::NotFound(job_id.to_string())))
    }

    pub async fn cancel(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let job_id = job_id.to_string();
        Ok(self.execute(move |s| s.cancel(&job_id, Utc::now())).await??)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.store.list(filter)?)
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> Result<i64, OrchestratorError> {
        Ok(self.store.count(filter)?)
    }

    pub async fn summary(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        let running = self.is_running();
        self.execute(move |s| s.summary(running)).await
    }

    /// Run one scheduling pass now instead of waiting for the poll
    /// interval. Returns the number of dispatches started.
    pub async fn tick(&self) -> Result<usize, OrchestratorError> {
        let tx = self
            .commands
            .read()
            .await
            .clone()
            .ok_or(OrchestratorError::NotRunning)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Tick(reply_tx))
            .await
            .map_err(|_| OrchestratorError::LoopStopped)?;
        reply_rx.await.map_err(|_| OrchestratorError::LoopStopped)
    }
}

struct LoopContext {
    config: OrchestratorConfig,
    runtime: DispatchRuntime,
    audit: Option<AuditHandle>,
}

/// What a dispatch task needs to run and report.
struct DispatchRuntime {
    executor: StageExecutor,
    encoding: Arc<EncodingConfig>,
    clients: Clients,
    reports: Option<mpsc::UnboundedSender<DispatchReport>>,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl DispatchRuntime {
    /// Start every due job and spawn its execution.
    async fn dispatch_due(&self, scheduler: &mut PipelineScheduler) -> usize {
        let dispatches = match scheduler.tick(Utc::now()) {
            Ok(dispatches) => dispatches,
            Err(e) => {
                warn!("Failed to list due jobs: {}", e);
                return 0;
            }
        };
        let count = dispatches.len();
        for dispatch in dispatches {
            self.spawn(dispatch).await;
        }
        count
    }

    async fn spawn(&self, dispatch: Dispatch) {
        let (Some(reports), Some(progress_tx)) = (self.reports.clone(), self.progress.clone())
        else {
            return;
        };
        let Dispatch {
            dispatch_id,
            job_id,
            stage,
            cancel,
            work,
            ..
        } = dispatch;

        match work {
            DispatchWork::Stage(input) => {
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = executor.run(stage, &input, &cancel).await;
                    metrics::STAGE_DURATION
                        .with_label_values(&[stage.as_str()])
                        .observe(started.elapsed().as_secs_f64());
                    let _ = reports.send(DispatchReport {
                        dispatch_id,
                        job_id,
                        stage,
                        outcome,
                    });
                });
            }
            DispatchWork::Encode { worker_id, request } => {
                let client = self.clients.read().await.get(&worker_id).cloned();
                let Some(client) = client else {
                    warn!(job_id = %job_id, worker_id = %worker_id, "No client for selected worker");
                    let _ = reports.send(DispatchReport {
                        dispatch_id,
                        job_id,
                        stage,
                        outcome: StageOutcome::failed(
                            ErrorKind::TransportError,
                            format!("worker {} has no client", worker_id),
                        ),
                    });
                    return;
                };

                let encoding = Arc::clone(&self.encoding);
                tokio::spawn(async move {
                    let started = Instant::now();
                    let progress_job = job_id.clone();
                    let progress_worker = worker_id.clone();
                    let outcome = drive_encode(client, request, &encoding, cancel, |poll| {
                        let _ = progress_tx.send(ProgressUpdate {
                            dispatch_id,
                            job_id: progress_job.clone(),
                            worker_id: progress_worker.clone(),
                            percent: poll.progress_percent,
                            eta_secs: poll.eta_secs,
                        });
                    })
                    .await;
                    metrics::STAGE_DURATION
                        .with_label_values(&[stage.as_str()])
                        .observe(started.elapsed().as_secs_f64());
                    let _ = reports.send(DispatchReport {
                        dispatch_id,
                        job_id,
                        stage,
                        outcome,
                    });
                });
            }
        }
    }
}

async fn run_loop(
    mut scheduler: PipelineScheduler,
    mut context: LoopContext,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> PipelineScheduler {
    info!("Scheduling loop started");

    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let (progress_tx, mut progress) = mpsc::unbounded_channel();
    context.runtime.reports = Some(report_tx);
    context.runtime.progress = Some(progress_tx);
    let runtime = &context.runtime;

    let mut poll = interval(context.config.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = interval(context.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Scheduling loop received shutdown signal");
                break;
            }
            Some(command) = commands.recv() => {
                match command {
                    Command::Run(op) => {
                        op(&mut scheduler);
                        runtime.dispatch_due(&mut scheduler).await;
                    }
                    Command::Tick(reply) => {
                        let started = runtime.dispatch_due(&mut scheduler).await;
                        let _ = reply.send(started);
                    }
                }
            }
            Some(report) = reports.recv() => {
                let job_id = report.job_id.clone();
                if let Err(e) = scheduler.apply(report, Utc::now()) {
                    warn!(job_id = %job_id, "Failed to apply stage result: {}", e);
                }
                runtime.dispatch_due(&mut scheduler).await;
            }
            Some(update) = progress.recv() => {
                if let Err(e) = scheduler.record_progress(update, Utc::now()) {
                    debug!("Failed to record encode progress: {}", e);
                }
            }
            _ = poll.tick() => {
                runtime.dispatch_due(&mut scheduler).await;
            }
            _ = heartbeat.tick() => {
                let targets = heartbeat_targets(&scheduler);
                if !targets.is_empty() {
                    let clients = runtime.clients.read().await.clone();
                    tokio::spawn(probe_workers(
                        targets,
                        clients,
                        context.config.heartbeat_timeout(),
                        context.audit.clone(),
                    ));
                }
            }
        }
    }

    info!("Scheduling loop stopped");
    scheduler
}

fn heartbeat_targets(scheduler: &PipelineScheduler) -> Vec<(String, Arc<LivenessCell>)> {
    let registry = scheduler.registry();
    registry
        .ids()
        .into_iter()
        .filter_map(|id| registry.liveness_handle(&id).map(|cell| (id, cell)))
        .collect()
}

/// Probe workers concurrently. A probe that errors or exceeds `timeout`
/// counts as a miss.
async fn probe_workers(
    targets: Vec<(String, Arc<LivenessCell>)>,
    clients: HashMap<String, Arc<dyn EncodingWorkerClient>>,
    timeout: Duration,
    audit: Option<AuditHandle>,
) -> Vec<(String, Liveness)> {
    let probes = targets.into_iter().map(|(id, cell)| {
        let client = clients.get(&id).cloned();
        let audit = audit.clone();
        async move {
            let reachable = match client {
                Some(client) => matches!(
                    tokio::time::timeout(timeout, client.health()).await,
                    Ok(Ok(()))
                ),
                None => false,
            };
            if !reachable {
                debug!(worker_id = %id, "Heartbeat missed");
            }
            if let Some(transition) = cell.record(reachable) {
                note_liveness_transition(audit.as_ref(), &id, transition, Utc::now());
            }
            (id, cell.get())
        }
    });
    futures::future::join_all(probes).await
}
