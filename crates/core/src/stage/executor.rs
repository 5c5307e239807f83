//! Uniform execution wrapper for the non-encode stages.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::job::{ErrorKind, Stage};

use super::config::StageTimeouts;
use super::traits::StageServices;
use super::types::{StageInput, StageOutcome};

/// Runs Acquire, Extract, Identify and Organize through their collaborators
/// with a deadline and cancellation. Encode is dispatched to workers by the
/// orchestrator instead.
#[derive(Clone)]
pub struct StageExecutor {
    services: StageServices,
    timeouts: StageTimeouts,
}

impl StageExecutor {
    pub fn new(services: StageServices, timeouts: StageTimeouts) -> Self {
        Self { services, timeouts }
    }

    pub async fn run(
        &self,
        stage: Stage,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let deadline = self.timeouts.for_stage(stage);
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => StageOutcome::cancelled(),
            result = tokio::time::timeout(deadline, self.invoke(stage, input)) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(job_id = %input.job_id, stage = %stage, "Stage timed out after {:?}", deadline);
                    StageOutcome::failed(
                        ErrorKind::Timeout,
                        format!("{} timed out after {}s", stage, deadline.as_secs()),
                    )
                }
            },
        };

        debug!(
            job_id = %input.job_id,
            stage = %stage,
            success = outcome.success,
            duration_ms = started.elapsed().as_millis() as u64,
            "Stage execution finished"
        );
        outcome
    }

    async fn invoke(&self, stage: Stage, input: &StageInput) -> StageOutcome {
        match stage {
            Stage::Acquire => self.services.acquire.fetch(&input.source_ref).await,
            Stage::Extract => {
                let Some(item) = input.media.as_ref() else {
                    return missing_input(stage);
                };
                let passwords = input.rotated_passwords();
                self.services.extract.extract(item, &passwords).await
            }
            Stage::Identify => {
                let Some(media) = input.media.as_ref() else {
                    return missing_input(stage);
                };
                self.services.identify.identify(media).await
            }
            Stage::Organize => {
                let Some(media) = input.media.as_ref() else {
                    return missing_input(stage);
                };
                self.services
                    .organize
                    .place(media, input.metadata.as_ref(), input.dest_dir.as_deref())
                    .await
            }
            Stage::Encode | Stage::Done | Stage::Failed => StageOutcome::fatal(
                stage.default_error_kind(),
                format!("{} is not executed by the stage executor", stage),
            ),
        }
    }
}

fn missing_input(stage: Stage) -> StageOutcome {
    StageOutcome::fatal(
        stage.default_error_kind(),
        format!("{} has no input media", stage),
    )
}
