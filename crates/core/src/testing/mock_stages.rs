//! Scriptable stage collaborators.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::job::Stage;
use crate::stage::{
    AcquireService, ExtractService, IdentifyService, MediaRef, OrganizeService, StageOutcome,
    StagePayload, StageServices,
};

#[derive(Debug, Default)]
struct Inner {
    /// Outcomes returned before falling back to the default success.
    scripted: HashMap<Stage, VecDeque<StageOutcome>>,
    calls: HashMap<Stage, usize>,
    extract_calls: Vec<Vec<String>>,
    placed: Vec<(MediaRef, Option<PathBuf>)>,
    /// Extract succeeds only when this password leads the candidates.
    accepted_password: Option<String>,
    delay: Duration,
}

/// Mock implementation of every stage collaborator.
///
/// Each stage succeeds by default with a plausible payload. Tests queue
/// specific outcomes per stage with [`push_outcome`](Self::push_outcome);
/// queued outcomes are consumed in order before the default applies.
///
/// # Example
///
/// ```rust,ignore
/// use mediarelay_core::testing::MockStageServices;
///
/// let mock = MockStageServices::new();
/// mock.push_outcome(Stage::Acquire, StageOutcome::failed(ErrorKind::AcquireError, "503")).await;
/// let executor = StageExecutor::new(mock.services(), StageTimeouts::default());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockStageServices {
    inner: Arc<RwLock<Inner>>,
}

impl MockStageServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this mock as the collaborators of a stage executor.
    pub fn services(&self) -> StageServices {
        StageServices {
            acquire: Arc::new(self.clone()),
            extract: Arc::new(self.clone()),
            identify: Arc::new(self.clone()),
            organize: Arc::new(self.clone()),
        }
    }

    /// Queue an outcome for the next call of `stage`.
    pub async fn push_outcome(&self, stage: Stage, outcome: StageOutcome) {
        self.inner
            .write()
            .await
            .scripted
            .entry(stage)
            .or_default()
            .push_back(outcome);
    }

    /// Make extraction fail with a retryable `ExtractionError` unless
    /// `password` is the first candidate offered.
    pub async fn require_password(&self, password: impl Into<String>) {
        self.inner.write().await.accepted_password = Some(password.into());
    }

    /// Delay every call by `delay` before answering.
    pub async fn set_delay(&self, delay: Duration) {
        self.inner.write().await.delay = delay;
    }

    pub async fn call_count(&self, stage: Stage) -> usize {
        self.inner
            .read()
            .await
            .calls
            .get(&stage)
            .copied()
            .unwrap_or(0)
    }

    /// Password lists passed to each extract call.
    pub async fn extract_calls(&self) -> Vec<Vec<String>> {
        self.inner.read().await.extract_calls.clone()
    }

    /// Media placed by the organizer with their destination override.
    pub async fn placed(&self) -> Vec<(MediaRef, Option<PathBuf>)> {
        self.inner.read().await.placed.clone()
    }

    /// Record a call and take the next scripted outcome, if any.
    async fn begin(&self, stage: Stage) -> Option<StageOutcome> {
        let delay = {
            let mut inner = self.inner.write().await;
            *inner.calls.entry(stage).or_insert(0) += 1;
            inner.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .write()
            .await
            .scripted
            .get_mut(&stage)
            .and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl AcquireService for MockStageServices {
    async fn fetch(&self, source_ref: &str) -> StageOutcome {
        if let Some(outcome) = self.begin(Stage::Acquire).await {
            return outcome;
        }
        StageOutcome::succeeded(StagePayload::Media(
            MediaRef::new(source_ref).with_size(1024 * 1024),
        ))
    }
}

#[async_trait]
impl ExtractService for MockStageServices {
    async fn extract(&self, item: &MediaRef, password_candidates: &[String]) -> StageOutcome {
        self.inner
            .write()
            .await
            .extract_calls
            .push(password_candidates.to_vec());
        if let Some(outcome) = self.begin(Stage::Extract).await {
            return outcome;
        }

        let accepted = self.inner.read().await.accepted_password.clone();
        if let Some(accepted) = accepted {
            if password_candidates.first() != Some(&accepted) {
                return StageOutcome::failed(
                    crate::job::ErrorKind::ExtractionError,
                    "wrong password",
                );
            }
        }

        let extracted = item.path.with_extension("mkv");
        StageOutcome::succeeded(StagePayload::Media(MediaRef::new(extracted)))
    }
}

#[async_trait]
impl IdentifyService for MockStageServices {
    async fn identify(&self, media: &MediaRef) -> StageOutcome {
        if let Some(outcome) = self.begin(Stage::Identify).await {
            return outcome;
        }
        StageOutcome::succeeded(StagePayload::Metadata(serde_json::json!({
            "title": media.file_name(),
            "year": 2001,
        })))
    }
}

#[async_trait]
impl OrganizeService for MockStageServices {
    async fn place(
        &self,
        media: &MediaRef,
        _metadata: Option<&serde_json::Value>,
        dest_dir: Option<&Path>,
    ) -> StageOutcome {
        if let Some(outcome) = self.begin(Stage::Organize).await {
            return outcome;
        }
        self.inner
            .write()
            .await
            .placed
            .push((media.clone(), dest_dir.map(Path::to_path_buf)));

        let root = dest_dir.unwrap_or_else(|| Path::new("/library"));
        StageOutcome::succeeded(StagePayload::Media(MediaRef::new(
            root.join(media.file_name()),
        )))
    }
}
