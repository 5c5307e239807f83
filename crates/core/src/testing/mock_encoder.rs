//! Scriptable encoding worker.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::encoder::{
    EncodeHandle, EncodePoll, EncodeRequest, EncodeStatus, EncoderError, EncodingWorkerClient,
};
use crate::stage::MediaRef;

/// How one submitted encode behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEncodeBehavior {
    /// Runs for the configured number of polls, then succeeds.
    Succeed,
    /// Submit fails with a transport error.
    SubmitTransportError,
    /// Submit is rejected by the worker.
    SubmitRejected,
    /// Runs, then reports a failed encode.
    FailEncode,
    /// Every poll fails with a transport error.
    PollTransportError,
    /// Stays at 10% forever.
    Hang,
}

#[derive(Debug)]
struct RunningEncode {
    behavior: MockEncodeBehavior,
    polls_left: u32,
}

#[derive(Debug)]
struct Inner {
    script: VecDeque<MockEncodeBehavior>,
    running: HashMap<String, RunningEncode>,
    submitted: Vec<EncodeRequest>,
    cancelled: Vec<String>,
    retrieved: Vec<String>,
    healthy: bool,
    polls_before_done: u32,
    next_ref: u64,
}

/// Mock implementation of [`EncodingWorkerClient`].
///
/// Submits follow a queue of [`MockEncodeBehavior`]s and default to
/// [`MockEncodeBehavior::Succeed`] once the queue is empty.
#[derive(Debug, Clone)]
pub struct MockEncoderClient {
    worker_id: String,
    inner: Arc<RwLock<Inner>>,
}

impl MockEncoderClient {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            inner: Arc::new(RwLock::new(Inner {
                script: VecDeque::new(),
                running: HashMap::new(),
                submitted: Vec::new(),
                cancelled: Vec::new(),
                retrieved: Vec::new(),
                healthy: true,
                polls_before_done: 1,
                next_ref: 0,
            })),
        }
    }

    /// Queue the behavior of the next submit.
    pub async fn push_behavior(&self, behavior: MockEncodeBehavior) {
        self.inner.write().await.script.push_back(behavior);
    }

    /// Queue `count` submits with the same behavior.
    pub async fn push_behaviors(&self, behavior: MockEncodeBehavior, count: usize) {
        let mut inner = self.inner.write().await;
        for _ in 0..count {
            inner.script.push_back(behavior);
        }
    }

    pub async fn set_healthy(&self, healthy: bool) {
        self.inner.write().await.healthy = healthy;
    }

    /// Number of `Running` polls before a scripted encode finishes.
    pub async fn set_polls_before_done(&self, polls: u32) {
        self.inner.write().await.polls_before_done = polls;
    }

    pub async fn submitted(&self) -> Vec<EncodeRequest> {
        self.inner.read().await.submitted.clone()
    }

    pub async fn submit_count(&self) -> usize {
        self.inner.read().await.submitted.len()
    }

    /// Worker job refs that were cancelled.
    pub async fn cancelled(&self) -> Vec<String> {
        self.inner.read().await.cancelled.clone()
    }

    pub async fn retrieved(&self) -> Vec<String> {
        self.inner.read().await.retrieved.clone()
    }
}

#[async_trait]
impl EncodingWorkerClient for MockEncoderClient {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn health(&self) -> Result<(), EncoderError> {
        if self.inner.read().await.healthy {
            Ok(())
        } else {
            Err(EncoderError::transport(&self.worker_id, "connection refused"))
        }
    }

    async fn submit(&self, request: EncodeRequest) -> Result<EncodeHandle, EncoderError> {
        let mut inner = self.inner.write().await;
        let behavior = inner.script.pop_front().unwrap_or(MockEncodeBehavior::Succeed);
        let output_name = request.output_file_name();
        inner.submitted.push(request);

        match behavior {
            MockEncodeBehavior::SubmitTransportError => {
                return Err(EncoderError::transport(&self.worker_id, "connection refused"));
            }
            MockEncodeBehavior::SubmitRejected => {
                return Err(EncoderError::encode_failed("unsupported codec", None));
            }
            _ => {}
        }

        inner.next_ref += 1;
        let job_ref = format!("{}-{}", self.worker_id, inner.next_ref);
        let polls_left = inner.polls_before_done;
        inner.running.insert(
            job_ref.clone(),
            RunningEncode {
                behavior,
                polls_left,
            },
        );

        Ok(EncodeHandle {
            worker_id: self.worker_id.clone(),
            job_ref,
            token: None,
            output_name,
        })
    }

    async fn poll(&self, handle: &EncodeHandle) -> Result<EncodePoll, EncoderError> {
        let mut inner = self.inner.write().await;
        let encode = inner
            .running
            .get_mut(&handle.job_ref)
            .ok_or_else(|| EncoderError::UnknownHandle(handle.job_ref.clone()))?;

        match encode.behavior {
            MockEncodeBehavior::PollTransportError => {
                return Err(EncoderError::transport(&self.worker_id, "read timed out"));
            }
            MockEncodeBehavior::Hang => return Ok(EncodePoll::running(10.0, None)),
            _ => {}
        }

        if encode.polls_left > 0 {
            encode.polls_left -= 1;
            return Ok(EncodePoll::running(50.0, Some(30)));
        }

        let poll = match encode.behavior {
            MockEncodeBehavior::FailEncode => EncodePoll {
                status: EncodeStatus::Failed,
                progress_percent: 50.0,
                eta_secs: None,
                message: Some("ffmpeg exited with status 1".to_string()),
            },
            _ => EncodePoll {
                status: EncodeStatus::Succeeded,
                progress_percent: 100.0,
                eta_secs: Some(0),
                message: None,
            },
        };
        Ok(poll)
    }

    async fn cancel(&self, handle: &EncodeHandle) -> Result<(), EncoderError> {
        let mut inner = self.inner.write().await;
        inner.running.remove(&handle.job_ref);
        inner.cancelled.push(handle.job_ref.clone());
        Ok(())
    }

    async fn retrieve_output(
        &self,
        handle: &EncodeHandle,
        dest_dir: &Path,
    ) -> Result<MediaRef, EncoderError> {
        let mut inner = self.inner.write().await;
        if inner.running.remove(&handle.job_ref).is_none() {
            return Err(EncoderError::UnknownHandle(handle.job_ref.clone()));
        }
        inner.retrieved.push(handle.job_ref.clone());
        Ok(MediaRef::new(dest_dir.join(&handle.output_name)))
    }
}
