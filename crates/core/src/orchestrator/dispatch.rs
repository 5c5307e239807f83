//! Driving one encode on a worker until it finishes.

use std::sync::Arc;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::encoder::{
    EncodeHandle, EncodePoll, EncodeRequest, EncodeStatus, EncodingConfig, EncodingWorkerClient,
};
use crate::job::ErrorKind;
use crate::stage::{StageOutcome, StagePayload};

/// Submit `request` to `client`, poll it to completion and retrieve the
/// output into `<output_dir>/<job_id>`.
///
/// Every observed poll is passed to `on_progress`. Any encode that does not
/// end in a retrieved output is cancelled on the worker, so the worker can
/// drop its state and scratch files.
pub async fn drive_encode<F>(
    client: Arc<dyn EncodingWorkerClient>,
    request: EncodeRequest,
    settings: &EncodingConfig,
    cancel: CancellationToken,
    mut on_progress: F,
) -> StageOutcome
where
    F: FnMut(&EncodePoll) + Send,
{
    let job_id = request.job_id.clone();
    let worker_id = client.worker_id().to_string();

    let handle = tokio::select! {
        _ = cancel.cancelled() => return StageOutcome::cancelled(),
        submitted = client.submit(request) => match submitted {
            Ok(handle) => handle,
            Err(e) => {
                warn!(job_id = %job_id, worker_id = %worker_id, "Encode submit failed: {}", e);
                return StageOutcome::failed(e.kind(), e.to_string());
            }
        },
    };
    debug!(job_id = %job_id, worker_id = %worker_id, job_ref = %handle.job_ref, "Encode submitted");

    let started = Instant::now();
    let mut last_progress_at = started;
    let mut best_percent = 0.0_f32;
    let mut poll_failures = 0u32;

    let mut ticker = interval(settings.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                abandon(client.as_ref(), &handle).await;
                return StageOutcome::cancelled();
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        if now.duration_since(started) >= settings.timeout() {
            abandon(client.as_ref(), &handle).await;
            return StageOutcome::failed(
                ErrorKind::Timeout,
                format!("encode exceeded {}s", settings.timeout().as_secs()),
            );
        }
        if now.duration_since(last_progress_at) >= settings.stall_timeout() {
            abandon(client.as_ref(), &handle).await;
            return StageOutcome::failed(
                ErrorKind::Timeout,
                format!(
                    "no progress for {}s at {:.1}%",
                    settings.stall_timeout().as_secs(),
                    best_percent
                ),
            );
        }

        let poll = match client.poll(&handle).await {
            Ok(poll) => {
                poll_failures = 0;
                poll
            }
            Err(e) => {
                poll_failures += 1;
                debug!(
                    job_id = %job_id,
                    worker_id = %worker_id,
                    failures = poll_failures,
                    "Encode poll failed: {}",
                    e
                );
                if poll_failures >= settings.max_poll_failures.max(1) {
                    abandon(client.as_ref(), &handle).await;
                    return StageOutcome::failed(e.kind(), e.to_string());
                }
                continue;
            }
        };

        if poll.progress_percent > best_percent {
            best_percent = poll.progress_percent;
            last_progress_at = now;
        }
        on_progress(&poll);

        match poll.status {
            EncodeStatus::Running => {}
            EncodeStatus::Failed => {
                let message = poll
                    .message
                    .unwrap_or_else(|| "encode failed on worker".to_string());
                abandon(client.as_ref(), &handle).await;
                return StageOutcome::failed(ErrorKind::EncodeError, message);
            }
            EncodeStatus::Succeeded => {
                let dest_dir = settings.output_dir.join(&job_id);
                if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
                    abandon(client.as_ref(), &handle).await;
                    return StageOutcome::failed(
                        ErrorKind::EncodeError,
                        format!("cannot create {}: {}", dest_dir.display(), e),
                    );
                }
                return match client.retrieve_output(&handle, &dest_dir).await {
                    Ok(media) => StageOutcome::succeeded(StagePayload::Media(media)),
                    Err(e) => {
                        abandon(client.as_ref(), &handle).await;
                        StageOutcome::failed(e.kind(), e.to_string())
                    }
                };
            }
        }
    }
}

async fn abandon(client: &dyn EncodingWorkerClient, handle: &EncodeHandle) {
    if let Err(e) = client.cancel(handle).await {
        debug!(worker_id = %handle.worker_id, job_ref = %handle.job_ref, "Encode cancel failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodeParams;
    use crate::stage::MediaRef;
    use crate::testing::{MockEncodeBehavior, MockEncoderClient};
    use crate::worker::HardwareAccel;

    fn request() -> EncodeRequest {
        EncodeRequest {
            job_id: "job-1".to_string(),
            input: MediaRef::new("/in/movie.mkv"),
            params: EncodeParams::default(),
            accel: HardwareAccel::Software,
        }
    }

    fn settings(dir: &tempfile::TempDir) -> EncodingConfig {
        EncodingConfig {
            poll_interval_ms: 5,
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_retrieves_output() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEncoderClient::new("remote-a");
        let mut polls = Vec::new();

        let outcome = drive_encode(
            Arc::new(mock.clone()),
            request(),
            &settings(&dir),
            CancellationToken::new(),
            |p| polls.push(p.progress_percent),
        )
        .await;

        assert!(outcome.success);
        let StagePayload::Media(media) = outcome.output else {
            panic!("expected media output");
        };
        assert_eq!(media.path, dir.path().join("job-1").join("movie.mkv"));
        assert!(dir.path().join("job-1").is_dir());
        assert_eq!(polls, vec![50.0, 100.0]);
        assert_eq!(mock.retrieved().await, vec!["remote-a-1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_encode_is_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEncoderClient::new("remote-a");
        mock.push_behavior(MockEncodeBehavior::FailEncode).await;

        let outcome = drive_encode(
            Arc::new(mock.clone()),
            request(),
            &settings(&dir),
            CancellationToken::new(),
            |_| {},
        )
        .await;

        assert!(!outcome.success);
        assert!(outcome.retryable);
        assert_eq!(outcome.error_kind, Some(ErrorKind::EncodeError));
        assert_eq!(outcome.message.as_deref(), Some("ffmpeg exited with status 1"));
        assert_eq!(mock.cancelled().await, vec!["remote-a-1".to_string()]);
        assert!(mock.retrieved().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_local_encode_cleans_work_dir() {
        use crate::encoder::{LocalEncoderClient, LocalEncoderConfig};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor last; do :; done\nprintf partial > \"$last\"\necho 'Conversion failed!' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("movie.mkv");
        std::fs::write(&input, b"raw").unwrap();
        let work_dir = dir.path().join("work");
        let client = LocalEncoderClient::new(LocalEncoderConfig {
            ffmpeg_path: script,
            ffprobe_path: dir.path().join("no-ffprobe"),
            work_dir: work_dir.clone(),
            ..Default::default()
        });

        let mut req = request();
        req.input = MediaRef::new(input.clone());
        let outcome = drive_encode(
            Arc::new(client),
            req,
            &settings(&dir),
            CancellationToken::new(),
            |_| {},
        )
        .await;

        assert_eq!(outcome.error_kind, Some(ErrorKind::EncodeError));
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
        assert!(!dir.path().join("job-1").exists());
    }

    #[tokio::test]
    async fn test_submit_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEncoderClient::new("remote-a");
        mock.push_behavior(MockEncodeBehavior::SubmitTransportError).await;

        let outcome = drive_encode(
            Arc::new(mock),
            request(),
            &settings(&dir),
            CancellationToken::new(),
            |_| {},
        )
        .await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::TransportError));
    }

    #[tokio::test]
    async fn test_repeated_poll_failures_cancel_on_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEncoderClient::new("remote-a");
        mock.push_behavior(MockEncodeBehavior::PollTransportError).await;

        let outcome = drive_encode(
            Arc::new(mock.clone()),
            request(),
            &settings(&dir),
            CancellationToken::new(),
            |_| {},
        )
        .await;

        assert_eq!(outcome.error_kind, Some(ErrorKind::TransportError));
        assert_eq!(mock.cancelled().await, vec!["remote-a-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stall_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEncoderClient::new("remote-a");
        mock.push_behavior(MockEncodeBehavior::Hang).await;
        let mut config = settings(&dir);
        config.stall_timeout_secs = 0;

        let outcome = drive_encode(
            Arc::new(mock.clone()),
            request(),
            &config,
            CancellationToken::new(),
            |_| {},
        )
        .await;

        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(mock.cancelled().await.len(), 1);
    }

    #[tokio::test]
    async fn test_overall_deadline_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEncoderClient::new("remote-a");
        mock.push_behavior(MockEncodeBehavior::Hang).await;
        let mut config = settings(&dir);
        config.timeout_secs = 0;

        let outcome = drive_encode(
            Arc::new(mock.clone()),
            request(),
            &config,
            CancellationToken::new(),
            |_| {},
        )
        .await;

        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert!(outcome.retryable);
        assert_eq!(outcome.message.as_deref(), Some("encode exceeded 0s"));
        assert_eq!(mock.cancelled().await, vec!["remote-a-1".to_string()]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_encode() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEncoderClient::new("remote-a");
        mock.push_behavior(MockEncodeBehavior::Hang).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = drive_encode(Arc::new(mock.clone()), request(), &settings(&dir), cancel, |_| {}).await;

        assert_eq!(outcome.error_kind, Some(ErrorKind::Cancelled));
        assert!(!outcome.retryable);
        assert_eq!(mock.cancelled().await, vec!["remote-a-1".to_string()]);
    }
}
