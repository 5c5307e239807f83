//! In-process ffmpeg encoding worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stage::MediaRef;
use crate::worker::HardwareAccel;

use super::config::LocalEncoderConfig;
use super::error::EncoderError;
use super::traits::EncodingWorkerClient;
use super::types::{AudioCodec, EncodeHandle, EncodePoll, EncodeRequest, EncodeStatus};

static OUT_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"out_time_ms=(\d+)").unwrap_or_else(|e| panic!("{}", e)));
static SPEED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"speed=\s*(\d+\.?\d*)x").unwrap_or_else(|e| panic!("{}", e)));

#[derive(Debug, Clone)]
struct LocalJobState {
    status: EncodeStatus,
    percent: f32,
    eta_secs: Option<u64>,
    message: Option<String>,
}

struct LocalJob {
    dir: PathBuf,
    output: PathBuf,
    state: Arc<Mutex<LocalJobState>>,
    cancel: CancellationToken,
}

fn lock(state: &Mutex<LocalJobState>) -> MutexGuard<'_, LocalJobState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Encodes with an ffmpeg child process on the orchestrator host.
pub struct LocalEncoderClient {
    config: LocalEncoderConfig,
    jobs: RwLock<HashMap<String, Arc<LocalJob>>>,
}

impl LocalEncoderClient {
    pub fn new(config: LocalEncoderConfig) -> Self {
        Self {
            config,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Builds the ffmpeg argument list.
    fn build_args(&self, request: &EncodeRequest, output_path: &Path) -> Vec<String> {
        let params = &request.params;
        let encoder = params.video_codec.encoder(request.accel);

        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            request.input.path.to_string_lossy().to_string(),
            "-c:v".to_string(),
            encoder.to_string(),
        ];

        // Quality: each encoder family spells constant quality differently
        if let Some(crf) = params.crf {
            match request.accel {
                HardwareAccel::Software => args.extend(["-crf".to_string(), crf.to_string()]),
                HardwareAccel::Nvenc => args.extend(["-cq".to_string(), crf.to_string()]),
                HardwareAccel::Qsv => {
                    args.extend(["-global_quality".to_string(), crf.to_string()])
                }
                HardwareAccel::Amf => args.extend([
                    "-qp_i".to_string(),
                    crf.to_string(),
                    "-qp_p".to_string(),
                    crf.to_string(),
                ]),
            }
        } else if let Some(bitrate) = params.video_bitrate_kbps {
            args.extend(["-b:v".to_string(), format!("{}k", bitrate)]);
        }

        if matches!(request.accel, HardwareAccel::Software | HardwareAccel::Nvenc) {
            args.extend(["-preset".to_string(), params.preset.clone()]);
        }

        args.extend(["-c:a".to_string(), params.audio_codec.ffmpeg_codec().to_string()]);
        if params.audio_codec != AudioCodec::Copy {
            args.extend(["-b:a".to_string(), format!("{}k", params.audio_bitrate_kbps)]);
        }

        args.extend([
            "-loglevel".to_string(),
            self.config.ffmpeg_log_level.clone(),
            "-progress".to_string(),
            "pipe:2".to_string(),
            "-nostats".to_string(),
        ]);
        args.extend(self.config.extra_ffmpeg_args.iter().cloned());
        args.push(output_path.to_string_lossy().to_string());
        args
    }

    /// Input duration in seconds, `None` if ffprobe is unavailable.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            format: ProbeFormat,
        }

        #[derive(Deserialize)]
        struct ProbeFormat {
            duration: Option<String>,
        }

        let output = Command::new(&self.config.ffprobe_path)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let probe: ProbeOutput = serde_json::from_slice(&output.stdout).ok()?;
        probe.format.duration?.parse().ok()
    }

    async fn job(&self, handle: &EncodeHandle) -> Result<Arc<LocalJob>, EncoderError> {
        self.jobs
            .read()
            .await
            .get(&handle.job_ref)
            .cloned()
            .ok_or_else(|| EncoderError::UnknownHandle(handle.job_ref.clone()))
    }
}

/// Reads ffmpeg progress until the process exits or the job is cancelled.
async fn drive_ffmpeg(
    mut child: Child,
    stderr: ChildStderr,
    duration_secs: Option<f64>,
    state: Arc<Mutex<LocalJobState>>,
    cancel: CancellationToken,
    job_ref: String,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut error_output = String::new();
    let mut current_secs = 0.0f64;
    let mut speed: Option<f64> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                debug!(job_ref = %job_ref, "Killed cancelled ffmpeg process");
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.contains("Error") || line.contains("error") {
                        error_output.push_str(&line);
                        error_output.push('\n');
                    }
                    if let Some(us) = OUT_TIME
                        .captures(&line)
                        .and_then(|c| c.get(1))
                        .and_then(|m| m.as_str().parse::<f64>().ok())
                    {
                        current_secs = us / 1_000_000.0;
                    }
                    if let Some(s) = SPEED
                        .captures(&line)
                        .and_then(|c| c.get(1))
                        .and_then(|m| m.as_str().parse::<f64>().ok())
                    {
                        speed = Some(s);
                    }

                    if let Some(total) = duration_secs.filter(|d| *d > 0.0) {
                        let mut s = lock(&state);
                        s.percent = (current_secs / total * 100.0).clamp(0.0, 100.0) as f32;
                        s.eta_secs = speed
                            .filter(|v| *v > 0.0)
                            .map(|v| ((total - current_secs).max(0.0) / v) as u64);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };

    let mut s = lock(&state);
    match status {
        Ok(status) if status.success() => {
            s.status = EncodeStatus::Succeeded;
            s.percent = 100.0;
            s.eta_secs = Some(0);
            info!(job_ref = %job_ref, "Local encode finished");
        }
        Ok(status) => {
            s.status = EncodeStatus::Failed;
            s.message = Some(if error_output.is_empty() {
                format!("ffmpeg exited with code {:?}", status.code())
            } else {
                error_output.trim().to_string()
            });
            warn!(job_ref = %job_ref, code = ?status.code(), "Local encode failed");
        }
        Err(e) => {
            s.status = EncodeStatus::Failed;
            s.message = Some(format!("failed to wait for ffmpeg: {}", e));
        }
    }
}

/// Rename, falling back to copy + remove across filesystems.
async fn move_file(source: &Path, destination: &Path) -> std::io::Result<u64> {
    match tokio::fs::rename(source, destination).await {
        Ok(()) => return Ok(tokio::fs::metadata(destination).await?.len()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18) => {}
        Err(e) => return Err(e),
    }
    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::File::create(destination).await?;
    let mut buffer = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    tokio::fs::remove_file(source).await?;
    Ok(total)
}

#[async_trait]
impl EncodingWorkerClient for LocalEncoderClient {
    fn worker_id(&self) -> &str {
        &self.config.id
    }

    async fn health(&self) -> Result<(), EncoderError> {
        let status = Command::new(&self.config.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EncoderError::FfmpegNotFound {
                        path: self.config.ffmpeg_path.clone(),
                    }
                } else {
                    EncoderError::Io(e)
                }
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(EncoderError::encode_failed("ffmpeg -version failed", None))
        }
    }

    async fn submit(&self, request: EncodeRequest) -> Result<EncodeHandle, EncoderError> {
        let input = &request.input.path;
        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(EncoderError::InputNotFound {
                path: input.clone(),
            });
        }

        let job_ref = uuid::Uuid::new_v4().to_string();
        let dir = self.config.work_dir.join(&job_ref);
        tokio::fs::create_dir_all(&dir).await?;
        let output_name = request.output_file_name();
        let output = dir.join(&output_name);

        let duration_secs = self.probe_duration(input).await;
        let args = self.build_args(&request, &output);
        debug!(job_id = %request.job_id, ?args, "Starting ffmpeg");

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EncoderError::FfmpegNotFound {
                        path: self.config.ffmpeg_path.clone(),
                    }
                } else {
                    EncoderError::Io(e)
                }
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EncoderError::encode_failed("ffmpeg stderr not captured", None))?;

        let state = Arc::new(Mutex::new(LocalJobState {
            status: EncodeStatus::Running,
            percent: 0.0,
            eta_secs: None,
            message: None,
        }));
        let cancel = CancellationToken::new();
        tokio::spawn(drive_ffmpeg(
            child,
            stderr,
            duration_secs,
            Arc::clone(&state),
            cancel.clone(),
            job_ref.clone(),
        ));

        self.jobs.write().await.insert(
            job_ref.clone(),
            Arc::new(LocalJob {
                dir,
                output,
                state,
                cancel,
            }),
        );
        info!(
            job_id = %request.job_id,
            job_ref = %job_ref,
            encoder = request.params.video_codec.encoder(request.accel),
            "Local encode started"
        );

        Ok(EncodeHandle {
            worker_id: self.config.id.clone(),
            job_ref,
            token: None,
            output_name,
        })
    }

    async fn poll(&self, handle: &EncodeHandle) -> Result<EncodePoll, EncoderError> {
        let job = self.job(handle).await?;
        let s = lock(&job.state).clone();
        Ok(EncodePoll {
            status: s.status,
            progress_percent: s.percent,
            eta_secs: s.eta_secs,
            message: s.message,
        })
    }

    async fn cancel(&self, handle: &EncodeHandle) -> Result<(), EncoderError> {
        let Some(job) = self.jobs.write().await.remove(&handle.job_ref) else {
            return Ok(());
        };
        job.cancel.cancel();
        if let Err(e) = tokio::fs::remove_dir_all(&job.dir).await {
            debug!("Could not remove {}: {}", job.dir.display(), e);
        }
        Ok(())
    }

    async fn retrieve_output(
        &self,
        handle: &EncodeHandle,
        dest_dir: &Path,
    ) -> Result<MediaRef, EncoderError> {
        let job = self.job(handle).await?;
        let state = lock(&job.state).clone();
        if state.status != EncodeStatus::Succeeded {
            return Err(EncoderError::encode_failed(
                format!("encode is {:?}, no output to retrieve", state.status),
                state.message,
            ));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let destination = dest_dir.join(&handle.output_name);
        let size = move_file(&job.output, &destination).await?;

        self.jobs.write().await.remove(&handle.job_ref);
        let _ = tokio::fs::remove_dir_all(&job.dir).await;

        Ok(MediaRef::new(destination).with_size(size))
    }
}
