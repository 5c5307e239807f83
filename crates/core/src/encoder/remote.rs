//! HTTP client for remote encoding workers.
//!
//! Protocol (all requests carry `Authorization: Bearer <api key>` when one
//! is configured; job-scoped requests also carry `X-Job-Token`):
//!
//! - `GET    /api/health`
//! - `POST   /api/jobs`                  register, returns `{id, token}`
//! - `PUT    /api/jobs/{id}/input?offset` upload one chunk
//! - `POST   /api/jobs/{id}/start`
//! - `GET    /api/jobs/{id}`             status and progress
//! - `DELETE /api/jobs/{id}`             cancel (404 is fine)
//! - `GET    /api/jobs/{id}/output`      ranged download

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::stage::MediaRef;
use crate::worker::HardwareAccel;

use super::config::RemoteWorkerConfig;
use super::error::EncoderError;
use super::traits::EncodingWorkerClient;
use super::types::{EncodeHandle, EncodeParams, EncodePoll, EncodeRequest, EncodeStatus};

const JOB_TOKEN_HEADER: &str = "X-Job-Token";

#[derive(Debug, Serialize)]
struct RegisterJobRequest<'a> {
    job_id: &'a str,
    file_name: String,
    size_bytes: u64,
    sha256: String,
    parameters: &'a EncodeParams,
    accel: HardwareAccel,
}

#[derive(Debug, Deserialize)]
struct RegisterJobResponse {
    id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RemoteJobStatus {
    status: EncodeStatus,
    #[serde(default)]
    progress_percent: f32,
    #[serde(default)]
    eta_secs: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    output_size: Option<u64>,
    #[serde(default)]
    output_sha256: Option<String>,
}

/// Remote worker client.
pub struct RemoteEncoderClient {
    client: Client,
    config: RemoteWorkerConfig,
}

impl RemoteEncoderClient {
    pub fn new(config: RemoteWorkerConfig) -> Result<Self, EncoderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EncoderError::transport(&config.id, format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url(), path));
        match self.config.api_key.as_deref() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn job_request(&self, method: Method, handle: &EncodeHandle, suffix: &str) -> RequestBuilder {
        let builder = self.request(method, &format!("/api/jobs/{}{}", handle.job_ref, suffix));
        match handle.token.as_deref() {
            Some(token) => builder.header(JOB_TOKEN_HEADER, token),
            None => builder,
        }
    }

    fn transport(&self, message: impl Into<String>) -> EncoderError {
        EncoderError::transport(&self.config.id, message)
    }

    async fn send_raw(&self, builder: RequestBuilder) -> Result<Response, EncoderError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                self.transport(format!("request timed out: {}", e))
            } else if e.is_connect() {
                self.transport(format!("connection failed: {}", e))
            } else {
                self.transport(e.to_string())
            }
        })
    }

    /// Send and map non-success statuses: 5xx is a transport failure, any
    /// other error status means the worker refused the job.
    async fn send(&self, builder: RequestBuilder) -> Result<Response, EncoderError> {
        let response = self.send_raw(builder).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(self.transport(format!("worker returned {}: {}", status, body)))
        } else {
            Err(EncoderError::encode_failed(
                format!("worker rejected request with {}", status),
                (!body.is_empty()).then_some(body),
            ))
        }
    }

    async fn job_status(&self, handle: &EncodeHandle) -> Result<RemoteJobStatus, EncoderError> {
        let response = self.send(self.job_request(Method::GET, handle, "")).await?;
        response
            .json()
            .await
            .map_err(|e| self.transport(format!("invalid status response: {}", e)))
    }

    async fn upload_input(&self, handle: &EncodeHandle, input: &Path) -> Result<(), EncoderError> {
        let mut file = File::open(input).await?;
        let mut buffer = vec![0u8; self.config.chunk_size_bytes.max(1)];
        let mut offset = 0u64;

        loop {
            let n = read_chunk(&mut file, &mut buffer).await?;
            if n == 0 {
                break;
            }
            self.send(
                self.job_request(Method::PUT, handle, "/input")
                    .query(&[("offset", offset)])
                    .body(buffer[..n].to_vec()),
            )
            .await?;
            offset += n as u64;
            debug!(worker_id = %self.config.id, job_ref = %handle.job_ref, offset, "Uploaded chunk");
        }
        Ok(())
    }

    async fn download_output(
        &self,
        handle: &EncodeHandle,
        status: &RemoteJobStatus,
        destination: &Path,
    ) -> Result<u64, EncoderError> {
        let size = status.output_size.ok_or_else(|| {
            EncoderError::encode_failed("worker did not report an output size", None)
        })?;
        let chunk = self.config.chunk_size_bytes.max(1) as u64;
        let mut file = File::create(destination).await?;
        let mut hasher = Sha256::new();
        let mut offset = 0u64;

        while offset < size {
            let end = (offset + chunk).min(size) - 1;
            let response = self
                .send(
                    self.job_request(Method::GET, handle, "/output")
                        .header(reqwest::header::RANGE, format!("bytes={}-{}", offset, end)),
                )
                .await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| self.transport(format!("download interrupted: {}", e)))?;
            if bytes.is_empty() {
                return Err(EncoderError::encode_failed(
                    format!("empty output chunk at offset {}", offset),
                    None,
                ));
            }
            hasher.update(&bytes);
            file.write_all(&bytes).await?;
            offset += bytes.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = status.output_sha256.as_deref() {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(EncoderError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(offset)
    }
}

/// Fill `buffer` as far as the file allows; returns bytes read.
async fn read_chunk(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Size and hex SHA-256 of a file.
async fn file_digest(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((total, format!("{:x}", hasher.finalize())))
}

#[async_trait]
impl EncodingWorkerClient for RemoteEncoderClient {
    fn worker_id(&self) -> &str {
        &self.config.id
    }

    async fn health(&self) -> Result<(), EncoderError> {
        self.send(self.request(Method::GET, "/api/health")).await?;
        Ok(())
    }

    async fn submit(&self, request: EncodeRequest) -> Result<EncodeHandle, EncoderError> {
        let input = &request.input.path;
        let (size_bytes, sha256) = file_digest(input).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EncoderError::InputNotFound {
                    path: input.clone(),
                }
            } else {
                EncoderError::Io(e)
            }
        })?;

        let output_name = request.output_file_name();
        let body = RegisterJobRequest {
            job_id: &request.job_id,
            file_name: request.input.file_name(),
            size_bytes,
            sha256,
            parameters: &request.params,
            accel: request.accel,
        };
        let registered: RegisterJobResponse = self
            .send(self.request(Method::POST, "/api/jobs").json(&body))
            .await?
            .json()
            .await
            .map_err(|e| self.transport(format!("invalid register response: {}", e)))?;

        let handle = EncodeHandle {
            worker_id: self.config.id.clone(),
            job_ref: registered.id,
            token: Some(registered.token),
            output_name,
        };

        let started = async {
            self.upload_input(&handle, input).await?;
            self.send(self.job_request(Method::POST, &handle, "/start"))
                .await
                .map(|_| ())
        }
        .await;

        if let Err(e) = started {
            warn!(
                worker_id = %self.config.id,
                job_ref = %handle.job_ref,
                error = %e,
                "Remote submit failed after registration, discarding remote job"
            );
            let _ = self.cancel(&handle).await;
            return Err(e);
        }

        info!(
            worker_id = %self.config.id,
            job_id = %request.job_id,
            job_ref = %handle.job_ref,
            size_bytes,
            "Remote encode started"
        );
        Ok(handle)
    }

    async fn poll(&self, handle: &EncodeHandle) -> Result<EncodePoll, EncoderError> {
        let status = self.job_status(handle).await?;
        Ok(EncodePoll {
            status: status.status,
            progress_percent: status.progress_percent,
            eta_secs: status.eta_secs,
            message: status.error,
        })
    }

    async fn cancel(&self, handle: &EncodeHandle) -> Result<(), EncoderError> {
        let response = self
            .send_raw(self.job_request(Method::DELETE, handle, ""))
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else if status.is_server_error() {
            Err(self.transport(format!("cancel returned {}", status)))
        } else {
            Err(EncoderError::encode_failed(
                format!("cancel rejected with {}", status),
                None,
            ))
        }
    }

    async fn retrieve_output(
        &self,
        handle: &EncodeHandle,
        dest_dir: &Path,
    ) -> Result<MediaRef, EncoderError> {
        let status = self.job_status(handle).await?;
        if status.status != EncodeStatus::Succeeded {
            return Err(EncoderError::encode_failed(
                format!("remote encode is {:?}, no output to retrieve", status.status),
                status.error,
            ));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let destination = dest_dir.join(&handle.output_name);
        match self.download_output(handle, &status, &destination).await {
            Ok(size) => Ok(MediaRef::new(destination).with_size(size)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&destination).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ErrorKind;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(url: &str, chunk_size: usize) -> RemoteEncoderClient {
        let mut config = RemoteWorkerConfig::new("gpu-1", url);
        config.api_key = Some("secret".to_string());
        config.chunk_size_bytes = chunk_size;
        config.request_timeout_secs = 5;
        RemoteEncoderClient::new(config).unwrap()
    }

    fn handle() -> EncodeHandle {
        EncodeHandle {
            worker_id: "gpu-1".into(),
            job_ref: "r1".into(),
            token: Some("t1".into()),
            output_name: "movie.mkv".into(),
        }
    }

    fn request(input: &Path) -> EncodeRequest {
        EncodeRequest {
            job_id: "job-1".into(),
            input: MediaRef::new(input),
            params: EncodeParams::default(),
            accel: HardwareAccel::Nvenc,
        }
    }

    #[tokio::test]
    async fn test_health_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server.uri(), 1024).health().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_transport_error() {
        let err = client("http://127.0.0.1:1", 1024).health().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn test_submit_uploads_in_chunks_and_starts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/jobs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "r1", "token": "t1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/jobs/r1/input"))
            .and(header("x-job-token", "t1"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/jobs/r1/input"))
            .and(query_param("offset", "4"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/jobs/r1/start"))
            .and(header("x-job-token", "t1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.avi");
        std::fs::write(&input, b"abcdefg").unwrap();

        let handle = client(&server.uri(), 4).submit(request(&input)).await.unwrap();
        assert_eq!(handle.job_ref, "r1");
        assert_eq!(handle.token.as_deref(), Some("t1"));
        assert_eq!(handle.output_name, "movie.mkv");
    }

    #[tokio::test]
    async fn test_submit_server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/jobs"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.avi");
        std::fs::write(&input, b"abc").unwrap();

        let err = client(&server.uri(), 4).submit(request(&input)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn test_submit_rejected_is_encode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/jobs"))
            .respond_with(ResponseTemplate::new(422).set_body_string("unsupported codec"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.avi");
        std::fs::write(&input, b"abc").unwrap();

        let err = client(&server.uri(), 4).submit(request(&input)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EncodeError);
    }

    #[tokio::test]
    async fn test_failed_upload_discards_remote_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/jobs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "r1", "token": "t1"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/jobs/r1/input"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/jobs/r1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.avi");
        std::fs::write(&input, b"abc").unwrap();

        let err = client(&server.uri(), 4).submit(request(&input)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn test_poll_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/r1"))
            .and(header("x-job-token", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"status": "running", "progress_percent": 42.5, "eta_secs": 90}),
            ))
            .mount(&server)
            .await;

        let poll = client(&server.uri(), 4).poll(&handle()).await.unwrap();
        assert_eq!(poll.status, EncodeStatus::Running);
        assert_eq!(poll.progress_percent, 42.5);
        assert_eq!(poll.eta_secs, Some(90));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/jobs/r1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client(&server.uri(), 4).cancel(&handle()).await.unwrap();
    }

    async fn mount_output(server: &MockServer, sha: &str) {
        Mock::given(method("GET"))
            .and(path("/api/jobs/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "succeeded",
                "progress_percent": 100.0,
                "output_size": 8,
                "output_sha256": sha,
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/r1/output"))
            .and(header("range", "bytes=0-3"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"enco".to_vec()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/r1/output"))
            .and(header("range", "bytes=4-7"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"ded!".to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_retrieve_output_verifies_checksum() {
        let server = MockServer::start().await;
        let sha = format!("{:x}", Sha256::digest(b"encoded!"));
        mount_output(&server, &sha).await;

        let dir = TempDir::new().unwrap();
        let media = client(&server.uri(), 4)
            .retrieve_output(&handle(), dir.path())
            .await
            .unwrap();
        assert_eq!(media.path, dir.path().join("movie.mkv"));
        assert_eq!(media.size_bytes, Some(8));
        assert_eq!(std::fs::read(&media.path).unwrap(), b"encoded!");
    }

    #[tokio::test]
    async fn test_retrieve_output_checksum_mismatch() {
        let server = MockServer::start().await;
        mount_output(&server, "deadbeef").await;

        let dir = TempDir::new().unwrap();
        let err = client(&server.uri(), 4)
            .retrieve_output(&handle(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::ChecksumMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::EncodeError);
        assert!(!dir.path().join("movie.mkv").exists());
    }
}
