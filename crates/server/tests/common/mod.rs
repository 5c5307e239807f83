//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that builds the router in-process
//! with mock stage collaborators and a mock encoding worker, so the HTTP API
//! can be exercised without ffmpeg or real media.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use mediarelay_core::{
    create_audit_system, AuditStore, Config, JobStore, OrchestratorConfig, PipelineOrchestrator,
    RetryConfig, SqliteAuditStore, SqliteJobStore, WorkerSpec,
    testing::{MockEncoderClient, MockStageServices},
};
use mediarelay_server::{api::create_router, app::build_orchestrator, state::AppState};

/// Test fixture for API testing with mock dependencies.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_job_submission() {
///     let fixture = TestFixture::started().await;
///
///     let response = fixture.post("/api/v1/jobs", json!({
///         "source_ref": "/downloads/heat.mkv"
///     })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    pub router: Router,
    pub orchestrator: Arc<PipelineOrchestrator>,
    /// Mock stage collaborators - queue outcomes, add delays
    pub stages: MockStageServices,
    /// Mock local encoder - control encode results
    pub encoder: MockEncoderClient,
    /// Temporary directory for the test database and encoded outputs
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Fixture with the scheduling loop stopped.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let mut config = Config::default();
        config.database.path = db_path.clone();
        config.orchestrator = OrchestratorConfig::default().with_poll_interval_ms(10);
        config.retry = RetryConfig::default().with_delays(0, 0);
        config.encoding.poll_interval_ms = 5;
        config.encoding.output_dir = temp_dir.path().join("encoded");
        config.encoding.local.enabled = false;

        // Create stores
        let audit_store: Arc<dyn AuditStore> = Arc::new(
            SqliteAuditStore::new(&db_path).expect("Failed to create audit store"),
        );
        let job_store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(&db_path).expect("Failed to create job store"));

        // Create audit system
        let (audit_handle, audit_writer) = create_audit_system(Arc::clone(&audit_store), 100);
        tokio::spawn(audit_writer.run());

        let stages = MockStageServices::new();
        let encoder = MockEncoderClient::new("local");

        let orchestrator = Arc::new(build_orchestrator(
            &config,
            job_store,
            Some(audit_handle),
            stages.services(),
        ));
        orchestrator
            .add_worker(WorkerSpec::local("local", 1), Arc::new(encoder.clone()))
            .await
            .expect("Failed to register mock worker");

        let state = Arc::new(AppState::new(
            config,
            Arc::clone(&orchestrator),
            audit_store,
        ));
        let router = create_router(state);

        Self {
            router,
            orchestrator,
            stages,
            encoder,
            temp_dir,
        }
    }

    /// Fixture with the scheduling loop running.
    pub async fn started() -> Self {
        let fixture = Self::new().await;
        fixture
            .orchestrator
            .start()
            .await
            .expect("Failed to start orchestrator");
        fixture
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
    }

    /// Send a GET request and return the raw body as text.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    /// Poll a job through the API until the predicate holds.
    pub async fn wait_for_job(&self, job_id: &str, predicate: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..300 {
            let response = self.get(&format!("/api/v1/jobs/{}", job_id)).await;
            if response.status == StatusCode::OK && predicate(&response.body) {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Timed out waiting for job {}", job_id);
    }

    pub async fn stop(&self) {
        self.orchestrator.stop().await;
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
