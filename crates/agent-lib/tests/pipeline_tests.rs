//! End-to-end passes against an in-memory metrics backend and mock APIs

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mockito::{Matcher, Server, ServerGuard};
use prometheus::Registry;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;
use usage_agent_lib::auth::{AuthConfig, AuthResolver, MemorySecretStore, PULL_SECRET_KEY, PULL_SECRET_NAME};
use usage_agent_lib::collector::{
    BackendError, Collector, CollectorConfig, MetricsBackend, QueryCatalog, Series, TimeWindow,
};
use usage_agent_lib::dirconfig::DirectoryConfig;
use usage_agent_lib::http::{build_client, DEFAULT_TIMEOUT};
use usage_agent_lib::pipeline::{NO_DATA_MESSAGE, MAX_HOUR_ATTEMPTS};
use usage_agent_lib::upload::UploadConfig;
use usage_agent_lib::{
    AgentStatus, AuthType, ClusterIdentity, HealthRegistry, Pipeline, PipelineConfig,
    PipelineMetrics, StatusStore,
};

const CLUSTER_ID: &str = "cluster-1";

#[derive(Default)]
struct FakeBackend {
    with_nodes: bool,
    range_fails: bool,
    down: AtomicBool,
    range_calls: AtomicUsize,
}

impl FakeBackend {
    fn with_nodes() -> Self {
        Self {
            with_nodes: true,
            ..Default::default()
        }
    }

    fn node_series() -> Vec<Series> {
        let labels: HashMap<String, String> = [
            ("node", "node-a"),
            ("provider_id", "aws:///us-east-1a/i-0abc"),
            ("label_node_role_kubernetes_io", "worker"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        vec![Series::new(labels, vec![4.0; 60])]
    }
}

#[async_trait]
impl MetricsBackend for FakeBackend {
    async fn query_range(
        &self,
        query: &str,
        _window: &TimeWindow,
    ) -> Result<Vec<Series>, BackendError> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if self.range_fails {
            return Err(BackendError::Api {
                error_type: "timeout".into(),
                error: "query timed out".into(),
            });
        }
        if self.with_nodes && query.starts_with("kube_node") {
            return Ok(Self::node_series());
        }
        Ok(vec![])
    }

    async fn query(&self, _query: &str, _at: DateTime<Utc>) -> Result<Vec<Series>, BackendError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::Api {
                error_type: "unavailable".into(),
                error: "connection refused".into(),
            });
        }
        Ok(vec![])
    }
}

fn pull_secret_store() -> MemorySecretStore {
    let secret = json!({"auths": {"cloud.openshift.com": {"auth": "dG9rZW4=", "email": "ops@example.com"}}});
    MemorySecretStore::new().with_secret(PULL_SECRET_NAME, &[(PULL_SECRET_KEY, &secret.to_string())])
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 10, 42, 0).unwrap()
}

fn pipeline(dir: &TempDir, api_url: &str, backend: Arc<FakeBackend>, upload: bool) -> Pipeline {
    let auth = AuthConfig {
        auth_type: AuthType::Token,
        ..Default::default()
    };
    pipeline_with_auth(dir, api_url, backend, upload, auth, pull_secret_store())
}

fn pipeline_with_auth(
    dir: &TempDir,
    api_url: &str,
    backend: Arc<FakeBackend>,
    upload: bool,
    auth: AuthConfig,
    secrets: MemorySecretStore,
) -> Pipeline {
    let identity = ClusterIdentity {
        cluster_id: CLUSTER_ID.into(),
        version: "abc123".into(),
    };
    let config = PipelineConfig {
        identity: identity.clone(),
        api_url: api_url.to_string(),
        upload_toggle: upload,
        upload: UploadConfig {
            ingress_url: format!("{api_url}/api/ingress/v1/upload"),
            wait: Some(0),
            ..Default::default()
        },
        ..Default::default()
    };
    let auth = AuthResolver::new(
        AuthConfig {
            cluster_id: CLUSTER_ID.into(),
            operator_commit: identity.version.clone(),
            ..auth
        },
        Arc::new(secrets),
        build_client(None, DEFAULT_TIMEOUT).unwrap(),
    );
    let collector = Collector::new(
        backend,
        QueryCatalog::load().unwrap(),
        CollectorConfig {
            max_retries: 0,
            retry_backoff: Duration::ZERO,
        },
    );
    Pipeline::new(
        config,
        DirectoryConfig::new(dir.path().join("usage")),
        collector,
        auth,
        PipelineMetrics::new(&Registry::new()).unwrap(),
    )
}

async fn mock_sources(server: &mut ServerGuard) {
    let listing = |item: serde_json::Value| json!({"meta": {"count": 1}, "data": [item]}).to_string();
    server
        .mock("GET", "/api/sources/v1.0/source_types")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(listing(json!({"id": "1", "name": "openshift"})))
        .create_async()
        .await;
    server
        .mock("GET", "/api/sources/v1.0/sources")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(listing(json!({
            "id": "9", "name": CLUSTER_ID, "source_type_id": "1", "source_ref": CLUSTER_ID
        })))
        .create_async()
        .await;
}

#[tokio::test]
async fn test_pass_collects_packages_and_uploads() {
    let temp_dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    mock_sources(&mut server).await;
    let ingress = server
        .mock("POST", "/api/ingress/v1/upload")
        .match_header("authorization", "Bearer dG9rZW4=")
        .with_status(202)
        .with_header("x-rh-insights-request-id", "req-1")
        .with_body("{}")
        .expect_at_least(1)
        .create_async()
        .await;

    let backend = Arc::new(FakeBackend::with_nodes());
    let mut pipeline = pipeline(&temp_dir, &server.url(), backend, true);
    let mut status = AgentStatus::default();

    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(outcome.hours_collected, 1);
    assert_eq!(outcome.packaged.len(), 1);
    assert_eq!(outcome.source_defined, Some(true));

    let upload = outcome.upload.expect("upload ran");
    assert!(!upload.uploaded.is_empty());
    ingress.assert_async().await;

    let hour = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
    assert_eq!(status.operator_commit, "abc123");
    assert_eq!(status.prometheus.last_query_success_time, Some(hour));
    assert!(status.reports.data_collected);
    assert_eq!(status.reports.last_hour_queried, "2024-03-05 09:00:00 - 2024-03-05 09:59:59");
    assert_eq!(status.upload.last_upload_status, "202 Accepted");
    assert_eq!(status.upload.last_payload_request_id, "req-1");
    assert!(status.upload.last_successful_upload_time.is_some());
    assert!(status.source.source_defined.unwrap());
    assert_eq!(status.source.source_name, CLUSTER_ID);
    assert!(status.packaging.packaged_files.is_empty());
    assert!(pipeline.dirs().upload.files().unwrap().is_empty());

    // same hour again: nothing to collect and the packaging cycle has not elapsed
    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert_eq!(outcome.hours_collected, 0);
    assert!(outcome.packaged.is_empty());
    assert!(outcome.upload.is_none());
}

#[tokio::test]
async fn test_rejected_upload_revalidates_basic_credentials() {
    let temp_dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    // credential checks hit the bare sources listing; source lookups carry filters
    let validation = server
        .mock("GET", "/api/sources/v1.0/sources")
        .match_query(Matcher::Missing)
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(200)
        .with_body(json!({"meta": {"count": 0}, "data": []}).to_string())
        .expect(2)
        .create_async()
        .await;
    mock_sources(&mut server).await;
    let ingress = server
        .mock("POST", "/api/ingress/v1/upload")
        .with_status(401)
        .with_body("bad credentials")
        .expect(1)
        .create_async()
        .await;

    let auth = AuthConfig {
        auth_type: AuthType::Basic,
        secret_name: Some("creds".into()),
        ..Default::default()
    };
    let secrets = MemorySecretStore::new()
        .with_secret("creds", &[("username", "user"), ("password", "pass")]);
    let backend = Arc::new(FakeBackend::with_nodes());
    let mut pipeline = pipeline_with_auth(&temp_dir, &server.url(), backend, true, auth, secrets);
    let mut status = AgentStatus::default();

    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    let upload = outcome.upload.expect("upload ran");
    assert!(upload.unauthorized);
    assert!(upload.uploaded.is_empty());

    // the cached validation was dropped and the credentials checked again
    validation.assert_async().await;
    ingress.assert_async().await;
    assert!(status.upload.upload_error.contains("401"));
    assert_eq!(status.upload.last_upload_status, "401 Unauthorized");
    assert_eq!(status.authentication.valid_basic_auth, Some(true));
    assert!(status.authentication.last_verification_time.is_some());
    assert_eq!(pipeline.dirs().upload.files().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cycles_follow_the_pass_clock() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::with_nodes());
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend, true);
    let mut status = AgentStatus::default();
    let hour_ago = now() - chrono::Duration::hours(1);
    status.packaging.last_successful_packaging_time = Some(hour_ago);
    status.upload.last_successful_upload_time = Some(hour_ago);
    status.source.last_source_check_time = Some(hour_ago);

    // every cycle was stamped an hour before this pass, so none is due
    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(outcome.hours_collected, 1);
    assert!(outcome.packaged.is_empty());
    assert!(outcome.upload.is_none());
    assert!(outcome.source_defined.is_none());
    assert_eq!(status.packaging.last_successful_packaging_time, Some(hour_ago));
}

#[tokio::test]
async fn test_restricted_network_keeps_archives() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::with_nodes());
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend, false);
    let mut status = AgentStatus::default();

    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert!(outcome.upload.is_none());
    assert_eq!(outcome.packaged.len(), 1);
    assert!(!status.packaging.packaged_files.is_empty());
    assert!(status
        .packaging
        .packaged_files
        .iter()
        .all(|f| f.ends_with(".tar.gz")));
    assert_eq!(status.packaging.report_count, Some(1));
}

#[tokio::test]
async fn test_end_of_day_moves_reports() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::with_nodes());
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend, false);
    let mut status = AgentStatus::default();
    status.packaging.last_successful_packaging_time = Some(now());

    let midnight = Utc.with_ymd_and_hms(2024, 3, 6, 0, 30, 0).unwrap();
    let outcome = pipeline.reconcile(&mut status, midnight).await.unwrap();
    assert_eq!(outcome.packaged.len(), 1);
    assert!(pipeline.dirs().reports.files().unwrap().is_empty());
}

#[tokio::test]
async fn test_catch_up_moves_each_finished_day() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::with_nodes());
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend, false);
    let mut status = AgentStatus::default();
    status.prometheus.last_query_success_time =
        Some(Utc.with_ymd_and_hms(2024, 3, 3, 20, 0, 0).unwrap());

    // 03-03 21:00 through 03-05 09:00 crosses two day boundaries
    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert_eq!(outcome.hours_collected, 3 + 24 + 10);
    assert_eq!(outcome.packaged.len(), 2);
    assert_eq!(status.packaging.last_successful_packaging_time, Some(now()));

    // today's rows stay behind for the next end-of-day or cycle package
    assert!(!pipeline.dirs().reports.files().unwrap().is_empty());
    assert_eq!(
        status.prometheus.last_query_success_time,
        Some(Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_no_data_hour_advances() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend.clone(), false);
    let mut status = AgentStatus::default();

    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert_eq!(outcome.hours_collected, 0);
    assert!(!status.reports.data_collected);
    assert_eq!(status.reports.data_collection_message, NO_DATA_MESSAGE);
    assert_eq!(
        status.prometheus.last_query_success_time,
        Some(Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap())
    );

    let calls = backend.range_calls.load(Ordering::SeqCst);
    pipeline.reconcile(&mut status, now()).await.unwrap();
    assert_eq!(backend.range_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_failing_hour_is_abandoned_after_limit() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend {
        range_fails: true,
        ..Default::default()
    });
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend.clone(), false);
    let mut status = AgentStatus::default();

    for _ in 0..MAX_HOUR_ATTEMPTS + 2 {
        pipeline.reconcile(&mut status, now()).await.unwrap();
    }
    // each attempt stops at the first failing query of each of the four classes
    assert_eq!(
        backend.range_calls.load(Ordering::SeqCst),
        MAX_HOUR_ATTEMPTS as usize * 4
    );
    assert!(status.reports.data_collection_message.starts_with("error: "));
    assert!(status.prometheus.last_query_success_time.is_none());
}

#[tokio::test]
async fn test_unreachable_backend_is_recorded() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::default());
    backend.down.store(true, Ordering::SeqCst);
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend.clone(), false);
    let mut status = AgentStatus::default();

    let outcome = pipeline.reconcile(&mut status, now()).await.unwrap();
    assert!(status.prometheus.connection_error.contains("connection refused"));
    assert!(outcome
        .combined_error()
        .unwrap()
        .starts_with("failed to get prometheus connection"));
    assert_eq!(backend.range_calls.load(Ordering::SeqCst), 0);

    let health = HealthRegistry::new();
    health.register_all().await;
    health.apply_status(&status).await;
    assert!(!health.health().await.status.is_operational());

    backend.down.store(false, Ordering::SeqCst);
    pipeline.reconcile(&mut status, now()).await.unwrap();
    assert!(status.prometheus.connection_error.is_empty());
}

#[tokio::test]
async fn test_upgrade_packages_previous_reports() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::with_nodes());
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend, false);
    let mut status = AgentStatus::default();

    pipeline.reconcile(&mut status, now()).await.unwrap();
    assert!(!pipeline.dirs().reports.files().unwrap().is_empty());

    status.operator_commit = "older".into();
    let later = Utc.with_ymd_and_hms(2024, 3, 5, 11, 5, 0).unwrap();
    let outcome = pipeline.reconcile(&mut status, later).await.unwrap();
    assert_eq!(status.operator_commit, "abc123");
    // one package from the upgrade and one from the reset packaging cycle
    assert_eq!(outcome.packaged.len(), 2);
}

#[tokio::test]
async fn test_run_pass_saves_status() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let mut pipeline = pipeline(&temp_dir, "http://127.0.0.1:9", backend, false);
    let store = StatusStore::in_dir(temp_dir.path());
    let mut status = assert_ok!(store.load());

    assert_ok!(pipeline.run_pass(&mut status, &store).await);
    let saved = assert_ok!(store.load());
    assert_eq!(saved, status);
    assert_eq!(saved.cluster_id, CLUSTER_ID);
}
