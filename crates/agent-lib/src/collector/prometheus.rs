//! Prometheus HTTP API backend

use super::rowset::{Labels, Series};
use super::TimeWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to read {what} from {path:?}: {source}")]
    ReadFile {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot create prometheus client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("error querying prometheus: {0}")]
    Request(#[from] reqwest::Error),

    #[error("prometheus returned {error_type}: {error}")]
    Api { error_type: String, error: String },

    #[error("expected a {expected} in response to query, got a {actual}")]
    UnexpectedResult {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid sample value {0:?}")]
    InvalidSample(String),
}

/// Query access to a Prometheus-compatible time-series store
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Range query returning a matrix
    async fn query_range(&self, query: &str, window: &TimeWindow)
        -> Result<Vec<Series>, BackendError>;

    /// Instant query returning a vector
    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>, BackendError>;

    /// Issue an instant `up` query to prove connectivity
    async fn test_connection(&self) -> Result<(), BackendError> {
        self.query("up", Utc::now()).await?;
        info!("Prometheus test query succeeded");
        Ok(())
    }
}

/// Connection settings for [`PrometheusClient`]
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL, e.g. `https://thanos-querier.openshift-monitoring.svc:9091`
    pub address: String,
    /// PEM bundle used to verify the backend
    pub ca_path: Option<PathBuf>,
    /// File holding the bearer token
    pub token_path: Option<PathBuf>,
    pub skip_tls_verification: bool,
    /// Per-call timeout
    pub timeout: Duration,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "https://thanos-querier.openshift-monitoring.svc:9091".to_string(),
            ca_path: None,
            token_path: None,
            skip_tls_verification: false,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(rename = "errorType", default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Matrix(Vec<MatrixSeries>),
    Vector(Vec<VectorSample>),
    Scalar(serde_json::Value),
    String(serde_json::Value),
}

impl QueryData {
    fn kind(&self) -> &'static str {
        match self {
            QueryData::Matrix(_) => "matrix",
            QueryData::Vector(_) => "vector",
            QueryData::Scalar(_) => "scalar",
            QueryData::String(_) => "string",
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    metric: Labels,
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: Labels,
    value: (f64, String),
}

fn parse_sample(raw: &str) -> Result<f64, BackendError> {
    raw.parse::<f64>()
        .map_err(|_| BackendError::InvalidSample(raw.to_string()))
}

/// reqwest-backed Prometheus client
pub struct PrometheusClient {
    client: Client,
    address: String,
    token: Option<String>,
}

impl PrometheusClient {
    pub fn new(config: &PrometheusConfig) -> Result<Self, BackendError> {
        let token = match &config.token_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|source| BackendError::ReadFile {
                        what: "bearer token",
                        path: path.clone(),
                        source,
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path).map_err(|source| BackendError::ReadFile {
                what: "CA bundle",
                path: ca_path.clone(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(BackendError::Client)?;
            builder = builder.add_root_certificate(cert);
        }
        if config.skip_tls_verification {
            warn!("TLS verification disabled for prometheus");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build().map_err(BackendError::Client)?,
            address: config.address.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<QueryData, BackendError> {
        let mut request = self
            .client
            .get(format!("{}{}", self.address, path))
            .query(params);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response: ApiResponse = request.send().await?.json().await?;
        if !response.warnings.is_empty() {
            info!(warnings = ?response.warnings, "Query warnings");
        }
        if response.status != "success" {
            return Err(BackendError::Api {
                error_type: response.error_type.unwrap_or_default(),
                error: response.error.unwrap_or_default(),
            });
        }
        response.data.ok_or_else(|| BackendError::UnexpectedResult {
            expected: "result",
            actual: "nothing".to_string(),
        })
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClient {
    async fn query_range(
        &self,
        query: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Series>, BackendError> {
        debug!(query = %query, start = %window.start, end = %window.end, "Range query");
        let params = [
            ("query", query.to_string()),
            ("start", window.start.timestamp().to_string()),
            ("end", window.end.timestamp().to_string()),
            ("step", format!("{}s", window.step.num_seconds())),
        ];
        match self.get("/api/v1/query_range", &params).await? {
            QueryData::Matrix(series) => series
                .into_iter()
                .map(|s| {
                    let values = s
                        .values
                        .iter()
                        .map(|(_, raw)| parse_sample(raw))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Series::new(s.metric, values))
                })
                .collect(),
            other => Err(BackendError::UnexpectedResult {
                expected: "matrix",
                actual: other.kind().to_string(),
            }),
        }
    }

    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>, BackendError> {
        let params = [
            ("query", query.to_string()),
            ("time", at.timestamp().to_string()),
        ];
        match self.get("/api/v1/query", &params).await? {
            QueryData::Vector(samples) => samples
                .into_iter()
                .map(|s| Ok(Series::new(s.metric, vec![parse_sample(&s.value.1)?])))
                .collect(),
            other => Err(BackendError::UnexpectedResult {
                expected: "vector",
                actual: other.kind().to_string(),
            }),
        }
    }
}
