//! Shared HTTP plumbing for the ingestion and sources APIs

use reqwest::{Client, RequestBuilder, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Correlation header set by the ingestion service
pub const REQUEST_ID_HEADER: &str = "x-rh-insights-request-id";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("status: {code} | error response: {body}")]
    Status { code: u16, body: String },

    #[error("failed to read CA bundle {path:?}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl HttpError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpError::Status { code, .. } => Some(*code),
            HttpError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
    pub request_id: String,
}

impl HttpResponse {
    /// `202 Accepted` style rendering
    pub fn status_line(&self) -> String {
        format!(
            "{} {}",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        )
        .trim_end()
        .to_string()
    }
}

/// Client with the default timeout and an optional extra trust root
pub fn build_client(ca_path: Option<&Path>, timeout: Duration) -> Result<Client, HttpError> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(path) = ca_path {
        let pem = std::fs::read(path).map_err(|source| HttpError::CaBundle {
            path: path.to_path_buf(),
            source,
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(HttpError::Client)?;
        builder = builder.add_root_certificate(cert);
    }
    builder.build().map_err(HttpError::Client)
}

/// Mask the credential on any `Authorization` line of a header dump
pub fn scrub_authorization(dump: &str) -> String {
    dump.lines()
        .map(|line| {
            if !line.to_ascii_lowercase().contains("authorization") {
                return line.to_string();
            }
            match line.rsplit_once(' ') {
                Some((head, secret)) => format!("{head} {}", "*".repeat(secret.len())),
                None => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn request_id(headers: &reqwest::header::HeaderMap, body: &str) -> String {
    if let Some(id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return id.to_string();
    }
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("request_id").and_then(|id| id.as_str()).map(String::from))
        .unwrap_or_default()
}

/// Execute a request, logging it with credentials masked
pub async fn send(request: RequestBuilder) -> Result<HttpResponse, HttpError> {
    let (client, request) = request.build_split();
    let request = request?;

    let dump = request
        .headers()
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("<binary>")))
        .collect::<Vec<_>>()
        .join("\n");
    debug!(
        method = %request.method(),
        url = %request.url(),
        headers = %scrub_authorization(&dump),
        "Sending request"
    );

    let response = client.execute(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await?;
    let request_id = request_id(&headers, &body);
    debug!(status = %status, request_id = %request_id, "Received response");

    Ok(HttpResponse {
        status,
        body,
        request_id,
    })
}

/// Turn any non-2xx response into [`HttpError::Status`]
pub fn process_response(response: HttpResponse) -> Result<HttpResponse, HttpError> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(HttpError::Status {
            code: response.status.as_u16(),
            body: response.body,
        })
    }
}
