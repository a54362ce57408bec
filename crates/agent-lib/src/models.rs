//! Core data models for the usage agent
//!
//! The status types are persisted between passes so that cycle gates and
//! retry bookkeeping survive restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential kind used against the ingestion and sources APIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// Bearer token from the cluster pull secret
    #[default]
    Token,
    /// Username and password from a named secret
    Basic,
    /// Client credentials exchanged for an access token
    ServiceAccount,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::Token => write!(f, "token"),
            AuthType::Basic => write!(f, "basic"),
            AuthType::ServiceAccount => write!(f, "service-account"),
        }
    }
}

/// Identity stamped into manifests and request headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub cluster_id: String,
    /// Agent build identifier (git commit)
    pub version: String,
}

/// Source registration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Path of the sources API relative to the API URL
    pub sources_api_path: String,
    /// Name to register the cluster under; defaults to the cluster ID
    pub source_name: String,
    /// Create the source when it does not exist
    pub create_source: bool,
    /// Minutes between source checks
    pub check_cycle: i64,
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            sources_api_path: "/api/sources/v1.0/".to_string(),
            source_name: String::new(),
            create_source: false,
            check_cycle: 1440,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub auth_type: AuthType,
    pub credentials_found: Option<bool>,
    pub valid_basic_auth: Option<bool>,
    pub error_message: String,
    pub last_verification_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackagingStatus {
    pub last_successful_packaging_time: Option<DateTime<Utc>>,
    pub packaging_error: String,
    pub packaged_files: Vec<String>,
    pub report_count: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub last_successful_upload_time: Option<DateTime<Utc>>,
    pub last_upload_status: String,
    pub last_payload_name: String,
    pub last_payload_files: Vec<String>,
    pub last_payload_manifest_id: String,
    pub last_payload_request_id: String,
    pub upload_error: String,
    /// Seconds to pause before the first upload of a pass
    pub upload_wait: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_name: String,
    pub source_defined: Option<bool>,
    pub source_error: String,
    pub last_source_check_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportsStatus {
    pub data_collected: bool,
    pub data_collection_message: String,
    pub last_hour_queried: String,
    pub report_month: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrometheusStatus {
    pub connection_error: String,
    pub last_query_start_time: Option<DateTime<Utc>>,
    pub last_query_success_time: Option<DateTime<Utc>>,
}

/// Everything the agent round-trips between passes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub cluster_id: String,
    pub operator_commit: String,
    pub authentication: AuthStatus,
    pub packaging: PackagingStatus,
    pub upload: UploadStatus,
    pub source: SourceStatus,
    pub reports: ReportsStatus,
    pub prometheus: PrometheusStatus,
}
