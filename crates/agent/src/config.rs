//! Agent configuration
//!
//! Read from an optional file named by `AGENT_CONFIG_FILE` and overridden by
//! `AGENT_*` environment variables. Nested keys use `__`, for example
//! `AGENT_PROMETHEUS__ADDRESS`.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use usage_agent_lib::auth::AuthConfig;
use usage_agent_lib::collector::{CollectorConfig, PrometheusConfig};
use usage_agent_lib::packaging::PackagingConfig;
use usage_agent_lib::upload::UploadConfig;
use usage_agent_lib::{AuthType, ClusterIdentity, PipelineConfig, SourceSpec};

/// Agent configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Cluster identifier stamped into manifests and requests
    #[serde(default)]
    pub cluster_id: String,

    /// Build identifier; a change triggers upgrade packaging
    #[serde(default = "default_operator_commit")]
    pub operator_commit: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between reconciliation passes
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Parent of the data, staging and upload directories
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    /// Days a lagging collection may reach back
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_ingress_path")]
    pub ingress_path: String,

    #[serde(default = "default_sources_path")]
    pub sources_path: String,

    #[serde(default)]
    pub prometheus: PrometheusSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub upload: UploadSettings,

    #[serde(default)]
    pub packaging: PackagingSettings,

    #[serde(default)]
    pub source: SourceSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PrometheusSettings {
    #[serde(default = "default_prometheus_address")]
    pub address: String,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    #[serde(default)]
    pub skip_tls_verification: bool,
    /// Per-query timeout in seconds
    #[serde(default = "default_context_timeout")]
    pub context_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AuthSettings {
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Mounted secrets, one directory per secret
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UploadSettings {
    #[serde(default = "default_true")]
    pub upload_toggle: bool,
    /// Minutes between uploads
    #[serde(default = "default_upload_cycle")]
    pub upload_cycle: i64,
    #[serde(default)]
    pub upload_wait: Option<u64>,
    /// Trust the service CA bundle when talking to the API
    #[serde(default)]
    pub validate_cert: bool,
    #[serde(default = "default_service_ca_path")]
    pub ca_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PackagingSettings {
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_reports")]
    pub max_reports: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SourceSettings {
    /// Defaults to the cluster ID when empty
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub create_source: bool,
    #[serde(default = "default_source_check_cycle")]
    pub check_cycle: i64,
}

fn default_operator_commit() -> String {
    option_env!("GIT_COMMIT")
        .unwrap_or(env!("CARGO_PKG_VERSION"))
        .to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("/tmp/usage-agent-reports")
}

fn default_retention_days() -> i64 {
    14
}

fn default_api_url() -> String {
    "https://console.redhat.com".to_string()
}

fn default_ingress_path() -> String {
    "/api/ingress/v1/upload".to_string()
}

fn default_sources_path() -> String {
    "/api/sources/v1.0/".to_string()
}

fn default_prometheus_address() -> String {
    PrometheusConfig::default().address
}

fn default_context_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    5
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/etc/usage-agent/secrets")
}

fn default_token_url() -> String {
    AuthConfig::default().token_url
}

fn default_true() -> bool {
    true
}

fn default_upload_cycle() -> i64 {
    360
}

fn default_service_ca_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/service-ca.crt")
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_reports() -> usize {
    PackagingConfig::default().max_reports
}

fn default_source_check_cycle() -> i64 {
    1440
}

impl Default for PrometheusSettings {
    fn default() -> Self {
        Self {
            address: default_prometheus_address(),
            ca_path: None,
            token_path: None,
            skip_tls_verification: false,
            context_timeout_secs: default_context_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            auth_type: AuthType::default(),
            secret_name: None,
            secrets_dir: default_secrets_dir(),
            token_url: default_token_url(),
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            upload_toggle: true,
            upload_cycle: default_upload_cycle(),
            upload_wait: None,
            validate_cert: false,
            ca_path: default_service_ca_path(),
        }
    }
}

impl Default for PackagingSettings {
    fn default() -> Self {
        Self {
            max_size_mb: default_max_size_mb(),
            max_reports: default_max_reports(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            create_source: false,
            check_cycle: default_source_check_cycle(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment and config file
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("AGENT_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read agent configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse agent configuration")
    }

    pub fn identity(&self) -> ClusterIdentity {
        ClusterIdentity {
            cluster_id: self.cluster_id.clone(),
            version: self.operator_commit.clone(),
        }
    }

    pub fn prometheus_config(&self) -> PrometheusConfig {
        PrometheusConfig {
            address: self.prometheus.address.clone(),
            ca_path: self.prometheus.ca_path.clone(),
            token_path: self.prometheus.token_path.clone(),
            skip_tls_verification: self.prometheus.skip_tls_verification,
            timeout: Duration::from_secs(self.prometheus.context_timeout_secs),
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            max_retries: self.prometheus.max_retries,
            ..Default::default()
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            auth_type: self.auth.auth_type,
            secret_name: self.auth.secret_name.clone(),
            token_url: self.auth.token_url.clone(),
            cluster_id: self.cluster_id.clone(),
            operator_commit: self.operator_commit.clone(),
        }
    }

    /// CA bundle for API requests, when certificate validation is on
    pub fn api_ca_path(&self) -> Option<&std::path::Path> {
        self.upload
            .validate_cert
            .then_some(self.upload.ca_path.as_path())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let api_url = self.api_url.trim_end_matches('/').to_string();
        PipelineConfig {
            identity: self.identity(),
            upload_toggle: self.upload.upload_toggle,
            upload: UploadConfig {
                ingress_url: format!("{}{}", api_url, self.ingress_path),
                cycle: self.upload.upload_cycle,
                wait: self.upload.upload_wait,
            },
            packaging: PackagingConfig {
                max_reports: self.packaging.max_reports,
                ..Default::default()
            }
            .with_max_size_mb(self.packaging.max_size_mb),
            source: SourceSpec {
                sources_api_path: self.sources_path.clone(),
                source_name: self.source.name.clone(),
                create_source: self.source.create_source,
                check_cycle: self.source.check_cycle,
            },
            retention: ChronoDuration::days(self.retention_days),
            api_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> AgentConfig {
        serde_json::from_str("{}").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = defaults();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.upload.upload_cycle, 360);
        assert!(config.upload.upload_toggle);
        assert_eq!(config.source.check_cycle, 1440);
        assert_eq!(config.packaging.max_size_mb, 100);
        assert_eq!(config.prometheus.context_timeout_secs, 120);
        assert_eq!(config.auth.auth_type, AuthType::Token);
        assert!(config.api_ca_path().is_none());
    }

    #[test]
    fn test_nested_overrides() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "cluster_id": "cluster-1",
            "api_url": "https://api.example.com/",
            "auth": {"auth_type": "service-account", "secret_name": "sa"},
            "upload": {"upload_cycle": 60, "validate_cert": true},
            "packaging": {"max_size_mb": 2},
        }))
        .unwrap();

        assert_eq!(config.auth.auth_type, AuthType::ServiceAccount);
        assert_eq!(config.auth_config().secret_name.as_deref(), Some("sa"));
        assert!(config.api_ca_path().is_some());

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.api_url, "https://api.example.com");
        assert_eq!(
            pipeline.upload.ingress_url,
            "https://api.example.com/api/ingress/v1/upload"
        );
        assert_eq!(pipeline.upload.cycle, 60);
        assert_eq!(pipeline.packaging.max_size_bytes, 2 * 1024 * 1024);
        assert_eq!(pipeline.identity.cluster_id, "cluster-1");
        assert_eq!(pipeline.retention, ChronoDuration::days(14));
    }
}
