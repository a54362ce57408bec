//! Usage Agent - cluster usage reporting daemon
//!
//! Collects hourly usage from the cluster metrics backend, packages the
//! reports into archives and uploads them to the ingestion service on a
//! fixed reconciliation interval.

use anyhow::{Context, Result};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use usage_agent_lib::{
    auth::{AuthResolver, DirectorySecretStore},
    collector::{Collector, PrometheusClient, QueryCatalog},
    dirconfig::DirectoryConfig,
    health::HealthRegistry,
    http::{build_client, DEFAULT_TIMEOUT},
    observability::{PipelineMetrics, StructuredLogger},
    Pipeline, StatusStore,
};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting usage-agent");

    let config = config::AgentConfig::load()?;
    info!(
        cluster_id = %config.cluster_id,
        report_dir = %config.report_dir.display(),
        upload = config.upload.upload_toggle,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let registry = Registry::new();
    let metrics = PipelineMetrics::new(&registry).context("Failed to register metrics")?;

    let logger = StructuredLogger::new(config.cluster_id.clone());
    logger.log_startup(AGENT_VERSION);

    let backend = PrometheusClient::new(&config.prometheus_config())
        .context("Failed to create prometheus client")?;
    let catalog = QueryCatalog::load().context("Failed to load query catalog")?;
    let collector = Collector::new(Arc::new(backend), catalog, config.collector_config());

    let client = build_client(config.api_ca_path(), DEFAULT_TIMEOUT)
        .context("Failed to create API client")?;
    let secrets = DirectorySecretStore::new(config.auth.secrets_dir.clone());
    let auth = AuthResolver::new(config.auth_config(), Arc::new(secrets), client);

    let dirs = DirectoryConfig::new(config.report_dir.clone());
    let status_store = StatusStore::in_dir(&config.report_dir);
    let mut status = status_store.load_or_default();

    let mut pipeline = Pipeline::new(config.pipeline_config(), dirs, collector, auth, metrics);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), registry));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;

    let mut interval =
        tokio::time::interval(Duration::from_secs(config.reconcile_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match pipeline.run_pass(&mut status, &status_store).await {
                    Ok(outcome) => {
                        if let Some(errors) = outcome.combined_error() {
                            warn!(errors = %errors, "Reconciliation pass finished with errors");
                        } else {
                            info!(
                                hours = outcome.hours_collected,
                                packages = outcome.packaged.len(),
                                "Reconciliation pass finished"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Reconciliation pass failed"),
                }
                health_registry.apply_status(&status).await;
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
