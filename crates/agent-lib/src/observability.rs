//! Observability infrastructure for the usage agent
//!
//! Provides:
//! - Prometheus metrics (hours collected, archives written, upload outcomes, pass latency)
//! - Structured JSON logging of pipeline milestones with tracing

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use tracing::{info, warn};

/// Histogram buckets for pass latency (in seconds)
const PASS_LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Pipeline metrics registered against a caller-owned registry
#[derive(Clone)]
pub struct PipelineMetrics {
    hours_collected: IntCounter,
    collection_errors: IntCounter,
    rows_written: IntCounterVec,
    archives_written: IntCounter,
    packaging_errors: IntCounter,
    uploads: IntCounterVec,
    source_checks: IntCounterVec,
    pending_archives: IntGauge,
    pass_latency_seconds: Histogram,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let hours_collected = IntCounter::new(
            "usage_agent_hours_collected_total",
            "Hours of usage data written to reports",
        )?;
        let collection_errors = IntCounter::new(
            "usage_agent_collection_errors_total",
            "Hours abandoned because a query failed",
        )?;
        let rows_written = IntCounterVec::new(
            Opts::new("usage_agent_rows_written_total", "Report rows written per resource class"),
            &["class"],
        )?;
        let archives_written = IntCounter::new(
            "usage_agent_archives_written_total",
            "Archives written to the upload directory",
        )?;
        let packaging_errors = IntCounter::new(
            "usage_agent_packaging_errors_total",
            "Packaging passes that failed",
        )?;
        let uploads = IntCounterVec::new(
            Opts::new("usage_agent_uploads_total", "Upload attempts by response status"),
            &["status"],
        )?;
        let source_checks = IntCounterVec::new(
            Opts::new("usage_agent_source_checks_total", "Source checks by outcome"),
            &["defined"],
        )?;
        let pending_archives = IntGauge::new(
            "usage_agent_pending_archives",
            "Archives waiting in the upload directory",
        )?;
        let pass_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "usage_agent_pass_latency_seconds",
                "Duration of a full reconciliation pass",
            )
            .buckets(PASS_LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(hours_collected.clone()))?;
        registry.register(Box::new(collection_errors.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(archives_written.clone()))?;
        registry.register(Box::new(packaging_errors.clone()))?;
        registry.register(Box::new(uploads.clone()))?;
        registry.register(Box::new(source_checks.clone()))?;
        registry.register(Box::new(pending_archives.clone()))?;
        registry.register(Box::new(pass_latency_seconds.clone()))?;

        Ok(Self {
            hours_collected,
            collection_errors,
            rows_written,
            archives_written,
            packaging_errors,
            uploads,
            source_checks,
            pending_archives,
            pass_latency_seconds,
        })
    }

    pub fn inc_hours_collected(&self) {
        self.hours_collected.inc();
    }

    pub fn inc_collection_errors(&self) {
        self.collection_errors.inc();
    }

    pub fn add_rows_written(&self, class: &str, rows: usize) {
        self.rows_written
            .with_label_values(&[class])
            .inc_by(rows as u64);
    }

    pub fn add_archives_written(&self, count: usize) {
        self.archives_written.inc_by(count as u64);
    }

    pub fn inc_packaging_errors(&self) {
        self.packaging_errors.inc();
    }

    /// Count one upload attempt; `status` is the response status line
    /// or `error` when no response arrived
    pub fn inc_upload(&self, status: &str) {
        self.uploads.with_label_values(&[status]).inc();
    }

    pub fn inc_source_check(&self, defined: bool) {
        self.source_checks
            .with_label_values(&[if defined { "true" } else { "false" }])
            .inc();
    }

    pub fn set_pending_archives(&self, count: usize) {
        self.pending_archives.set(count as i64);
    }

    pub fn observe_pass_latency(&self, duration_secs: f64) {
        self.pass_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for pipeline milestones
///
/// Every record carries an `event` field and the cluster ID so the JSON
/// stream can be filtered per activity.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster_id: String,
}

impl StructuredLogger {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            cluster_id = %self.cluster_id,
            agent_version = %version,
            "Usage agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            cluster_id = %self.cluster_id,
            reason = %reason,
            "Usage agent shutting down"
        );
    }

    /// Log the outcome of one collection hour
    pub fn log_hour_collected(&self, hour: &str, rows: usize, message: &str) {
        info!(
            event = "hour_collected",
            cluster_id = %self.cluster_id,
            hour = %hour,
            rows = rows,
            message = %message,
            "Collected usage hour"
        );
    }

    pub fn log_collection_failed(&self, hour: &str, error: &str) {
        warn!(
            event = "hour_collection_failed",
            cluster_id = %self.cluster_id,
            hour = %hour,
            error = %error,
            "Usage hour abandoned"
        );
    }

    pub fn log_package_written(&self, manifest_id: &str, archives: usize, split: bool) {
        info!(
            event = "package_written",
            cluster_id = %self.cluster_id,
            manifest_id = %manifest_id,
            archives = archives,
            split = split,
            "Reports packaged"
        );
    }

    pub fn log_upload_finished(&self, uploaded: usize, status: &str, error: &str) {
        if error.is_empty() {
            info!(
                event = "upload_finished",
                cluster_id = %self.cluster_id,
                uploaded = uploaded,
                status = %status,
                "Upload pass finished"
            );
        } else {
            warn!(
                event = "upload_finished",
                cluster_id = %self.cluster_id,
                uploaded = uploaded,
                status = %status,
                error = %error,
                "Upload pass failed"
            );
        }
    }

    pub fn log_source_checked(&self, source_name: &str, defined: bool, error: &str) {
        if error.is_empty() {
            info!(
                event = "source_checked",
                cluster_id = %self.cluster_id,
                source_name = %source_name,
                defined = defined,
                "Source check finished"
            );
        } else {
            warn!(
                event = "source_checked",
                cluster_id = %self.cluster_id,
                source_name = %source_name,
                defined = defined,
                error = %error,
                "Source check reported an error"
            );
        }
    }
}
