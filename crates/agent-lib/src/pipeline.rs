//! One reconciliation pass over the whole pipeline
//!
//! A pass collects every pending hour, packages reports on the packaging
//! cycle (or at the end of each day), resolves credentials, checks the
//! source registration, uploads pending archives and prunes old ones.
//! Component failures are recorded in [`AgentStatus`] and returned
//! together; only a missing report directory stops the pass.

use crate::auth::AuthResolver;
use crate::collector::{update_report_status, Collector, CollectorError, TimeWindow};
use crate::cycle::should_run_at;
use crate::dirconfig::DirectoryConfig;
use crate::models::{AgentStatus, ClusterIdentity, SourceSpec};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::packaging::{FilePackager, FilesAction, PackageOutcome, PackagingConfig};
use crate::sources::{SourceRegistrar, SOURCES_ENDPOINT};
use crate::status::StatusStore;
use crate::upload::{UploadConfig, UploadSummary, Uploader};
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

pub const NO_DATA_MESSAGE: &str = "No data to report for the hour queried.";

/// Attempts per hour before it is given up for the life of the process
pub const MAX_HOUR_ATTEMPTS: u32 = 5;

/// Minutes a successful basic-auth check stays valid
pub const CREDENTIAL_CHECK_CYCLE: i64 = 1440;

const LAST_HOUR_OF_DAY: u32 = 23;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to get directory configuration: {0:#}")]
    Directory(anyhow::Error),
}

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub identity: ClusterIdentity,
    /// Base URL of the ingress and sources APIs
    pub api_url: String,
    /// Whether archives are delivered at all
    pub upload_toggle: bool,
    pub upload: UploadConfig,
    pub packaging: PackagingConfig,
    pub source: SourceSpec,
    /// How far back a lagging collection may reach
    pub retention: ChronoDuration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            identity: ClusterIdentity::default(),
            api_url: "https://console.redhat.com".to_string(),
            upload_toggle: true,
            upload: UploadConfig::default(),
            packaging: PackagingConfig::default(),
            source: SourceSpec::default(),
            retention: ChronoDuration::days(14),
        }
    }
}

/// What a pass did
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub hours_collected: usize,
    pub packaged: Vec<PackageOutcome>,
    pub upload: Option<UploadSummary>,
    pub source_defined: Option<bool>,
    pub errors: Vec<String>,
}

impl PassOutcome {
    /// All pass errors joined by newlines
    pub fn combined_error(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("\n"))
        }
    }
}

fn truncate(t: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    let ts = t.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or(t)
}

pub fn truncate_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate(t, 3600)
}

pub fn truncate_day(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate(t, 86_400)
}

/// Range of hour starts to collect, both ends inclusive
///
/// Normally the previous full hour. A collection lagging by more than an
/// hour resumes after `last_success`, or from the day boundary at the
/// retention limit when `last_success` is older than that.
pub fn plan_collection(
    now: DateTime<Utc>,
    last_success: Option<DateTime<Utc>>,
    retention: ChronoDuration,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let last_hour = truncate_hour(now) - ChronoDuration::hours(1);
    let start = match last_success {
        Some(last) if last_hour - last > ChronoDuration::hours(1) => {
            if last_hour - retention > last {
                truncate_day(last_hour - retention)
            } else {
                last + ChronoDuration::hours(1)
            }
        }
        _ => last_hour,
    };
    (start, last_hour)
}

pub struct Pipeline {
    config: PipelineConfig,
    dirs: DirectoryConfig,
    collector: Collector,
    auth: AuthResolver,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    attempts: HashMap<DateTime<Utc>, u32>,
    last_source_spec: Option<SourceSpec>,
}

impl Pipeline {
    pub fn new(
        mut config: PipelineConfig,
        dirs: DirectoryConfig,
        collector: Collector,
        auth: AuthResolver,
        metrics: PipelineMetrics,
    ) -> Self {
        if config.source.source_name.is_empty() {
            info!("Using cluster ID as default source name");
            config.source.source_name = config.identity.cluster_id.clone();
        }
        let logger = StructuredLogger::new(config.identity.cluster_id.clone());
        Self {
            config,
            dirs,
            collector,
            auth,
            metrics,
            logger,
            attempts: HashMap::new(),
            last_source_spec: None,
        }
    }

    pub fn dirs(&self) -> &DirectoryConfig {
        &self.dirs
    }

    pub fn auth(&self) -> &AuthResolver {
        &self.auth
    }

    fn packager(&self) -> FilePackager<'_> {
        FilePackager::new(
            &self.dirs,
            self.config.identity.clone(),
            self.config.packaging.clone(),
        )
    }

    /// Run one pass and persist the resulting status
    pub async fn run_pass(
        &mut self,
        status: &mut AgentStatus,
        store: &StatusStore,
    ) -> Result<PassOutcome, PipelineError> {
        let started = Instant::now();
        let mut outcome = self.reconcile(status, Utc::now()).await?;
        self.metrics
            .observe_pass_latency(started.elapsed().as_secs_f64());

        if let Err(e) = store.save(status) {
            error!(error = %e, "Failed to save status");
            outcome.errors.push(format!("{e:#}"));
        }
        Ok(outcome)
    }

    /// One pass at wall-clock time `now`
    pub async fn reconcile(
        &mut self,
        status: &mut AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<PassOutcome, PipelineError> {
        let mut outcome = PassOutcome::default();
        status.cluster_id = self.config.identity.cluster_id.clone();

        let new_install = status.operator_commit != self.config.identity.version;
        if new_install {
            info!(
                previous = %status.operator_commit,
                current = %self.config.identity.version,
                "Agent commit changed, treating as new install"
            );
            status.operator_commit = self.config.identity.version.clone();
        }

        if !self.dirs.check_config() {
            self.dirs.ensure().map_err(PipelineError::Directory)?;
        }

        let (mut start, end) = plan_collection(
            now,
            status.prometheus.last_query_success_time,
            self.config.retention,
        );

        if new_install {
            let pending = self.dirs.reports.files().unwrap_or_default();
            if !pending.is_empty() {
                info!(files = pending.len(), "Packaging files from a previous agent version");
                self.package(status, FilesAction::Move, now, &mut outcome);
                status.packaging.last_successful_packaging_time = None;
                start = truncate_day(start);
            }
        }

        self.collect(status, start, end, now, &mut outcome).await;

        if end.hour() == LAST_HOUR_OF_DAY {
            self.package(status, FilesAction::Move, now, &mut outcome);
        } else if should_run_at(
            self.config.upload.cycle,
            status.packaging.last_successful_packaging_time,
            now,
            "file packaging",
        ) {
            self.package(status, FilesAction::Copy, now, &mut outcome);
        }

        if self.config.upload_toggle {
            info!("Configuration is for connected cluster");
            if let Err(e) = self.auth_and_upload(status, now, &mut outcome).await {
                warn!(error = %e, "Upload pass did not complete");
                outcome.errors.push(e.to_string());
            }
        } else {
            info!("Configuration is for restricted-network cluster");
        }

        match self.packager().trim_packages(&mut status.packaging) {
            Ok(_) => {}
            Err(e) => outcome.errors.push(e.to_string()),
        }

        match self.dirs.upload.files_full_path() {
            Ok(files) => {
                self.metrics.set_pending_archives(files.len());
                status.packaging.packaged_files = files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
            }
            Err(e) => outcome.errors.push(format!("{e:#}")),
        }

        Ok(outcome)
    }

    async fn collect(
        &mut self,
        status: &mut AgentStatus,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
        outcome: &mut PassOutcome,
    ) {
        if let Err(e) = self.collector.test_connection().await {
            error!(error = %e, "Failed to get prometheus connection");
            status.prometheus.connection_error = e.to_string();
            outcome.errors.push(format!("failed to get prometheus connection: {e}"));
            return;
        }
        status.prometheus.connection_error.clear();

        let mut hour = start;
        while hour <= end {
            if self.collect_hour(status, hour).await {
                outcome.hours_collected += 1;
            }
            // a finished day inside the window is moved before the next one
            // starts appending to the same monthly files
            if hour.hour() == LAST_HOUR_OF_DAY && hour < end {
                self.package(status, FilesAction::Move, now, outcome);
            }
            hour += ChronoDuration::hours(1);
        }
    }

    /// Returns true when the hour produced report rows
    async fn collect_hour(&mut self, status: &mut AgentStatus, hour: DateTime<Utc>) -> bool {
        let window = TimeWindow::hour(hour);
        let label = hour.to_rfc3339();
        if status.prometheus.last_query_success_time == Some(hour) {
            info!(start = %label, "Reports already generated for range");
            return false;
        }
        status.prometheus.last_query_start_time = Some(hour);

        if self.attempts.get(&hour).copied().unwrap_or(0) >= MAX_HOUR_ATTEMPTS {
            info!(start = %label, "Query retry limit exceeded");
            return false;
        }

        info!(start = %label, "Generating reports for range");
        update_report_status(&mut status.reports, &window);
        match self.collector.collect_window(&window, &self.dirs.reports.path).await {
            Ok(summary) => {
                status.reports.data_collected = true;
                status.reports.data_collection_message.clear();
                status.prometheus.last_query_success_time = Some(hour);
                self.attempts.clear();

                for (class, rows) in &summary.written {
                    self.metrics.add_rows_written(class.as_str(), *rows);
                }
                self.metrics.inc_hours_collected();
                self.logger.log_hour_collected(&label, summary.total(), "");
                true
            }
            Err(CollectorError::NoData) => {
                status.reports.data_collected = false;
                status.reports.data_collection_message = NO_DATA_MESSAGE.to_string();
                status.prometheus.last_query_success_time = Some(hour);
                self.logger.log_hour_collected(&label, 0, NO_DATA_MESSAGE);
                false
            }
            Err(e) => {
                *self.attempts.entry(hour).or_insert(0) += 1;
                status.reports.data_collected = false;
                status.reports.data_collection_message = format!("error: {e}");
                self.metrics.inc_collection_errors();
                self.logger.log_collection_failed(&label, &e.to_string());
                false
            }
        }
    }

    fn package(
        &self,
        status: &mut AgentStatus,
        action: FilesAction,
        now: DateTime<Utc>,
        outcome: &mut PassOutcome,
    ) {
        let packaged = self.packager().package_files(&mut status.packaging, action, now);
        if !status.packaging.packaging_error.is_empty() {
            self.metrics.inc_packaging_errors();
        }
        if let Some(package) = packaged {
            self.metrics.add_archives_written(package.archives.len());
            self.logger
                .log_package_written(&package.manifest.uuid, package.archives.len(), package.split);
            outcome.packaged.push(package);
        }
    }

    fn sources_url(&self) -> String {
        format!(
            "{}{}{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.source.sources_api_path,
            SOURCES_ENDPOINT
        )
    }

    async fn auth_and_upload(
        &mut self,
        status: &mut AgentStatus,
        now: DateTime<Utc>,
        outcome: &mut PassOutcome,
    ) -> anyhow::Result<()> {
        self.auth
            .resolve(&mut status.authentication)
            .await
            .context("failed to obtain credentials")?;

        let uploader = Uploader::new(&self.dirs, self.config.upload.clone());
        let files = uploader
            .pending_files(&status.upload, now)
            .context("failed to get files to upload")?;

        let first_source_check = status.source.last_source_check_time.is_none();
        if files.is_none() && !first_source_check {
            info!("No files to upload and skipping source check");
            return Ok(());
        }

        let sources_url = self.sources_url();
        self.auth
            .validate_credentials(&sources_url, CREDENTIAL_CHECK_CYCLE, &mut status.authentication)
            .await
            .context("failed to validate credentials")?;

        let spec_changed = self
            .last_source_spec
            .as_ref()
            .is_some_and(|previous| *previous != self.config.source);
        self.last_source_spec = Some(self.config.source.clone());

        let registrar = SourceRegistrar::new(
            &self.auth,
            &self.config.api_url,
            self.config.source.clone(),
            &self.config.identity.cluster_id,
        );
        if let Some(defined) = registrar
            .check_source(&mut status.source, spec_changed, now)
            .await {
            self.metrics.inc_source_check(defined);
            self.logger.log_source_checked(
                &status.source.source_name,
                defined,
                &status.source.source_error,
            );
            outcome.source_defined = Some(defined);
        }

        let Some(files) = files else {
            return Ok(());
        };

        let summary = uploader
            .upload_files(&self.auth, &mut status.upload, &files)
            .await
            .context("failed to upload files")?;
        for _ in &summary.uploaded {
            self.metrics.inc_upload("202 Accepted");
        }
        if !status.upload.upload_error.is_empty() {
            match status.upload.last_upload_status.as_str() {
                "" => self.metrics.inc_upload("error"),
                line => self.metrics.inc_upload(line),
            }
        }
        self.logger.log_upload_finished(
            summary.uploaded.len(),
            &status.upload.last_upload_status,
            &status.upload.upload_error,
        );

        let unauthorized = summary.unauthorized;
        outcome.upload = Some(summary);
        if unauthorized {
            info!("Upload was rejected with 401, re-validating credentials");
            self.auth.force_revalidation();
            self.auth
                .validate_credentials(&sources_url, 0, &mut status.authentication)
                .await
                .context("failed to validate credentials")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_truncation() {
        assert_eq!(truncate_hour(at(5, 10, 42)), at(5, 10, 0));
        assert_eq!(truncate_day(at(5, 10, 42)), at(5, 0, 0));
    }

    #[test]
    fn test_plan_previous_hour() {
        let retention = ChronoDuration::days(14);
        assert_eq!(
            plan_collection(at(5, 10, 42), None, retention),
            (at(5, 9, 0), at(5, 9, 0))
        );
        assert_eq!(
            plan_collection(at(5, 10, 42), Some(at(5, 8, 0)), retention),
            (at(5, 9, 0), at(5, 9, 0))
        );
    }

    #[test]
    fn test_plan_resumes_after_gap() {
        let (start, end) =
            plan_collection(at(5, 10, 42), Some(at(5, 3, 0)), ChronoDuration::days(14));
        assert_eq!(start, at(5, 4, 0));
        assert_eq!(end, at(5, 9, 0));
    }

    #[test]
    fn test_plan_bounded_by_retention() {
        let (start, end) =
            plan_collection(at(20, 10, 42), Some(at(1, 3, 0)), ChronoDuration::days(14));
        assert_eq!(start, at(6, 0, 0));
        assert_eq!(end, at(20, 9, 0));
    }

    #[test]
    fn test_combined_error() {
        let mut outcome = PassOutcome::default();
        assert!(outcome.combined_error().is_none());
        outcome.errors = vec!["first".into(), "second".into()];
        assert_eq!(outcome.combined_error().as_deref(), Some("first\nsecond"));
    }
}
