//! Report packaging
//!
//! Staged CSVs are bundled with a manifest into gzip-tar archives in the
//! upload directory. Oversized reports are split so every archive stays
//! under the configured size, and old archives are pruned past the
//! retention count.

mod archive;
mod manifest;
mod split;


pub use archive::{list_entries, read_manifest, write_archive, ArchiveEntry};
pub use manifest::{interval_bounds, parse_report_time, upload_name, Manifest, MANIFEST_FILE};
pub use split::{estimate_line_size, need_split, split_file};

use crate::collector::ReportError;
use crate::dirconfig::{check_exists_or_recreate, DirectoryConfig};
use crate::models::{ClusterIdentity, PackagingStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const MEGABYTE: u64 = 1024 * 1024;

/// Layout of the archive name prefix
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S_%6f";

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("reports not found")]
    NoReports,

    #[error("could not check directory: {0:#}")]
    Directory(anyhow::Error),

    #[error("failed to {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to process csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to encode csv: {0}")]
    Report(#[from] ReportError),

    #[error("failed to process manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("{path:?} has no {column} column")]
    MissingColumn { path: PathBuf, column: String },

    #[error("no manifest found in {0:?}")]
    MissingManifest(PathBuf),
}

impl PackagingError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| PackagingError::Io { context, source }
    }
}

/// How report files reach the staging directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesAction {
    /// End of day: reports leave the data directory
    Move,
    /// Intra-day: reports stay so the day keeps accumulating
    Copy,
}

/// Packaging limits
#[derive(Debug, Clone)]
pub struct PackagingConfig {
    /// Largest archive payload before reports are split
    pub max_size_bytes: u64,
    /// Archive groups kept in the upload directory
    pub max_reports: usize,
    /// Overhead applied to each row's size estimate
    pub variance: f64,
    /// Upper bound on parts per report
    pub max_splits: usize,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * MEGABYTE,
            max_reports: 30,
            variance: 0.03,
            max_splits: 1000,
        }
    }
}

impl PackagingConfig {
    pub fn with_max_size_mb(mut self, mb: u64) -> Self {
        self.max_size_bytes = mb * MEGABYTE;
        self
    }
}

/// Result of one packaging pass
#[derive(Debug, Clone)]
pub struct PackageOutcome {
    pub manifest: Manifest,
    pub archives: Vec<PathBuf>,
    pub split: bool,
}

pub struct FilePackager<'a> {
    dirs: &'a DirectoryConfig,
    identity: ClusterIdentity,
    config: PackagingConfig,
}

impl<'a> FilePackager<'a> {
    pub fn new(dirs: &'a DirectoryConfig, identity: ClusterIdentity, config: PackagingConfig) -> Self {
        Self {
            dirs,
            identity,
            config,
        }
    }

    /// Bring report CSVs into staging as `<uid>-<name>`
    fn stage_files(
        &self,
        uid: &str,
        action: FilesAction,
        clear_staging: bool,
    ) -> Result<Vec<PathBuf>, PackagingError> {
        let reports: Vec<String> = self
            .dirs
            .reports
            .files()
            .map_err(PackagingError::Directory)?
            .into_iter()
            .filter(|name| name.ends_with(".csv"))
            .collect();
        if reports.is_empty() {
            return Err(PackagingError::NoReports);
        }

        if clear_staging {
            info!("Clearing out staging directory");
            self.dirs
                .staging
                .remove_contents()
                .map_err(PackagingError::Directory)?;
        }

        info!(action = ?action, count = reports.len(), "Staging report files");
        let mut staged = Vec::with_capacity(reports.len());
        for name in reports {
            let from = self.dirs.reports.path.join(&name);
            let to = self.dirs.staging.path.join(format!("{uid}-{name}"));
            match action {
                FilesAction::Move => fs::rename(&from, &to)
                    .map_err(PackagingError::io(format!("move {from:?} to staging")))?,
                FilesAction::Copy => {
                    fs::copy(&from, &to)
                        .map_err(PackagingError::io(format!("copy {from:?} to staging")))?;
                }
            }
            staged.push(to);
        }
        Ok(staged)
    }

    /// Package every report into the upload directory
    ///
    /// `clear_staging` empties staging first; callers pass false when the
    /// previous pass failed so its staged files are retried.
    pub fn package_reports(
        &self,
        action: FilesAction,
        clear_staging: bool,
    ) -> Result<PackageOutcome, PackagingError> {
        let uid = Uuid::new_v4().to_string();
        let created = Utc::now();
        let timestamp = created.format(ARCHIVE_TIMESTAMP_FORMAT).to_string();

        check_exists_or_recreate(&[&self.dirs.reports, &self.dirs.staging, &self.dirs.upload])
            .map_err(PackagingError::Directory)?;

        let staged = self.stage_files(&uid, action, clear_staging)?;

        let (mut start, mut end) = (None, None);
        for path in &staged {
            let is_pod = path
                .file_name()
                .map(|n| manifest::is_pod_report(&n.to_string_lossy()))
                .unwrap_or(false);
            if is_pod {
                (start, end) = interval_bounds(path)?;
            }
        }

        let sizes = staged
            .iter()
            .map(|p| {
                fs::metadata(p)
                    .map(|m| m.len())
                    .map_err(PackagingError::io(format!("stat {p:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let split = need_split(&sizes, self.config.max_size_bytes);
        let files = if split {
            info!("Files require splitting");
            let mut files = Vec::new();
            for (path, size) in staged.iter().zip(&sizes) {
                if *size >= self.config.max_size_bytes {
                    files.extend(split_file(
                        path,
                        self.config.max_size_bytes,
                        self.config.variance,
                        self.config.max_splits,
                    )?);
                } else {
                    files.push(path.clone());
                }
            }
            files
        } else {
            info!("Files do not require splitting");
            staged
        };

        let entries: Vec<ArchiveEntry> = files
            .into_iter()
            .enumerate()
            .map(|(idx, path)| ArchiveEntry {
                upload_name: upload_name(&uid, idx),
                path,
            })
            .collect();

        let manifest = Manifest {
            uuid: uid.clone(),
            cluster_id: self.identity.cluster_id.clone(),
            version: self.identity.version.clone(),
            date: created,
            files: entries.iter().map(|e| e.upload_name.clone()).collect(),
            start,
            end,
            certified: false,
            daily_reports: true,
        };
        let manifest_path = self.dirs.staging.path.join(MANIFEST_FILE);
        info!(manifest = %manifest_path.display(), "Rendering manifest");
        manifest.write(&manifest_path)?;

        let base = format!("{timestamp}-cost-mgmt");
        let mut archives = Vec::new();
        let groups: Vec<(String, &[ArchiveEntry])> = if split {
            entries
                .iter()
                .enumerate()
                .map(|(idx, entry)| (format!("{base}-{idx}.tar.gz"), std::slice::from_ref(entry)))
                .collect()
        } else {
            vec![(format!("{base}.tar.gz"), entries.as_slice())]
        };

        for (name, group) in groups {
            let tmp = self.dirs.staging.path.join(format!("{name}.tmp"));
            let dest = self.dirs.upload.path.join(&name);
            info!(archive = %dest.display(), "Generating tar.gz");
            write_archive(&tmp, &dest, group, &manifest_path)?;
            archives.push(dest);
        }

        info!(uuid = %uid, archives = archives.len(), "File packaging was successful");
        Ok(PackageOutcome {
            manifest,
            archives,
            split,
        })
    }

    /// Run a packaging pass and record its outcome in `status`
    pub fn package_files(
        &self,
        status: &mut PackagingStatus,
        action: FilesAction,
        now: DateTime<Utc>,
    ) -> Option<PackageOutcome> {
        let clear_staging = status.packaging_error.is_empty();
        status.packaging_error.clear();

        match self.package_reports(action, clear_staging) {
            Ok(outcome) => {
                status.last_successful_packaging_time = Some(now);
                Some(outcome)
            }
            Err(PackagingError::NoReports) => {
                info!("No reports to package");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to package files");
                status.packaging_error = e.to_string();
                None
            }
        }
    }

    /// Remove the oldest archive groups beyond `max_reports`
    ///
    /// Archives sharing a timestamp prefix form one group and are kept or
    /// removed together. Returns the number of groups left.
    pub fn trim_packages(&self, status: &mut PackagingStatus) -> Result<usize, PackagingError> {
        let packages: Vec<String> = self
            .dirs
            .upload
            .files()
            .map_err(PackagingError::Directory)?
            .into_iter()
            .filter(|name| name.ends_with("tar.gz"))
            .collect();

        let group_of = |name: &str| name.split('-').next().unwrap_or(name).to_string();
        let groups: BTreeSet<String> = packages.iter().map(|n| group_of(n)).collect();

        let max = self.config.max_reports;
        if groups.len() <= max {
            info!(count = groups.len(), "Number of stored reports within limit");
            status.report_count = Some(groups.len() as i64);
            return Ok(groups.len());
        }

        info!(count = groups.len(), max = max, "Max report count reached, removing oldest reports");
        let expired: BTreeSet<String> = groups.iter().take(groups.len() - max).cloned().collect();
        for name in &packages {
            if expired.contains(&group_of(name)) {
                info!(report = %name, "Removing report");
                let path = self.dirs.upload.path.join(name);
                fs::remove_file(&path).map_err(PackagingError::io(format!("remove {path:?}")))?;
            }
        }

        status.report_count = Some(max as i64);
        Ok(max)
    }
}
