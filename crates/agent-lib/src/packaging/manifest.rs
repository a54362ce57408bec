//! Archive manifest

use super::PackagingError;
use crate::collector::ResourceClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Descriptor written beside the staged CSVs and embedded in every archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub uuid: String,
    pub cluster_id: String,
    pub version: String,
    pub date: DateTime<Utc>,
    pub files: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub certified: bool,
    #[serde(default)]
    pub daily_reports: bool,
}

impl Manifest {
    pub fn write(&self, path: &Path) -> Result<(), PackagingError> {
        let body = serde_json::to_vec_pretty(self)?;
        fs::write(path, body).map_err(PackagingError::io(format!("write manifest {path:?}")))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, PackagingError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Name a staged CSV travels under inside the archive
pub fn upload_name(uuid: &str, index: usize) -> String {
    format!("{uuid}_openshift_usage_report.{index}.csv")
}

/// Parse `2024-03-05 10:00:00 +0000 UTC`, ignoring the zone abbreviation
pub fn parse_report_time(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    let without_zone = trimmed
        .rsplit_once(' ')
        .filter(|(_, abbrev)| abbrev.chars().all(|c| c.is_ascii_alphabetic()))
        .map(|(rest, _)| rest)
        .unwrap_or(trimmed);
    DateTime::parse_from_str(without_zone, "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// First `interval_start` and last `interval_end` of a report
pub fn interval_bounds(
    path: &Path,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), PackagingError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let index_of = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PackagingError::MissingColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
    };
    let start_index = index_of("interval_start")?;
    let end_index = index_of("interval_end")?;

    let mut start = None;
    let mut end = None;
    for record in reader.records() {
        let record = record?;
        if start.is_none() {
            start = record.get(start_index).and_then(parse_report_time);
        }
        end = record.get(end_index).and_then(parse_report_time);
    }
    Ok((start, end))
}

/// Whether a staged file name belongs to the pod report
pub fn is_pod_report(name: &str) -> bool {
    name.contains(ResourceClass::Pod.file_prefix().trim_end_matches("usage-"))
}
