//! Typed report rows and the append-only CSV writer

use super::catalog::ResourceClass;
use super::rowset::Row;
use super::TimeWindow;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Timestamp layout used in every date column
pub const REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S +0000 UTC";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to access report {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode csv row: {0}")]
    Csv(#[from] csv::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Report period (calendar month) and interval (queried window)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTimes {
    pub report_period_start: String,
    pub report_period_end: String,
    pub interval_start: String,
    pub interval_end: String,
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format(REPORT_TIME_FORMAT).to_string())
        .unwrap_or_default()
}

impl DateTimes {
    pub fn new(window: &TimeWindow) -> Self {
        let start = window.start;
        let (next_year, next_month) = if start.month() == 12 {
            (start.year() + 1, 1)
        } else {
            (start.year(), start.month() + 1)
        };
        Self {
            report_period_start: format_time(month_start(start.year(), start.month())),
            report_period_end: format_time(month_start(next_year, next_month)),
            interval_start: format_time(Some(window.start)),
            interval_end: format_time(Some(window.end)),
        }
    }

    fn fields(&self) -> [String; 4] {
        [
            self.report_period_start.clone(),
            self.report_period_end.clone(),
            self.interval_start.clone(),
            self.interval_end.clone(),
        ]
    }

    /// Leading text shared by every line written for this window
    pub fn line_prefix(&self) -> String {
        self.fields().join(",")
    }
}

const DATE_HEADER: [&str; 4] = [
    "report_period_start",
    "report_period_end",
    "interval_start",
    "interval_end",
];

/// A fixed-shape CSV row for one resource class
pub trait ReportRow {
    const CLASS: ResourceClass;
    /// Columns after the date quadruple
    const COLUMNS: &'static [&'static str];

    fn dates(&self) -> &DateTimes;

    /// Values for [`Self::COLUMNS`], in order
    fn values(&self) -> Vec<String>;

    fn header() -> Vec<String> {
        DATE_HEADER
            .iter()
            .chain(Self::COLUMNS.iter())
            .map(|s| s.to_string())
            .collect()
    }

    fn fields(&self) -> Vec<String> {
        let mut fields = self.dates().fields().to_vec();
        fields.extend(self.values());
        fields
    }
}

fn col(row: &Row, key: &str) -> String {
    row.get(key).cloned().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRow {
    pub dates: DateTimes,
    pub node: String,
    pub node_capacity_cpu_cores: String,
    pub node_capacity_cpu_core_seconds: String,
    pub node_capacity_memory_bytes: String,
    pub node_capacity_memory_byte_seconds: String,
    pub node_role: String,
    pub resource_id: String,
    pub node_labels: String,
}

impl NodeRow {
    pub fn from_row(dates: DateTimes, row: &Row) -> Self {
        Self {
            dates,
            node: col(row, "node"),
            node_capacity_cpu_cores: col(row, "node-capacity-cpu-cores"),
            node_capacity_cpu_core_seconds: col(row, "node-capacity-cpu-core-seconds"),
            node_capacity_memory_bytes: col(row, "node-capacity-memory-bytes"),
            node_capacity_memory_byte_seconds: col(row, "node-capacity-memory-byte-seconds"),
            node_role: col(row, "node_role"),
            resource_id: col(row, "resource_id"),
            node_labels: col(row, "node_labels"),
        }
    }
}

impl ReportRow for NodeRow {
    const CLASS: ResourceClass = ResourceClass::Node;
    const COLUMNS: &'static [&'static str] = &[
        "node",
        "node_capacity_cpu_cores",
        "node_capacity_cpu_core_seconds",
        "node_capacity_memory_bytes",
        "node_capacity_memory_byte_seconds",
        "node_role",
        "resource_id",
        "node_labels",
    ];

    fn dates(&self) -> &DateTimes {
        &self.dates
    }

    fn values(&self) -> Vec<String> {
        vec![
            self.node.clone(),
            self.node_capacity_cpu_cores.clone(),
            self.node_capacity_cpu_core_seconds.clone(),
            self.node_capacity_memory_bytes.clone(),
            self.node_capacity_memory_byte_seconds.clone(),
            self.node_role.clone(),
            self.resource_id.clone(),
            self.node_labels.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRow {
    pub dates: DateTimes,
    pub node: String,
    pub namespace: String,
    pub pod: String,
    pub pod_usage_cpu_core_seconds: String,
    pub pod_request_cpu_core_seconds: String,
    pub pod_limit_cpu_core_seconds: String,
    pub pod_usage_memory_byte_seconds: String,
    pub pod_request_memory_byte_seconds: String,
    pub pod_limit_memory_byte_seconds: String,
    pub node_capacity_cpu_cores: String,
    pub node_capacity_cpu_core_seconds: String,
    pub node_capacity_memory_bytes: String,
    pub node_capacity_memory_byte_seconds: String,
    pub node_role: String,
    pub resource_id: String,
    pub pod_labels: String,
}

impl PodRow {
    /// Node columns come from the pod's node row; unknown nodes leave them empty
    pub fn from_row(dates: DateTimes, row: &Row, nodes: &HashMap<String, NodeRow>) -> Self {
        let node = col(row, "node");
        let node_row = nodes.get(&node);
        let from_node = |f: fn(&NodeRow) -> &String| node_row.map(f).cloned().unwrap_or_default();

        Self {
            dates,
            namespace: col(row, "namespace"),
            pod: col(row, "pod"),
            pod_usage_cpu_core_seconds: col(row, "pod-usage-cpu-core-seconds"),
            pod_request_cpu_core_seconds: col(row, "pod-request-cpu-core-seconds"),
            pod_limit_cpu_core_seconds: col(row, "pod-limit-cpu-core-seconds"),
            pod_usage_memory_byte_seconds: col(row, "pod-usage-memory-byte-seconds"),
            pod_request_memory_byte_seconds: col(row, "pod-request-memory-byte-seconds"),
            pod_limit_memory_byte_seconds: col(row, "pod-limit-memory-byte-seconds"),
            node_capacity_cpu_cores: from_node(|n| &n.node_capacity_cpu_cores),
            node_capacity_cpu_core_seconds: from_node(|n| &n.node_capacity_cpu_core_seconds),
            node_capacity_memory_bytes: from_node(|n| &n.node_capacity_memory_bytes),
            node_capacity_memory_byte_seconds: from_node(|n| {
                &n.node_capacity_memory_byte_seconds
            }),
            node_role: from_node(|n| &n.node_role),
            resource_id: from_node(|n| &n.resource_id),
            pod_labels: col(row, "pod_labels"),
            node,
        }
    }
}

impl ReportRow for PodRow {
    const CLASS: ResourceClass = ResourceClass::Pod;
    const COLUMNS: &'static [&'static str] = &[
        "node",
        "namespace",
        "pod",
        "pod_usage_cpu_core_seconds",
        "pod_request_cpu_core_seconds",
        "pod_limit_cpu_core_seconds",
        "pod_usage_memory_byte_seconds",
        "pod_request_memory_byte_seconds",
        "pod_limit_memory_byte_seconds",
        "node_capacity_cpu_cores",
        "node_capacity_cpu_core_seconds",
        "node_capacity_memory_bytes",
        "node_capacity_memory_byte_seconds",
        "node_role",
        "resource_id",
        "pod_labels",
    ];

    fn dates(&self) -> &DateTimes {
        &self.dates
    }

    fn values(&self) -> Vec<String> {
        vec![
            self.node.clone(),
            self.namespace.clone(),
            self.pod.clone(),
            self.pod_usage_cpu_core_seconds.clone(),
            self.pod_request_cpu_core_seconds.clone(),
            self.pod_limit_cpu_core_seconds.clone(),
            self.pod_usage_memory_byte_seconds.clone(),
            self.pod_request_memory_byte_seconds.clone(),
            self.pod_limit_memory_byte_seconds.clone(),
            self.node_capacity_cpu_cores.clone(),
            self.node_capacity_cpu_core_seconds.clone(),
            self.node_capacity_memory_bytes.clone(),
            self.node_capacity_memory_byte_seconds.clone(),
            self.node_role.clone(),
            self.resource_id.clone(),
            self.pod_labels.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRow {
    pub dates: DateTimes,
    pub namespace: String,
    pub pod: String,
    pub persistentvolumeclaim: String,
    pub persistentvolume: String,
    pub storageclass: String,
    pub persistentvolumeclaim_capacity_bytes: String,
    pub persistentvolumeclaim_capacity_byte_seconds: String,
    pub volume_request_storage_byte_seconds: String,
    pub persistentvolumeclaim_usage_byte_seconds: String,
    pub persistentvolume_labels: String,
    pub persistentvolumeclaim_labels: String,
}

impl StorageRow {
    pub fn from_row(dates: DateTimes, row: &Row) -> Self {
        Self {
            dates,
            namespace: col(row, "namespace"),
            pod: col(row, "pod"),
            persistentvolumeclaim: col(row, "persistentvolumeclaim"),
            persistentvolume: col(row, "persistentvolume"),
            storageclass: col(row, "storageclass"),
            persistentvolumeclaim_capacity_bytes: col(row, "persistentvolumeclaim-capacity-bytes"),
            persistentvolumeclaim_capacity_byte_seconds: col(
                row,
                "persistentvolumeclaim-capacity-byte-seconds",
            ),
            volume_request_storage_byte_seconds: col(
                row,
                "persistentvolumeclaim-request-byte-seconds",
            ),
            persistentvolumeclaim_usage_byte_seconds: col(
                row,
                "persistentvolumeclaim-usage-byte-seconds",
            ),
            persistentvolume_labels: col(row, "persistentvolume_labels"),
            persistentvolumeclaim_labels: col(row, "persistentvolumeclaim_labels"),
        }
    }
}

impl ReportRow for StorageRow {
    const CLASS: ResourceClass = ResourceClass::Volume;
    const COLUMNS: &'static [&'static str] = &[
        "namespace",
        "pod",
        "persistentvolumeclaim",
        "persistentvolume",
        "storageclass",
        "persistentvolumeclaim_capacity_bytes",
        "persistentvolumeclaim_capacity_byte_seconds",
        "volume_request_storage_byte_seconds",
        "persistentvolumeclaim_usage_byte_seconds",
        "persistentvolume_labels",
        "persistentvolumeclaim_labels",
    ];

    fn dates(&self) -> &DateTimes {
        &self.dates
    }

    fn values(&self) -> Vec<String> {
        vec![
            self.namespace.clone(),
            self.pod.clone(),
            self.persistentvolumeclaim.clone(),
            self.persistentvolume.clone(),
            self.storageclass.clone(),
            self.persistentvolumeclaim_capacity_bytes.clone(),
            self.persistentvolumeclaim_capacity_byte_seconds.clone(),
            self.volume_request_storage_byte_seconds.clone(),
            self.persistentvolumeclaim_usage_byte_seconds.clone(),
            self.persistentvolume_labels.clone(),
            self.persistentvolumeclaim_labels.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRow {
    pub dates: DateTimes,
    pub namespace: String,
    pub namespace_labels: String,
}

impl NamespaceRow {
    pub fn from_row(dates: DateTimes, row: &Row) -> Self {
        Self {
            dates,
            namespace: col(row, "namespace"),
            namespace_labels: col(row, "namespace_labels"),
        }
    }
}

impl ReportRow for NamespaceRow {
    const CLASS: ResourceClass = ResourceClass::Namespace;
    const COLUMNS: &'static [&'static str] = &["namespace", "namespace_labels"];

    fn dates(&self) -> &DateTimes {
        &self.dates
    }

    fn values(&self) -> Vec<String> {
        vec![self.namespace.clone(), self.namespace_labels.clone()]
    }
}

/// Encode one record as a CSV line without its terminator
pub fn encode_line(fields: &[String]) -> Result<String, ReportError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ReportError::Csv(csv::Error::from(e.into_error())))?;
    Ok(String::from_utf8_lossy(&bytes)
        .trim_end_matches('\n')
        .to_string())
}

/// Outcome of appending one class's rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportWrite {
    pub path: PathBuf,
    pub created: bool,
    pub written: usize,
}

/// Append rows to `<dir>/<class prefix><yyyymm>.csv`, skipping lines already present
///
/// The header is written only when the file is created.
pub fn write_report<R: ReportRow>(
    dir: &Path,
    yyyymm: &str,
    dates: &DateTimes,
    rows: &[R],
) -> Result<ReportWrite, ReportError> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let path = dir.join(R::CLASS.file_name(yyyymm));
    let created = !path.exists();

    let prefix = dates.line_prefix();
    let mut seen: HashSet<String> = HashSet::new();
    if !created {
        let existing = fs::read_to_string(&path).map_err(io_err(&path))?;
        seen.extend(
            existing
                .lines()
                .skip(1)
                .filter(|line| line.starts_with(&prefix))
                .map(str::to_string),
        );
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_err(&path))?;

    let mut buffer = String::new();
    if created {
        buffer.push_str(&encode_line(&R::header())?);
        buffer.push('\n');
    }

    let mut written = 0;
    for row in rows {
        let line = encode_line(&row.fields())?;
        if seen.insert(line.clone()) {
            buffer.push_str(&line);
            buffer.push('\n');
            written += 1;
        }
    }

    file.write_all(buffer.as_bytes()).map_err(io_err(&path))?;
    file.sync_all().map_err(io_err(&path))?;

    debug!(
        path = %path.display(),
        class = %R::CLASS,
        written = written,
        "Wrote report rows"
    );

    Ok(ReportWrite {
        path,
        created,
        written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn window() -> TimeWindow {
        TimeWindow::hour(Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap())
    }

    fn namespace_row(name: &str) -> NamespaceRow {
        NamespaceRow {
            dates: DateTimes::new(&window()),
            namespace: name.to_string(),
            namespace_labels: "label_team:core".to_string(),
        }
    }

    #[test]
    fn test_dates_cover_month_and_window() {
        let dates = DateTimes::new(&window());
        assert_eq!(dates.report_period_start, "2024-12-01 00:00:00 +0000 UTC");
        assert_eq!(dates.report_period_end, "2025-01-01 00:00:00 +0000 UTC");
        assert_eq!(dates.interval_start, "2024-12-31 23:00:00 +0000 UTC");
        assert_eq!(dates.interval_end, "2024-12-31 23:59:59 +0000 UTC");
    }

    #[test]
    fn test_headers() {
        let header = NamespaceRow::header();
        assert_eq!(
            header,
            vec![
                "report_period_start",
                "report_period_end",
                "interval_start",
                "interval_end",
                "namespace",
                "namespace_labels"
            ]
        );
        assert_eq!(PodRow::header().len(), 20);
        assert_eq!(StorageRow::header().len(), 15);
        assert_eq!(NodeRow::header().len(), 12);
    }

    #[test]
    fn test_encode_line_quotes_when_needed() {
        let line = encode_line(&["a".to_string(), "b,c".to_string()]).unwrap();
        assert_eq!(line, "a,\"b,c\"");
    }

    #[test]
    fn test_write_creates_file_with_header() {
        let temp_dir = TempDir::new().unwrap();
        let dates = DateTimes::new(&window());
        let result =
            write_report(temp_dir.path(), "202412", &dates, &[namespace_row("ns1")]).unwrap();

        assert!(result.created);
        assert_eq!(result.written, 1);
        assert_eq!(
            result.path.file_name().unwrap(),
            "cm-openshift-namespace-usage-202412.csv"
        );

        let content = fs::read_to_string(&result.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("report_period_start,"));
        assert!(lines[1].ends_with(",ns1,label_team:core"));
    }

    #[test]
    fn test_rewriting_existing_line_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let dates = DateTimes::new(&window());
        write_report(temp_dir.path(), "202412", &dates, &[namespace_row("ns1")]).unwrap();

        let again = write_report(
            temp_dir.path(),
            "202412",
            &dates,
            &[namespace_row("ns1"), namespace_row("ns2")],
        )
        .unwrap();
        assert!(!again.created);
        assert_eq!(again.written, 1);

        let content = fs::read_to_string(&again.path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.matches("ns1").count(), 1);
    }

    #[test]
    fn test_pod_row_pulls_node_columns() {
        let dates = DateTimes::new(&window());
        let mut node = Row::new();
        node.insert("node".into(), "n1".into());
        node.insert("node-capacity-cpu-cores".into(), "4.000000".into());
        node.insert("resource_id".into(), "i-0abc".into());
        let nodes: HashMap<String, NodeRow> =
            [("n1".to_string(), NodeRow::from_row(dates.clone(), &node))].into();

        let mut pod = Row::new();
        pod.insert("node".into(), "n1".into());
        pod.insert("pod".into(), "web".into());
        let row = PodRow::from_row(dates.clone(), &pod, &nodes);
        assert_eq!(row.node_capacity_cpu_cores, "4.000000");
        assert_eq!(row.resource_id, "i-0abc");

        pod.insert("node".into(), "missing".into());
        let orphan = PodRow::from_row(dates, &pod, &nodes);
        assert_eq!(orphan.node_capacity_cpu_cores, "");
        assert_eq!(orphan.resource_id, "");
    }
}
