//! Hourly usage collection from the metrics backend
//!
//! A [`Collector`] runs every catalog query for one window, merges the
//! results per resource class and appends typed rows to the monthly CSV
//! files in the reports directory.

mod catalog;
mod prometheus;
mod report;
mod rowset;


pub use catalog::{
    aggregate_named, Aggregation, CatalogError, Query, QueryCatalog, QuerySpec, QueryValue,
    ResourceClass, ValueSpec, MAX_FACTOR, SUM_FACTOR,
};
pub use prometheus::{BackendError, MetricsBackend, PrometheusClient, PrometheusConfig};
pub use report::{
    encode_line, write_report, DateTimes, NamespaceRow, NodeRow, PodRow, ReportError, ReportRow,
    ReportWrite, StorageRow, REPORT_TIME_FORMAT,
};
pub use rowset::{find_fields, float_to_string, resource_id, Labels, Row, RowSet, Series};

use crate::models::ReportsStatus;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Layout of `last_hour_queried`
pub const STATUS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A closed query range with its step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: ChronoDuration,
}

impl TimeWindow {
    /// `[start, start + 59m59s]` with a one-minute step
    pub fn hour(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: start + ChronoDuration::minutes(59) + ChronoDuration::seconds(59),
            step: ChronoDuration::minutes(1),
        }
    }

    /// `YYYYMM` of the window start
    pub fn year_month(&self) -> String {
        self.start.format("%Y%m").to_string()
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("no data to collect")]
    NoData,

    #[error("query: {query}: {source}")]
    Query {
        query: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to write {class} report: {source}")]
    Report {
        class: ResourceClass,
        #[source]
        source: ReportError,
    },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<CollectorError>),
}

fn join_errors(errors: &[CollectorError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Retry policy for backend queries
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Base delay, doubled per attempt
    pub retry_backoff: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Rows written per class for one window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionSummary {
    pub written: BTreeMap<ResourceClass, usize>,
}

impl CollectionSummary {
    pub fn total(&self) -> usize {
        self.written.values().sum()
    }
}

pub struct Collector {
    backend: Arc<dyn MetricsBackend>,
    catalog: QueryCatalog,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(backend: Arc<dyn MetricsBackend>, catalog: QueryCatalog, config: CollectorConfig) -> Self {
        Self {
            backend,
            catalog,
            config,
        }
    }

    /// Confirm the backend answers queries
    pub async fn test_connection(&self) -> Result<(), BackendError> {
        self.backend.test_connection().await
    }

    async fn query_with_retry(
        &self,
        query: &Query,
        window: &TimeWindow,
    ) -> Result<Vec<Series>, CollectorError> {
        let mut attempt = 0u32;
        loop {
            match self.backend.query_range(&query.query, window).await {
                Ok(series) => return Ok(series),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt).max(1);
                    warn!(
                        query = %query.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(CollectorError::Query {
                        query: query.query.clone(),
                        source,
                    })
                }
            }
        }
    }

    async fn run_class(
        &self,
        class: ResourceClass,
        window: &TimeWindow,
    ) -> Result<RowSet, CollectorError> {
        info!(class = %class, "Querying metrics");
        let mut rows = RowSet::new();
        for query in self.catalog.queries(class) {
            let series = self.query_with_retry(query, window).await?;
            rows.apply(query, &series);
        }
        Ok(rows)
    }

    /// Collect one window into `reports_dir`
    ///
    /// Node rows are required: an empty node result is
    /// [`CollectorError::NoData`] and a node query failure writes nothing,
    /// though the other classes are still queried so their failures are
    /// reported too. Failures are gathered and returned together in node,
    /// pod, volume, namespace order.
    pub async fn collect_window(
        &self,
        window: &TimeWindow,
        reports_dir: &Path,
    ) -> Result<CollectionSummary, CollectorError> {
        let dates = DateTimes::new(window);
        let yyyymm = window.year_month();

        let mut node_set = match self.run_class(ResourceClass::Node, window).await {
            Ok(set) => set,
            Err(node_error) => {
                let mut errors = vec![node_error];
                for class in [ResourceClass::Pod, ResourceClass::Volume, ResourceClass::Namespace] {
                    if let Err(e) = self.run_class(class, window).await {
                        errors.push(e);
                    }
                }
                return Err(CollectorError::Multiple(errors));
            }
        };
        if node_set.is_empty() {
            info!("No node data to report");
            return Err(CollectorError::NoData);
        }
        for key in node_set.keys() {
            let provider_id = node_set
                .get(&key)
                .and_then(|row| row.get("provider_id"))
                .map(|p| resource_id(p).to_string())
                .unwrap_or_default();
            node_set.set_field(&key, "resource_id", provider_id);
        }

        let mut errors = Vec::new();
        let mut summary = CollectionSummary::default();

        let node_rows: Vec<NodeRow> = node_set
            .iter()
            .map(|(_, row)| NodeRow::from_row(dates.clone(), row))
            .collect();
        self.write(reports_dir, &yyyymm, &dates, &node_rows, &mut summary, &mut errors);
        let nodes: HashMap<String, NodeRow> = node_rows
            .into_iter()
            .map(|row| (row.node.clone(), row))
            .collect();

        match self.run_class(ResourceClass::Pod, window).await {
            Ok(set) => {
                let rows: Vec<PodRow> = set
                    .iter()
                    .map(|(_, row)| PodRow::from_row(dates.clone(), row, &nodes))
                    .collect();
                self.write(reports_dir, &yyyymm, &dates, &rows, &mut summary, &mut errors);
            }
            Err(e) => errors.push(e),
        }

        match self.run_class(ResourceClass::Volume, window).await {
            Ok(set) => {
                let rows: Vec<StorageRow> = set
                    .iter()
                    .map(|(_, row)| StorageRow::from_row(dates.clone(), row))
                    .collect();
                self.write(reports_dir, &yyyymm, &dates, &rows, &mut summary, &mut errors);
            }
            Err(e) => errors.push(e),
        }

        match self.run_class(ResourceClass::Namespace, window).await {
            Ok(set) => {
                let rows: Vec<NamespaceRow> = set
                    .iter()
                    .map(|(_, row)| NamespaceRow::from_row(dates.clone(), row))
                    .collect();
                self.write(reports_dir, &yyyymm, &dates, &rows, &mut summary, &mut errors);
            }
            Err(e) => errors.push(e),
        }

        if errors.is_empty() {
            Ok(summary)
        } else {
            Err(CollectorError::Multiple(errors))
        }
    }

    fn write<R: ReportRow>(
        &self,
        reports_dir: &Path,
        yyyymm: &str,
        dates: &DateTimes,
        rows: &[R],
        summary: &mut CollectionSummary,
        errors: &mut Vec<CollectorError>,
    ) {
        match write_report(reports_dir, yyyymm, dates, rows) {
            Ok(result) => {
                info!(
                    class = %R::CLASS,
                    file = %result.path.display(),
                    written = result.written,
                    "Wrote results to file"
                );
                summary.written.insert(R::CLASS, result.written);
            }
            Err(source) => errors.push(CollectorError::Report {
                class: R::CLASS,
                source,
            }),
        }
    }
}

/// Record the month and hour a collection attempt covers
pub fn update_report_status(status: &mut ReportsStatus, window: &TimeWindow) {
    status.report_month = window.start.format("%m").to_string();
    status.last_hour_queried = format!(
        "{} - {}",
        window.start.format(STATUS_TIME_FORMAT),
        window.end.format(STATUS_TIME_FORMAT)
    );
}
