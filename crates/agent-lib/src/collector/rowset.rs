//! Per-window merge of query results into keyed rows

use super::catalog::Query;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

pub type Labels = HashMap<String, String>;
pub type Row = BTreeMap<String, String>;

/// One labelled series returned by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub values: Vec<f64>,
}

impl Series {
    pub fn new(labels: Labels, values: Vec<f64>) -> Self {
        Self { labels, values }
    }

    fn label(&self, name: &str) -> &str {
        self.labels.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Rows keyed by the query's row-key tuple
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    rows: BTreeMap<String, Row>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one query's results; fields already present are kept
    pub fn apply(&mut self, query: &Query, series: &[Series]) {
        for stream in series {
            let key = row_key(&query.row_key, stream);
            let row = self.rows.entry(key).or_default();

            for (column, label) in &query.static_fields {
                row.entry(column.clone())
                    .or_insert_with(|| stream.label(label).to_string());
            }

            for (column, pattern) in &query.regex_fields {
                row.entry(column.clone())
                    .or_insert_with(|| find_fields(&stream.labels, pattern));
            }

            if let Some(value) = &query.value {
                let reduced = value.method.reduce(&stream.values);
                row.entry(value.column.clone())
                    .or_insert_with(|| float_to_string(reduced));
                let seconds = reduced * stream.values.len() as f64 * value.method.factor();
                row.entry(value.seconds_column.clone())
                    .or_insert_with(|| float_to_string(seconds));
            }
        }
    }

    /// Overwrite a derived field on an existing row
    pub fn set_field(&mut self, key: &str, column: &str, value: String) {
        if let Some(row) = self.rows.get_mut(key) {
            row.insert(column.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Row)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn row_key(key_labels: &[String], stream: &Series) -> String {
    key_labels
        .iter()
        .map(|label| stream.label(label))
        .collect::<Vec<_>>()
        .join(",")
}

/// Sorted `name:value` pairs of every label whose name matches, joined by `|`
pub fn find_fields(labels: &Labels, pattern: &Regex) -> String {
    let mut matched: Vec<String> = labels
        .iter()
        .filter(|(name, _)| pattern.is_match(name))
        .map(|(name, value)| format!("{name}:{value}"))
        .collect();
    matched.sort();
    matched.join("|")
}

/// Six-decimal rendering used for every numeric column
pub fn float_to_string(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{value:.6}")
    }
}

/// Trailing path segment of a provider ID (`aws:///us-east-1a/i-0abc` -> `i-0abc`)
pub fn resource_id(provider_id: &str) -> &str {
    provider_id.rsplit('/').next().unwrap_or(provider_id)
}
