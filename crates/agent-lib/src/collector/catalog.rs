//! Static query catalog
//!
//! Each resource class owns a list of backend queries. A query names the
//! label tuple that identifies its output row, the labels copied verbatim
//! into columns, the label patterns collapsed into `name:value|...`
//! columns, and optionally an aggregation over the returned samples.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Seconds-column multiplier for `max` (one sample per minute step)
pub const MAX_FACTOR: f64 = 60.0;
/// Seconds-column multiplier for `sum`
pub const SUM_FACTOR: f64 = 1.0;

/// Resource classes, in collection order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Node,
    Pod,
    Volume,
    Namespace,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::Node,
        ResourceClass::Pod,
        ResourceClass::Volume,
        ResourceClass::Namespace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Node => "node",
            ResourceClass::Pod => "pod",
            ResourceClass::Volume => "volume",
            ResourceClass::Namespace => "namespace",
        }
    }

    /// Prefix of the per-month CSV file for this class
    pub fn file_prefix(&self) -> &'static str {
        match self {
            ResourceClass::Node => "cm-openshift-node-usage-",
            ResourceClass::Pod => "cm-openshift-pod-usage-",
            ResourceClass::Volume => "cm-openshift-storage-usage-",
            ResourceClass::Namespace => "cm-openshift-namespace-usage-",
        }
    }

    /// File name for the month `yyyymm`
    pub fn file_name(&self, yyyymm: &str) -> String {
        format!("{}{}.csv", self.file_prefix(), yyyymm)
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sample reducer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Max,
}

type Reducer = fn(&[f64]) -> f64;

const REDUCERS: &[(Aggregation, &str, Reducer, f64)] = &[
    (Aggregation::Sum, "sum", sum_samples, SUM_FACTOR),
    (Aggregation::Max, "max", max_samples, MAX_FACTOR),
];

fn sum_samples(samples: &[f64]) -> f64 {
    samples.iter().sum()
}

fn max_samples(samples: &[f64]) -> f64 {
    let mut iter = samples.iter().copied();
    let Some(first) = iter.next() else {
        return 0.0;
    };
    iter.fold(first, |acc, v| if v > acc { v } else { acc })
}

impl Aggregation {
    fn entry(&self) -> &'static (Aggregation, &'static str, Reducer, f64) {
        // REDUCERS covers every variant
        match self {
            Aggregation::Sum => &REDUCERS[0],
            Aggregation::Max => &REDUCERS[1],
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        REDUCERS
            .iter()
            .find(|(_, n, _, _)| *n == name)
            .map(|(agg, _, _, _)| *agg)
    }

    pub fn name(&self) -> &'static str {
        self.entry().1
    }

    pub fn reduce(&self, samples: &[f64]) -> f64 {
        (self.entry().2)(samples)
    }

    /// Multiplier applied with the sample count to derive the seconds column
    pub fn factor(&self) -> f64 {
        self.entry().3
    }
}

/// Reduce by method name; unknown methods yield 0
pub fn aggregate_named(method: &str, samples: &[f64]) -> f64 {
    Aggregation::from_name(method)
        .map(|agg| agg.reduce(samples))
        .unwrap_or(0.0)
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("query {query}: invalid label pattern {pattern:?}: {source}")]
    InvalidPattern {
        query: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("query {0}: row key must name at least one label")]
    EmptyRowKey(String),
}

/// Declarative table entry, compiled into a [`Query`] at load time
#[derive(Debug, Clone, Copy)]
pub struct QuerySpec {
    pub name: &'static str,
    pub query: &'static str,
    pub row_key: &'static [&'static str],
    /// (column, label)
    pub static_fields: &'static [(&'static str, &'static str)],
    /// (column, label pattern)
    pub regex_fields: &'static [(&'static str, &'static str)],
    pub value: Option<ValueSpec>,
}

#[derive(Debug, Clone, Copy)]
pub struct ValueSpec {
    pub column: &'static str,
    pub method: Aggregation,
    pub seconds_column: &'static str,
}

#[derive(Debug, Clone)]
pub struct QueryValue {
    pub column: String,
    pub method: Aggregation,
    pub seconds_column: String,
}

/// Compiled, immutable query
#[derive(Debug, Clone)]
pub struct Query {
    pub name: String,
    pub query: String,
    pub row_key: Vec<String>,
    pub static_fields: Vec<(String, String)>,
    pub regex_fields: Vec<(String, Regex)>,
    pub value: Option<QueryValue>,
}

impl Query {
    pub fn compile(spec: &QuerySpec) -> Result<Self, CatalogError> {
        if spec.row_key.is_empty() {
            return Err(CatalogError::EmptyRowKey(spec.name.to_string()));
        }

        let regex_fields = spec
            .regex_fields
            .iter()
            .map(|(column, pattern)| {
                Regex::new(pattern)
                    .map(|re| (column.to_string(), re))
                    .map_err(|source| CatalogError::InvalidPattern {
                        query: spec.name.to_string(),
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: spec.name.to_string(),
            query: spec.query.to_string(),
            row_key: spec.row_key.iter().map(|s| s.to_string()).collect(),
            static_fields: spec
                .static_fields
                .iter()
                .map(|(c, l)| (c.to_string(), l.to_string()))
                .collect(),
            regex_fields,
            value: spec.value.map(|v| QueryValue {
                column: v.column.to_string(),
                method: v.method,
                seconds_column: v.seconds_column.to_string(),
            }),
        })
    }
}

const fn max_value(column: &'static str, seconds_column: &'static str) -> Option<ValueSpec> {
    Some(ValueSpec {
        column,
        method: Aggregation::Max,
        seconds_column,
    })
}

const fn sum_value(column: &'static str, seconds_column: &'static str) -> Option<ValueSpec> {
    Some(ValueSpec {
        column,
        method: Aggregation::Sum,
        seconds_column,
    })
}

const NODE_STATIC: &[(&str, &str)] = &[("node", "node"), ("provider_id", "provider_id")];
const POD_STATIC: &[(&str, &str)] = &[("pod", "pod"), ("namespace", "namespace"), ("node", "node")];
const POD_KEY: &[&str] = &["pod", "namespace"];

pub const NODE_QUERIES: &[QuerySpec] = &[
    QuerySpec {
        name: "node-capacity-cpu-cores",
        query: "kube_node_status_capacity_cpu_cores * on(node) group_left(provider_id) max(kube_node_info) by (node, provider_id)",
        row_key: &["node"],
        static_fields: NODE_STATIC,
        regex_fields: &[],
        value: max_value("node-capacity-cpu-cores", "node-capacity-cpu-core-seconds"),
    },
    QuerySpec {
        name: "node-capacity-memory-bytes",
        query: "kube_node_status_capacity_memory_bytes * on(node) group_left(provider_id) max(kube_node_info) by (node, provider_id)",
        row_key: &["node"],
        static_fields: NODE_STATIC,
        regex_fields: &[],
        value: max_value("node-capacity-memory-bytes", "node-capacity-memory-byte-seconds"),
    },
    QuerySpec {
        name: "node-role",
        query: "kube_node_role",
        row_key: &["node"],
        static_fields: &[("node_role", "role")],
        regex_fields: &[],
        value: None,
    },
    QuerySpec {
        name: "node-labels",
        query: "kube_node_labels",
        row_key: &["node"],
        static_fields: &[],
        regex_fields: &[("node_labels", "label_*")],
        value: None,
    },
];

pub const POD_QUERIES: &[QuerySpec] = &[
    QuerySpec {
        name: "pod-limit-cpu-cores",
        query: "sum(kube_pod_container_resource_limits_cpu_cores) by (pod, namespace, node)",
        row_key: POD_KEY,
        static_fields: POD_STATIC,
        regex_fields: &[],
        value: max_value("pod-limit-cpu-cores", "pod-limit-cpu-core-seconds"),
    },
    QuerySpec {
        name: "pod-limit-memory-bytes",
        query: "sum(kube_pod_container_resource_limits_memory_bytes) by (pod, namespace, node)",
        row_key: POD_KEY,
        static_fields: POD_STATIC,
        regex_fields: &[],
        value: max_value("pod-limit-memory-bytes", "pod-limit-memory-byte-seconds"),
    },
    QuerySpec {
        name: "pod-request-cpu-cores",
        query: "sum(kube_pod_container_resource_requests_cpu_cores) by (pod, namespace, node)",
        row_key: POD_KEY,
        static_fields: POD_STATIC,
        regex_fields: &[],
        value: max_value("pod-request-cpu-cores", "pod-request-cpu-core-seconds"),
    },
    QuerySpec {
        name: "pod-request-memory-bytes",
        query: "sum(kube_pod_container_resource_requests_memory_bytes) by (pod, namespace, node)",
        row_key: POD_KEY,
        static_fields: POD_STATIC,
        regex_fields: &[],
        value: max_value("pod-request-memory-bytes", "pod-request-memory-byte-seconds"),
    },
    QuerySpec {
        name: "pod-usage-cpu-cores",
        query: "sum(rate(container_cpu_usage_seconds_total{container!='POD',container!='',pod!=''}[5m])) BY (pod, namespace, node)",
        row_key: POD_KEY,
        static_fields: POD_STATIC,
        regex_fields: &[],
        value: sum_value("pod-usage-cpu-cores", "pod-usage-cpu-core-seconds"),
    },
    QuerySpec {
        name: "pod-usage-memory-bytes",
        query: "sum(container_memory_usage_bytes{container!='POD', container!='',pod!=''}) by (pod, namespace, node)",
        row_key: POD_KEY,
        static_fields: POD_STATIC,
        regex_fields: &[],
        value: sum_value("pod-usage-memory-bytes", "pod-usage-memory-byte-seconds"),
    },
    QuerySpec {
        name: "pod-labels",
        query: "kube_pod_labels",
        row_key: POD_KEY,
        static_fields: &[("pod", "pod"), ("namespace", "namespace")],
        regex_fields: &[("pod_labels", "label_*")],
        value: None,
    },
];

pub const VOLUME_QUERIES: &[QuerySpec] = &[
    QuerySpec {
        name: "persistentvolume-pod-info",
        query: "kube_pod_spec_volumes_persistentvolumeclaims_info * on(persistentvolumeclaim, namespace) group_left(volumename) kube_persistentvolumeclaim_info",
        row_key: &["volumename"],
        static_fields: &[("namespace", "namespace"), ("pod", "pod")],
        regex_fields: &[],
        value: None,
    },
    QuerySpec {
        name: "persistentvolumeclaim-capacity-bytes",
        query: "kubelet_volume_stats_capacity_bytes * on(persistentvolumeclaim, namespace) group_left(volumename) kube_persistentvolumeclaim_info",
        row_key: &["volumename"],
        static_fields: &[],
        regex_fields: &[],
        value: max_value(
            "persistentvolumeclaim-capacity-bytes",
            "persistentvolumeclaim-capacity-byte-seconds",
        ),
    },
    QuerySpec {
        name: "persistentvolumeclaim-request-bytes",
        query: "kube_persistentvolumeclaim_resource_requests_storage_bytes * on(persistentvolumeclaim, namespace) group_left(volumename) kube_persistentvolumeclaim_info",
        row_key: &["volumename"],
        static_fields: &[],
        regex_fields: &[],
        value: max_value(
            "persistentvolumeclaim-request-bytes",
            "persistentvolumeclaim-request-byte-seconds",
        ),
    },
    QuerySpec {
        name: "persistentvolumeclaim-usage-bytes",
        query: "kubelet_volume_stats_used_bytes * on(persistentvolumeclaim, namespace) group_left(volumename) kube_persistentvolumeclaim_info",
        row_key: &["volumename"],
        static_fields: &[],
        regex_fields: &[],
        value: sum_value(
            "persistentvolumeclaim-usage-bytes",
            "persistentvolumeclaim-usage-byte-seconds",
        ),
    },
    QuerySpec {
        name: "persistentvolume-labels",
        query: "kube_persistentvolume_labels * on(persistentvolume, namespace) group_left(storageclass) kube_persistentvolume_info",
        row_key: &["persistentvolume"],
        static_fields: &[
            ("storageclass", "storageclass"),
            ("persistentvolume", "persistentvolume"),
        ],
        regex_fields: &[("persistentvolume_labels", "label_*")],
        value: None,
    },
    QuerySpec {
        name: "persistentvolumeclaim-labels",
        query: "kube_persistentvolumeclaim_labels * on(persistentvolumeclaim, namespace) group_left(volumename) kube_persistentvolumeclaim_info",
        row_key: &["volumename"],
        static_fields: &[
            ("namespace", "namespace"),
            ("persistentvolumeclaim", "persistentvolumeclaim"),
        ],
        regex_fields: &[("persistentvolumeclaim_labels", "label_")],
        value: None,
    },
];

pub const NAMESPACE_QUERIES: &[QuerySpec] = &[QuerySpec {
    name: "namespace-labels",
    query: "kube_namespace_labels",
    row_key: &["namespace"],
    static_fields: &[("namespace", "namespace")],
    regex_fields: &[("namespace_labels", "label_*")],
    value: None,
}];

/// Compiled queries for every resource class
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    node: Vec<Query>,
    pod: Vec<Query>,
    volume: Vec<Query>,
    namespace: Vec<Query>,
}

impl QueryCatalog {
    /// Compile the built-in tables
    pub fn load() -> Result<Self, CatalogError> {
        Self::from_specs(NODE_QUERIES, POD_QUERIES, VOLUME_QUERIES, NAMESPACE_QUERIES)
    }

    pub fn from_specs(
        node: &[QuerySpec],
        pod: &[QuerySpec],
        volume: &[QuerySpec],
        namespace: &[QuerySpec],
    ) -> Result<Self, CatalogError> {
        let compile = |specs: &[QuerySpec]| -> Result<Vec<Query>, CatalogError> {
            specs.iter().map(Query::compile).collect()
        };
        Ok(Self {
            node: compile(node)?,
            pod: compile(pod)?,
            volume: compile(volume)?,
            namespace: compile(namespace)?,
        })
    }

    pub fn queries(&self, class: ResourceClass) -> &[Query] {
        match class {
            ResourceClass::Node => &self.node,
            ResourceClass::Pod => &self.pod,
            ResourceClass::Volume => &self.volume,
            ResourceClass::Namespace => &self.namespace,
        }
    }
}
