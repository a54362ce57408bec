//! Source registration with the sources API
//!
//! Confirms that this cluster is registered under the configured source
//! name, creating the source when allowed. Existing registrations under
//! another name, or names owned by another cluster, are reported as
//! conflicts and never duplicated.


use crate::auth::{AuthError, AuthResolver};
use crate::cycle::should_run_at;
use crate::http::{self, HttpError};
use crate::models::{SourceSpec, SourceStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const SOURCE_TYPES_ENDPOINT: &str = "source_types";
pub const APPLICATION_TYPES_ENDPOINT: &str = "application_types";
pub const SOURCES_ENDPOINT: &str = "sources";
pub const APPLICATIONS_ENDPOINT: &str = "applications";

pub const OPENSHIFT_SOURCE_TYPE: &str = "openshift";
pub const COST_MANAGEMENT_APP_TYPE: &str = "/insights/platform/cost-management";

pub const NAME_FILTER: &str = "filter[name]";
pub const SOURCE_TYPE_ID_FILTER: &str = "filter[source_type_id]";
pub const SOURCE_REF_FILTER: &str = "filter[source_ref]";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to construct request for {what} from Sources API: {source}.")]
    Auth {
        what: &'static str,
        #[source]
        source: AuthError,
    },

    #[error("Failed request to Sources API for {what}: {source}.")]
    Request {
        what: &'static str,
        #[source]
        source: HttpError,
    },

    #[error("Failed to parse {what} response from Sources API: {source}.")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to obtain the source type ID for OpenShift: the openshift source type was not found, response count was {0}.")]
    SourceTypeNotFound(usize),

    #[error("Failed to obtain the application type ID for Cost Management: the cost management application type was not found, response count was {0}.")]
    ApplicationTypeNotFound(usize),

    #[error("No OpenShift source registered with name {name} and Cluster ID {cluster_id}.")]
    NotRegistered { name: String, cluster_id: String },

    #[error("This cluster may already be registered because an OpenShift source with Cluster ID {cluster_id} is already registered with a different name ({name}).")]
    ClusterRegistered { cluster_id: String, name: String },

    #[error("A non-OpenShift source with name {0} is already registered. Source names must be unique.")]
    NameTakenByOtherType(String),

    #[error("An OpenShift source with name {name} is registered with a different cluster identifier of {source_ref}. Another cluster may already be registered with this name. Source names must be unique.")]
    NameTakenByOtherCluster { name: String, source_ref: String },
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    count: usize,
}

/// Paginated `{meta, data}` envelope
#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default)]
    meta: Meta,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl<T> Listing<T> {
    /// The single item, when exactly one matched
    fn single(self) -> Option<T> {
        if self.meta.count != 1 {
            return None;
        }
        self.data.into_iter().next()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TypeItem {
    #[serde(default)]
    id: String,
}

/// A source record as returned by the API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_type_id: String,
    #[serde(default)]
    pub source_ref: String,
}

/// Whether a source check should run this pass
pub fn source_check_due(
    spec: &SourceSpec,
    status: &SourceStatus,
    spec_changed: bool,
    now: DateTime<Utc>,
) -> bool {
    !spec.source_name.is_empty()
        && (spec_changed
            || should_run_at(spec.check_cycle, status.last_source_check_time, now, "source check"))
}

pub struct SourceRegistrar<'a> {
    auth: &'a AuthResolver,
    /// API URL joined with the sources path, ending in `/`
    root: String,
    spec: SourceSpec,
    cluster_id: String,
}

impl<'a> SourceRegistrar<'a> {
    pub fn new(auth: &'a AuthResolver, api_url: &str, spec: SourceSpec, cluster_id: &str) -> Self {
        let root = format!("{}{}", api_url.trim_end_matches('/'), spec.sources_api_path);
        Self {
            auth,
            root,
            spec,
            cluster_id: cluster_id.to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.root, endpoint)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        queries: &[(&str, &str)],
        what: &'static str,
    ) -> Result<Listing<T>, SourceError> {
        let request = self
            .auth
            .client()
            .get(self.url(endpoint))
            .query(queries);
        let request = self
            .auth
            .decorate(request)
            .map_err(|source| SourceError::Auth { what, source })?;

        info!(endpoint = %endpoint, "GET request to sources API");
        let body = self.execute(request, what).await?;
        serde_json::from_str(&body).map_err(|source| SourceError::Parse { what, source })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
        what: &'static str,
    ) -> Result<T, SourceError> {
        let request = self.auth.client().post(self.url(endpoint)).json(body);
        let request = self
            .auth
            .decorate(request)
            .map_err(|source| SourceError::Auth { what, source })?;

        info!(endpoint = %endpoint, "POST request to sources API");
        let body = self.execute(request, what).await?;
        serde_json::from_str(&body).map_err(|source| SourceError::Parse { what, source })
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        what: &'static str,
    ) -> Result<String, SourceError> {
        let response = http::send(request)
            .await
            .map_err(|source| SourceError::Request { what, source })?;
        info!(status = %response.status_line(), "Sources API response");
        http::process_response(response)
            .map(|r| r.body)
            .map_err(|source| SourceError::Request { what, source })
    }

    /// ID of the `openshift` source type; anything but one match is fatal
    pub async fn source_type_id(&self) -> Result<String, SourceError> {
        let listing: Listing<TypeItem> = self
            .get(
                SOURCE_TYPES_ENDPOINT,
                &[(NAME_FILTER, OPENSHIFT_SOURCE_TYPE)],
                "OpenShift source type lookup",
            )
            .await?;
        let count = listing.meta.count;
        listing
            .single()
            .map(|t| t.id)
            .ok_or(SourceError::SourceTypeNotFound(count))
    }

    /// ID of the cost management application type
    pub async fn application_type_id(&self) -> Result<String, SourceError> {
        let listing: Listing<TypeItem> = self
            .get(
                APPLICATION_TYPES_ENDPOINT,
                &[(NAME_FILTER, COST_MANAGEMENT_APP_TYPE)],
                "application type lookup",
            )
            .await?;
        let count = listing.meta.count;
        listing
            .single()
            .map(|t| t.id)
            .ok_or(SourceError::ApplicationTypeNotFound(count))
    }

    /// Look up a source by any subset of filters; empty filters are omitted
    ///
    /// Only an exact single match counts as found.
    pub async fn find_source(
        &self,
        source_type_id: &str,
        name: &str,
        source_ref: &str,
    ) -> Result<Option<SourceItem>, SourceError> {
        let queries: Vec<(&str, &str)> = [
            (NAME_FILTER, name),
            (SOURCE_REF_FILTER, source_ref),
            (SOURCE_TYPE_ID_FILTER, source_type_id),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect();

        let listing: Listing<SourceItem> = self
            .get(SOURCES_ENDPOINT, &queries, "obtaining the OpenShift source")
            .await?;
        let found = listing.single();
        if found.is_none() {
            info!("Source does not exist");
        }
        Ok(found)
    }

    async fn create_source(&self, source_type_id: &str) -> Result<SourceItem, SourceError> {
        let app_type_id = self.application_type_id().await?;
        info!(application_type_id = %app_type_id, "Cost management application type");

        let source: SourceItem = self
            .post(
                SOURCES_ENDPOINT,
                &serde_json::json!({
                    "source_type_id": source_type_id,
                    "name": self.spec.source_name,
                    "source_ref": self.cluster_id,
                }),
                "creating the OpenShift source",
            )
            .await?;

        let _: serde_json::Value = self
            .post(
                APPLICATIONS_ENDPOINT,
                &serde_json::json!({
                    "source_id": source.id,
                    "application_type_id": app_type_id,
                }),
                "creating the OpenShift source with the Cost Management application",
            )
            .await?;
        Ok(source)
    }

    /// Confirm the source exists, creating it when configured to
    ///
    /// Returns whether the source is defined after the call.
    pub async fn get_or_create(&self) -> Result<bool, SourceError> {
        let name = self.spec.source_name.as_str();
        let cluster_id = self.cluster_id.as_str();

        let type_id = self.source_type_id().await?;
        info!(source_type_id = %type_id, "OpenShift source type");

        if self.find_source(&type_id, name, cluster_id).await?.is_some() {
            return Ok(true);
        }

        info!(create_source = self.spec.create_source, "Source not found");
        let not_registered = SourceError::NotRegistered {
            name: name.to_string(),
            cluster_id: cluster_id.to_string(),
        };
        if !self.spec.create_source {
            return Err(not_registered);
        }
        info!("{not_registered}");

        if let Some(existing) = self.find_source(&type_id, "", cluster_id).await? {
            return Err(SourceError::ClusterRegistered {
                cluster_id: cluster_id.to_string(),
                name: existing.name,
            });
        }

        if let Some(existing) = self.find_source("", name, "").await? {
            if existing.source_type_id != type_id {
                return Err(SourceError::NameTakenByOtherType(name.to_string()));
            }
            return Err(SourceError::NameTakenByOtherCluster {
                name: name.to_string(),
                source_ref: existing.source_ref,
            });
        }

        info!(name = %name, cluster_id = %cluster_id, "Attempting to create OpenShift source");
        self.create_source(&type_id).await?;
        Ok(true)
    }

    /// Run a gated source check and record the outcome in `status`
    ///
    /// Returns `None` when no check ran.
    pub async fn check_source(
        &self,
        status: &mut SourceStatus,
        spec_changed: bool,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        if !source_check_due(&self.spec, status, spec_changed, now) {
            return None;
        }

        status.source_name = self.spec.source_name.clone();
        status.source_error.clear();
        let defined = match self.get_or_create().await {
            Ok(defined) => defined,
            Err(e) => {
                warn!(error = %e, "Source get or create message");
                status.source_error = e.to_string();
                false
            }
        };
        status.source_defined = Some(defined);
        status.last_source_check_time = Some(now);
        Some(defined)
    }
}
