//! Credential resolution and validation
//!
//! The resolver reads the configured credential kind from a [`SecretStore`],
//! validates it against the sources API when needed and decorates outgoing
//! requests. The last basic-auth validation is cached in a single slot so
//! frequent passes do not hammer the remote service.

mod secrets;

pub use secrets::{DirectorySecretStore, MemorySecretStore, SecretData, SecretError, SecretStore};

use crate::cycle::should_run;
use crate::http::{self, HttpError};
use crate::models::{AuthStatus, AuthType};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const PULL_SECRET_NAME: &str = "pull-secret";
pub const PULL_SECRET_KEY: &str = ".dockerconfigjson";
pub const PULL_SECRET_REGISTRY: &str = "cloud.openshift.com";

const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";
const CLIENT_ID_KEY: &str = "client_id";
const CLIENT_SECRET_KEY: &str = "client_secret";
const GRANT_TYPE: &str = "client_credentials";

const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no authentication secret name set when using {0} auth")]
    NoSecretName(AuthType),

    #[error("cluster authorization secret did not have data")]
    PullSecretEmpty,

    #[error("failed to parse cluster pull secret: {0}")]
    PullSecretFormat(#[source] serde_json::Error),

    #[error("cluster authorization token was not found in secret data")]
    TokenNotInSecret,

    #[error("cluster authorization token is not found")]
    TokenNotFound,

    #[error("cluster authorization token is not valid: contains newlines")]
    TokenContainsNewlines,

    #[error("secret not found with expected {0} data")]
    BasicKeyMissing(&'static str),

    #[error("service account secret not found with expected {0} data")]
    ServiceAccountKeyMissing(&'static str),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("status: {status}, error: {error}, description: {description}")]
    TokenExchange {
        status: u16,
        error: String,
        description: String,
    },

    #[error("status: {status}, failed to unmarshal error response: {source}")]
    TokenExchangeBody {
        status: u16,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to unmarshal token response: {0}")]
    TokenResponse(#[source] serde_json::Error),

    #[error("failed to make HTTP request to acquire token: {0}")]
    TokenRequest(#[source] reqwest::Error),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("{0}")]
    PreviousValidation(String),

    #[error("credentials have not been resolved")]
    Unresolved,
}

/// Resolved credential material
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Basic {
        username: String,
        password: String,
    },
    ServiceAccount {
        client_id: String,
        client_secret: String,
        access_token: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token(_) => write!(f, "Token(***)"),
            Credentials::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Credentials::ServiceAccount { client_id, .. } => {
                write!(f, "ServiceAccount({client_id}, ***)")
            }
        }
    }
}

/// Outcome of the last basic-auth validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRecord {
    pub secret_name: String,
    pub username: String,
    pub password: String,
    /// Empty when the credentials were accepted
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Resolver settings
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub auth_type: AuthType,
    /// Secret holding basic or service-account credentials
    pub secret_name: Option<String>,
    /// OAuth token endpoint for service-account exchange
    pub token_url: String,
    pub cluster_id: String,
    pub operator_commit: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: AuthType::Token,
            secret_name: None,
            token_url: "https://sso.redhat.com/auth/realms/redhat-external/protocol/openid-connect/token".to_string(),
            cluster_id: String::new(),
            operator_commit: String::new(),
        }
    }
}

#[derive(Deserialize)]
struct PullSecret {
    #[serde(default)]
    auths: HashMap<String, PullSecretAuth>,
}

#[derive(Deserialize)]
struct PullSecretAuth {
    #[serde(default)]
    auth: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

fn lowercase_keys(data: SecretData) -> HashMap<String, String> {
    data.into_iter()
        .map(|(k, v)| (k.to_lowercase(), String::from_utf8_lossy(&v).into_owned()))
        .collect()
}

fn required<E>(
    keys: &HashMap<String, String>,
    key: &'static str,
    missing: impl Fn(&'static str) -> E,
) -> Result<String, E> {
    match keys.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(missing(key)),
    }
}

/// Extract the bearer token for [`PULL_SECRET_REGISTRY`] from a pull secret
pub fn token_from_pull_secret(data: &SecretData) -> Result<String, AuthError> {
    let encoded = data
        .get(PULL_SECRET_KEY)
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::PullSecretEmpty)?;
    let secret: PullSecret = serde_json::from_slice(encoded).map_err(AuthError::PullSecretFormat)?;
    let auth = secret
        .auths
        .get(PULL_SECRET_REGISTRY)
        .ok_or(AuthError::TokenNotInSecret)?;

    let token = auth.auth.trim();
    if token.contains('\n') || token.contains('\r') {
        return Err(AuthError::TokenContainsNewlines);
    }
    if token.is_empty() {
        return Err(AuthError::TokenNotFound);
    }
    Ok(token.to_string())
}

pub struct AuthResolver {
    config: AuthConfig,
    store: Arc<dyn SecretStore>,
    client: Client,
    credentials: Option<Credentials>,
    validation: Option<ValidationRecord>,
}

impl AuthResolver {
    pub fn new(config: AuthConfig, store: Arc<dyn SecretStore>, client: Client) -> Self {
        Self {
            config,
            store,
            client,
            credentials: None,
            validation: None,
        }
    }

    pub fn auth_type(&self) -> AuthType {
        self.config.auth_type
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn validation(&self) -> Option<&ValidationRecord> {
        self.validation.as_ref()
    }

    /// Replace settings; a different secret name drops the cached validation
    pub fn reconfigure(&mut self, config: AuthConfig) {
        if config.secret_name != self.config.secret_name || config.auth_type != self.config.auth_type {
            self.validation = None;
            self.credentials = None;
        }
        self.config = config;
    }

    /// Drop the cached validation so the next check goes to the network
    pub fn force_revalidation(&mut self) {
        self.validation = None;
    }

    fn secret_name(&self) -> Result<String, AuthError> {
        self.config
            .secret_name
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::NoSecretName(self.config.auth_type))
    }

    async fn read_credentials(&self) -> Result<Credentials, AuthError> {
        match self.config.auth_type {
            AuthType::Token => {
                let data = self.store.get(PULL_SECRET_NAME).await?;
                let token = token_from_pull_secret(&data)?;
                info!("Found cloud.openshift.com token");
                Ok(Credentials::Token(token))
            }
            AuthType::Basic => {
                let keys = lowercase_keys(self.store.get(&self.secret_name()?).await?);
                Ok(Credentials::Basic {
                    username: required(&keys, USERNAME_KEY, AuthError::BasicKeyMissing)?,
                    password: required(&keys, PASSWORD_KEY, AuthError::BasicKeyMissing)?,
                })
            }
            AuthType::ServiceAccount => {
                let keys = lowercase_keys(self.store.get(&self.secret_name()?).await?);
                Ok(Credentials::ServiceAccount {
                    client_id: required(&keys, CLIENT_ID_KEY, AuthError::ServiceAccountKeyMissing)?,
                    client_secret: required(
                        &keys,
                        CLIENT_SECRET_KEY,
                        AuthError::ServiceAccountKeyMissing,
                    )?,
                    access_token: None,
                })
            }
        }
    }

    /// Load credentials for the configured kind and reflect the result in `status`
    pub async fn resolve(&mut self, status: &mut AuthStatus) -> Result<(), AuthError> {
        status.auth_type = self.config.auth_type;
        status.credentials_found = Some(true);

        if self.config.auth_type == AuthType::Token {
            status.valid_basic_auth = None;
            status.error_message.clear();
            status.last_verification_time = None;
        }
        if self.config.auth_type == AuthType::ServiceAccount {
            status.valid_basic_auth = None;
            status.last_verification_time = None;
        }

        match self.read_credentials().await {
            Ok(credentials) => {
                // keep a previously exchanged access token for the same client
                let credentials = match (credentials, self.credentials.take()) {
                    (
                        Credentials::ServiceAccount {
                            client_id,
                            client_secret,
                            ..
                        },
                        Some(Credentials::ServiceAccount {
                            client_id: old_id,
                            client_secret: old_secret,
                            access_token,
                        }),
                    ) if client_id == old_id && client_secret == old_secret => {
                        Credentials::ServiceAccount {
                            client_id,
                            client_secret,
                            access_token,
                        }
                    }
                    (credentials, _) => credentials,
                };
                self.credentials = Some(credentials);
                Ok(())
            }
            Err(e) => {
                warn!(auth_type = %self.config.auth_type, error = %e, "Failed to obtain credentials");
                self.credentials = None;
                status.credentials_found = Some(false);
                status.error_message = e.to_string();
                if self.config.auth_type == AuthType::Basic || matches!(e, AuthError::NoSecretName(_)) {
                    status.valid_basic_auth = Some(false);
                }
                Err(e)
            }
        }
    }

    /// Exchange client credentials for an access token
    pub async fn refresh_access_token(&mut self) -> Result<(), AuthError> {
        let Some(Credentials::ServiceAccount {
            client_id,
            client_secret,
            access_token,
        }) = self.credentials.as_mut()
        else {
            return Ok(());
        };

        info!("Requesting service-account access token");
        let response = self
            .client
            .post(&self.config.token_url)
            .timeout(TOKEN_EXCHANGE_TIMEOUT)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", GRANT_TYPE),
            ])
            .send()
            .await
            .map_err(AuthError::TokenRequest)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(AuthError::TokenRequest)?;
        if status != 200 {
            let parsed: TokenErrorResponse = serde_json::from_slice(&body)
                .map_err(|source| AuthError::TokenExchangeBody { status, source })?;
            return Err(AuthError::TokenExchange {
                status,
                error: parsed.error,
                description: parsed.error_description,
            });
        }

        let parsed: TokenResponse =
            serde_json::from_slice(&body).map_err(AuthError::TokenResponse)?;
        *access_token = Some(parsed.access_token);
        info!("Retrieved service-account access token");
        Ok(())
    }

    /// Confirm the credentials work
    ///
    /// Token auth needs no check. Service accounts refresh their access
    /// token. Basic credentials are checked with a `GET` on `sources_url`
    /// unless the cached record covers the same secret and credentials and
    /// `cycle_minutes` has not elapsed; a cycle of 0 always re-checks.
    pub async fn validate_credentials(
        &mut self,
        sources_url: &str,
        cycle_minutes: i64,
        status: &mut AuthStatus,
    ) -> Result<(), AuthError> {
        match self.config.auth_type {
            AuthType::Token => Ok(()),
            AuthType::ServiceAccount => match self.refresh_access_token().await {
                Ok(()) => {
                    status.error_message.clear();
                    Ok(())
                }
                Err(e) => {
                    status.error_message = format!("failed to obtain service-account token: {e}");
                    Err(e)
                }
            },
            AuthType::Basic => self.validate_basic(sources_url, cycle_minutes, status).await,
        }
    }

    async fn validate_basic(
        &mut self,
        sources_url: &str,
        cycle_minutes: i64,
        status: &mut AuthStatus,
    ) -> Result<(), AuthError> {
        let Some(Credentials::Basic { username, password }) = self.credentials.clone() else {
            return Err(AuthError::Unresolved);
        };
        let secret_name = self.secret_name()?;

        if let Some(record) = &self.validation {
            let same = record.secret_name == secret_name
                && record.username == username
                && record.password == password;
            if same && !should_run(cycle_minutes, Some(record.timestamp), "credential verification")
            {
                status.valid_basic_auth = Some(record.error.is_empty());
                if record.error.is_empty() {
                    return Ok(());
                }
                status.error_message = record.error.clone();
                return Err(AuthError::PreviousValidation(record.error.clone()));
            }
        }

        info!("Validating credentials");
        let result = http::send(self.decorate(self.client.get(sources_url))?)
            .await
            .and_then(http::process_response);

        let now = Utc::now();
        status.last_verification_time = Some(now);
        let error = match &result {
            Ok(_) => String::new(),
            Err(e) if e.status_code() == Some(401) => format!(
                "credentials are invalid. Correct the username/password in `{secret_name}`. \
                 Updated credentials will be re-verified during the next reconciliation."
            ),
            Err(e) => e.to_string(),
        };
        self.validation = Some(ValidationRecord {
            secret_name,
            username,
            password,
            error: error.clone(),
            timestamp: now,
        });

        match result {
            Ok(_) => {
                info!("Credentials are valid");
                status.error_message.clear();
                status.valid_basic_auth = Some(true);
                Ok(())
            }
            Err(e) => {
                warn!(error = %error, "Credential validation failed");
                status.error_message = error;
                if e.status_code() == Some(401) {
                    status.valid_basic_auth = Some(false);
                }
                Err(e.into())
            }
        }
    }

    /// Attach credentials and identifying headers to a request
    pub fn decorate(&self, request: RequestBuilder) -> Result<RequestBuilder, AuthError> {
        match self.credentials.as_ref().ok_or(AuthError::Unresolved)? {
            Credentials::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password)))
            }
            Credentials::ServiceAccount { access_token, .. } => {
                let token = access_token.as_deref().ok_or(AuthError::Unresolved)?;
                Ok(request.bearer_auth(token))
            }
            Credentials::Token(token) => Ok(request.bearer_auth(token).header(
                reqwest::header::USER_AGENT,
                format!(
                    "cost-mgmt-operator/{} cluster/{}",
                    self.config.operator_commit, self.config.cluster_id
                ),
            )),
        }
    }
}
