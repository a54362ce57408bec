//! Archive delivery to the ingestion endpoint
//!
//! Archives in the upload directory are posted one at a time as multipart
//! bodies. Only `202 Accepted` removes an archive; anything else leaves it
//! for the next cycle.

use crate::auth::{AuthError, AuthResolver};
use crate::cycle::should_run_at;
use crate::dirconfig::DirectoryConfig;
use crate::http::{self, HttpError};
use crate::models::UploadStatus;
use crate::packaging::{read_manifest, Manifest};
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const UPLOAD_CONTENT_TYPE: &str = "application/vnd.redhat.hccm.tar+tgz";

/// Upper bound (exclusive) of the generated pre-upload pause, in seconds
pub const MAX_UPLOAD_WAIT_SECS: u64 = 35;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read upload directory: {0:#}")]
    Directory(anyhow::Error),

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set multipart body and headers: {0}")]
    Multipart(#[source] reqwest::Error),

    #[error("could not setup the request: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Uploader settings
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// API URL joined with the ingress path
    pub ingress_url: String,
    /// Minutes between uploads
    pub cycle: i64,
    /// Fixed pre-upload pause; generated once when unset
    pub wait: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            ingress_url: "https://console.redhat.com/api/ingress/v1/upload".to_string(),
            cycle: 360,
            wait: None,
        }
    }
}

/// What happened during one upload pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// Archives accepted and removed
    pub uploaded: Vec<String>,
    /// Last status line seen, e.g. `202 Accepted`
    pub last_status: String,
    /// The ingestion endpoint rejected the credentials
    pub unauthorized: bool,
}

/// Time-derived value in `0..max`
pub fn rand_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    now % max
}

/// Settle the pre-upload pause: a configured value wins, otherwise the
/// persisted one, otherwise a fresh jitter that is then persisted
pub fn resolve_upload_wait(status: &mut UploadStatus, configured: Option<u64>) -> u64 {
    if let Some(wait) = configured {
        status.upload_wait = Some(wait);
    }
    *status
        .upload_wait
        .get_or_insert_with(|| rand_jitter(MAX_UPLOAD_WAIT_SECS))
}

pub struct Uploader<'a> {
    dirs: &'a DirectoryConfig,
    config: UploadConfig,
}

impl<'a> Uploader<'a> {
    pub fn new(dirs: &'a DirectoryConfig, config: UploadConfig) -> Self {
        Self { dirs, config }
    }

    /// Archives due for upload, or `None` when the cycle has not elapsed or
    /// the upload directory is empty
    pub fn pending_files(
        &self,
        status: &UploadStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<String>>, UploadError> {
        if !should_run_at(self.config.cycle, status.last_successful_upload_time, now, "upload") {
            return Ok(None);
        }
        let files = self.dirs.upload.files().map_err(UploadError::Directory)?;
        if files.is_empty() {
            info!("No files to upload");
            return Ok(None);
        }
        Ok(Some(files))
    }

    async fn multipart_body(&self, name: &str) -> Result<Form, UploadError> {
        let path = self.dirs.upload.path.join(name);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| UploadError::Read { path, source })?;
        let part = Part::bytes(data)
            .file_name(name.to_string())
            .mime_str(UPLOAD_CONTENT_TYPE)
            .map_err(UploadError::Multipart)?;
        Ok(Form::new().part("file", part))
    }

    /// Post each `tar.gz` in `files` and record the outcome in `status`
    ///
    /// A failed request is recorded in `status.upload_error` and ends the
    /// pass without an error; the remaining archives wait for the next cycle.
    pub async fn upload_files(
        &self,
        auth: &AuthResolver,
        status: &mut UploadStatus,
        files: &[String],
    ) -> Result<UploadSummary, UploadError> {
        let wait = resolve_upload_wait(status, self.config.wait);
        info!(files = %files.join(", "), "Files ready for upload");
        info!(seconds = wait, "Pausing before uploading");
        tokio::time::sleep(Duration::from_secs(wait)).await;

        let mut summary = UploadSummary::default();
        for file in files.iter().filter(|f| f.contains("tar.gz")) {
            let path = self.dirs.upload.path.join(file);
            let manifest = match read_manifest(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    error!(file = %file, error = %e, "Could not read file information from tar.gz");
                    continue;
                }
            };

            info!(file = %file, "Uploading file");
            let form = self.multipart_body(file).await?;
            let result = self.post(auth, form).await;

            record_payload(status, file, &manifest);
            match result {
                Ok((response, outcome)) => {
                    status.last_upload_status = response.status_line();
                    status.last_payload_request_id = response.request_id.clone();
                    summary.last_status = response.status_line();
                    log_response(file, &manifest, &response);

                    if let Err(e) = outcome {
                        error!(error = %e, "Upload failed");
                        status.upload_error = e.to_string();
                        break;
                    }
                    if response.status == StatusCode::ACCEPTED {
                        status.last_successful_upload_time = Some(Utc::now());
                        info!(file = %file, "Removing tar file since upload was successful");
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            error!(file = %file, error = %e, "Error removing tar file");
                        }
                        summary.uploaded.push(file.clone());
                    }
                }
                Err(e) => {
                    error!(error = %e, "Upload failed");
                    status.last_upload_status.clear();
                    status.last_payload_request_id.clear();
                    status.upload_error = e.to_string();
                    break;
                }
            }
        }

        summary.unauthorized = status.last_upload_status.contains("401");
        Ok(summary)
    }

    async fn post(
        &self,
        auth: &AuthResolver,
        form: Form,
    ) -> Result<(http::HttpResponse, Result<(), HttpError>), UploadError> {
        let request = auth.decorate(auth.client().post(&self.config.ingress_url).multipart(form))?;
        let response = http::send(request).await?;
        let outcome = http::process_response(response.clone()).map(|_| ());
        Ok((response, outcome))
    }
}

fn record_payload(status: &mut UploadStatus, file: &str, manifest: &Manifest) {
    status.last_payload_name = file.to_string();
    status.last_payload_files = manifest.files.clone();
    status.last_payload_manifest_id = manifest.uuid.clone();
    status.upload_error.clear();
}

fn log_response(file: &str, manifest: &Manifest, response: &http::HttpResponse) {
    if response.status.is_success() {
        info!(
            status = %response.status_line(),
            request_id = %response.request_id,
            file = %file,
            files = ?manifest.files,
            manifest_id = %manifest.uuid,
            cluster_id = %manifest.cluster_id,
            "Upload response"
        );
    } else {
        warn!(
            status = %response.status_line(),
            request_id = %response.request_id,
            file = %file,
            manifest_id = %manifest.uuid,
            "Upload rejected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, MemorySecretStore};
    use crate::http::{build_client, DEFAULT_TIMEOUT};
    use crate::models::{AuthStatus, AuthType, ClusterIdentity};
    use crate::packaging::{FilePackager, FilesAction, PackagingConfig};
    use mockito::Matcher;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup_archives(count: usize) -> (TempDir, DirectoryConfig, Vec<String>) {
        let temp_dir = TempDir::new().unwrap();
        let dirs = DirectoryConfig::new(temp_dir.path().join("usage"));
        dirs.ensure().unwrap();

        let identity = ClusterIdentity {
            cluster_id: "cluster-1".into(),
            version: "abc123".into(),
        };
        for _ in 0..count {
            std::fs::write(
                dirs.reports.path.join("cm-openshift-namespace-usage-202403.csv"),
                "report_period_start,namespace\na,shop\n",
            )
            .unwrap();
            FilePackager::new(&dirs, identity.clone(), PackagingConfig::default())
                .package_reports(FilesAction::Move, true)
                .unwrap();
            // keep archive timestamps distinct
            std::thread::sleep(Duration::from_millis(2));
        }
        let files = dirs.upload.files().unwrap();
        (temp_dir, dirs, files)
    }

    async fn basic_resolver() -> AuthResolver {
        let store = MemorySecretStore::new()
            .with_secret("creds", &[("username", "user"), ("password", "pass")]);
        let mut resolver = AuthResolver::new(
            AuthConfig {
                auth_type: AuthType::Basic,
                secret_name: Some("creds".into()),
                ..Default::default()
            },
            Arc::new(store),
            build_client(None, DEFAULT_TIMEOUT).unwrap(),
        );
        resolver.resolve(&mut AuthStatus::default()).await.unwrap();
        resolver
    }

    fn uploader(dirs: &DirectoryConfig, url: String) -> Uploader<'_> {
        Uploader::new(
            dirs,
            UploadConfig {
                ingress_url: url,
                cycle: 360,
                wait: Some(0),
            },
        )
    }

    #[test]
    fn test_rand_jitter() {
        assert!(rand_jitter(35) < 35);
        assert_eq!(rand_jitter(0), 0);
    }

    #[test]
    fn test_resolve_upload_wait() {
        let mut status = UploadStatus::default();
        let generated = resolve_upload_wait(&mut status, None);
        assert!(generated < MAX_UPLOAD_WAIT_SECS);
        assert_eq!(status.upload_wait, Some(generated));
        assert_eq!(resolve_upload_wait(&mut status, None), generated);

        assert_eq!(resolve_upload_wait(&mut status, Some(7)), 7);
        assert_eq!(status.upload_wait, Some(7));
    }

    #[test]
    fn test_pending_files_respects_cycle() {
        let (_temp_dir, dirs, files) = setup_archives(1);
        let uploader = uploader(&dirs, String::new());

        let now = Utc::now();
        let mut status = UploadStatus::default();
        assert_eq!(uploader.pending_files(&status, now).unwrap(), Some(files.clone()));

        status.last_successful_upload_time = Some(now);
        assert_eq!(uploader.pending_files(&status, now).unwrap(), None);

        let later = now + chrono::Duration::minutes(uploader.config.cycle);
        assert_eq!(uploader.pending_files(&status, later).unwrap(), Some(files));
    }

    #[test]
    fn test_pending_files_empty_directory() {
        let (_temp_dir, dirs, _) = setup_archives(0);
        let uploader = uploader(&dirs, String::new());
        assert_eq!(uploader.pending_files(&UploadStatus::default(), Utc::now()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_accepted_upload_removes_archive() {
        let (_temp_dir, dirs, files) = setup_archives(2);
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingress/v1/upload")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .match_header("content-type", Matcher::Regex("^multipart/form-data".into()))
            .with_status(202)
            .with_header(http::REQUEST_ID_HEADER, "req-1")
            .expect(2)
            .create_async()
            .await;

        let resolver = basic_resolver().await;
        let uploader = uploader(&dirs, format!("{}/api/ingress/v1/upload", server.url()));
        let mut status = UploadStatus::default();
        let summary = uploader
            .upload_files(&resolver, &mut status, &files)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(summary.uploaded, files);
        assert!(!summary.unauthorized);
        assert_eq!(status.last_upload_status, "202 Accepted");
        assert_eq!(status.last_payload_request_id, "req-1");
        assert_eq!(status.last_payload_name, files[1]);
        assert_eq!(status.last_payload_files.len(), 1);
        assert!(status.upload_error.is_empty());
        assert!(status.last_successful_upload_time.is_some());
        assert!(dirs.upload.files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_other_than_accepted_keeps_archive() {
        let (_temp_dir, dirs, files) = setup_archives(1);
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/upload")
            .with_status(200)
            .create_async()
            .await;

        let resolver = basic_resolver().await;
        let uploader = uploader(&dirs, format!("{}/upload", server.url()));
        let mut status = UploadStatus::default();
        let summary = uploader
            .upload_files(&resolver, &mut status, &files)
            .await
            .unwrap();

        assert!(summary.uploaded.is_empty());
        assert_eq!(status.last_upload_status, "200 OK");
        assert!(status.upload_error.is_empty());
        assert!(status.last_successful_upload_time.is_none());
        assert_eq!(dirs.upload.files().unwrap(), files);
    }

    #[tokio::test]
    async fn test_unauthorized_upload_stops_and_flags() {
        let (_temp_dir, dirs, files) = setup_archives(2);
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload")
            .with_status(401)
            .with_body("bad credentials")
            .expect(1)
            .create_async()
            .await;

        let resolver = basic_resolver().await;
        let uploader = uploader(&dirs, format!("{}/upload", server.url()));
        let mut status = UploadStatus::default();
        let summary = uploader
            .upload_files(&resolver, &mut status, &files)
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(summary.unauthorized);
        assert_eq!(status.last_upload_status, "401 Unauthorized");
        assert_eq!(
            status.upload_error,
            "status: 401 | error response: bad credentials"
        );
        assert_eq!(dirs.upload.files().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_archive_is_skipped() {
        let (_temp_dir, dirs, _) = setup_archives(0);
        std::fs::write(dirs.upload.path.join("broken.tar.gz"), "not an archive").unwrap();
        std::fs::write(dirs.upload.path.join("notes.txt"), "x").unwrap();

        let resolver = basic_resolver().await;
        let uploader = uploader(&dirs, "http://127.0.0.1:9/unused".into());
        let mut status = UploadStatus::default();
        let summary = uploader
            .upload_files(
                &resolver,
                &mut status,
                &["broken.tar.gz".to_string(), "notes.txt".to_string()],
            )
            .await
            .unwrap();

        assert!(summary.uploaded.is_empty());
        assert!(status.last_payload_name.is_empty());
        assert_eq!(dirs.upload.files().unwrap().len(), 2);
    }
}
