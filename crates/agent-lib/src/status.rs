//! Persistence of [`AgentStatus`] between passes
//!
//! The status file carries the cycle timestamps; losing it only means the
//! next pass treats every gated activity as due.

use crate::models::AgentStatus;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for `<parent>/status.json`
    pub fn in_dir(parent: &Path) -> Self {
        Self::new(parent.join(STATUS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved status; a missing file yields the default
    pub fn load(&self) -> Result<AgentStatus> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No saved status, starting fresh");
                return Ok(AgentStatus::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read status file {:?}", self.path))
            }
        };
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to deserialize status file {:?}", self.path))
    }

    /// Load, falling back to the default when the file is unreadable
    pub fn load_or_default(&self) -> AgentStatus {
        self.load().unwrap_or_else(|e| {
            warn!(error = %e, "Discarding unreadable status file");
            AgentStatus::default()
        })
    }

    /// Write the status atomically through a temp file
    pub fn save(&self, status: &AgentStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let json = serde_json::to_vec_pretty(status).context("Failed to serialize status")?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&json).context("Failed to write status data")?;
        file.sync_all().context("Failed to sync status file")?;

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, self.path))?;

        debug!(path = %self.path.display(), "Saved status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = StatusStore::in_dir(temp_dir.path());

        let mut status = AgentStatus::default();
        status.cluster_id = "cluster-1".into();
        status.upload.last_successful_upload_time = Some(Utc::now());
        status.upload.upload_wait = Some(12);
        status.packaging.packaging_error = "disk full".into();

        store.save(&status).unwrap();
        assert!(!temp_dir.path().join("status.tmp").exists());
        assert_eq!(store.load().unwrap(), status);
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let store = StatusStore::in_dir(temp_dir.path());
        assert_eq!(store.load().unwrap(), AgentStatus::default());
    }

    #[test]
    fn test_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = StatusStore::in_dir(temp_dir.path());
        std::fs::write(store.path(), "{not json").unwrap();

        assert!(store.load().is_err());
        assert_eq!(store.load_or_default(), AgentStatus::default());
    }
}
