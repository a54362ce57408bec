//! Read-only access to named secrets

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub type SecretData = HashMap<String, Vec<u8>>;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("failed to read secret {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source of key/value secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<SecretData, SecretError>;
}

/// Secrets mounted as `<root>/<name>/<key>` files
#[derive(Debug, Clone)]
pub struct DirectorySecretStore {
    root: PathBuf,
}

impl DirectorySecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SecretStore for DirectorySecretStore {
    async fn get(&self, name: &str) -> Result<SecretData, SecretError> {
        let dir = self.root.join(name);
        let io_err = |source| SecretError::Io {
            name: name.to_string(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(name.to_string()))
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut data = SecretData::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let key = entry.file_name().to_string_lossy().into_owned();
            // mounted secrets carry ..data bookkeeping entries; the keys
            // themselves are symlinks through ..data
            if key.starts_with("..") {
                continue;
            }
            let metadata = tokio::fs::metadata(entry.path()).await.map_err(io_err)?;
            if !metadata.is_file() {
                continue;
            }
            let value = tokio::fs::read(entry.path()).await.map_err(io_err)?;
            data.insert(key, value);
        }
        debug!(secret = %name, keys = data.len(), "Read secret");
        Ok(data)
    }
}

/// In-memory secrets, handy for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<String, SecretData>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, data: &[(&str, &str)]) -> Self {
        self.secrets.insert(
            name.to_string(),
            data.iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        );
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<SecretData, SecretError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_store_reads_keys() {
        let temp_dir = TempDir::new().unwrap();
        let secret_dir = temp_dir.path().join("creds");
        std::fs::create_dir_all(&secret_dir).unwrap();
        std::fs::write(secret_dir.join("username"), "user").unwrap();
        std::fs::write(secret_dir.join("Password"), "pass").unwrap();
        std::fs::create_dir(secret_dir.join("..data")).unwrap();

        let store = DirectorySecretStore::new(temp_dir.path());
        let data = store.get("creds").await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["username"], b"user");
        assert_eq!(data["Password"], b"pass");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_store_follows_mounted_symlinks() {
        use std::os::unix::fs::symlink;

        let temp_dir = TempDir::new().unwrap();
        let secret_dir = temp_dir.path().join("creds");
        let versioned = secret_dir.join("..2024_01_01_00_00_00.000000001");
        std::fs::create_dir_all(&versioned).unwrap();
        std::fs::write(versioned.join("username"), "user").unwrap();
        std::fs::write(versioned.join("password"), "pass").unwrap();
        symlink("..2024_01_01_00_00_00.000000001", secret_dir.join("..data")).unwrap();
        symlink("..data/username", secret_dir.join("username")).unwrap();
        symlink("..data/password", secret_dir.join("password")).unwrap();

        let store = DirectorySecretStore::new(temp_dir.path());
        let data = store.get("creds").await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["username"], b"user");
        assert_eq!(data["password"], b"pass");
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectorySecretStore::new(temp_dir.path());
        assert!(matches!(
            store.get("absent").await,
            Err(SecretError::NotFound(_))
        ));
        assert!(matches!(
            MemorySecretStore::new().get("absent").await,
            Err(SecretError::NotFound(_))
        ));
    }
}
