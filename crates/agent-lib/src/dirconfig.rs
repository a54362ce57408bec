//! On-disk layout of report, staging and upload directories
//!
//! ```text
//! <parent>/data/     per-class, per-month CSV reports
//! <parent>/staging/  CSVs and manifest.json while packaging
//! <parent>/upload/   tar.gz archives awaiting delivery
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// A single managed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub path: PathBuf,
}

impl Directory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("Failed to create directory {:?}", self.path))
    }

    /// Remove everything inside the directory, keeping the directory itself
    pub fn remove_contents(&self) -> Result<()> {
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("Failed to read directory {:?}", self.path))?
        {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .with_context(|| format!("Failed to remove {:?}", path))?;
        }
        Ok(())
    }

    /// File names in the directory, sorted
    pub fn files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("Failed to read directory {:?}", self.path))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Absolute paths of the files in the directory, sorted
    pub fn files_full_path(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .files()?
            .into_iter()
            .map(|name| self.path.join(name))
            .collect())
    }
}

/// Recreate any directory that has gone missing
pub fn check_exists_or_recreate(dirs: &[&Directory]) -> Result<()> {
    for dir in dirs {
        if !dir.exists() {
            info!(path = %dir.path.display(), "Recreating directory");
            dir.create()?;
        }
    }
    Ok(())
}

/// The full directory layout rooted at one parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    pub parent: Directory,
    pub reports: Directory,
    pub staging: Directory,
    pub upload: Directory,
}

impl DirectoryConfig {
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        let parent: PathBuf = parent.into();
        Self {
            reports: Directory::new(parent.join("data")),
            staging: Directory::new(parent.join("staging")),
            upload: Directory::new(parent.join("upload")),
            parent: Directory::new(parent),
        }
    }

    /// Create every directory in the layout
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.parent, &self.reports, &self.staging, &self.upload] {
            dir.create()?;
        }
        Ok(())
    }

    /// True when every directory in the layout exists
    pub fn check_config(&self) -> bool {
        [&self.parent, &self.reports, &self.staging, &self.upload]
            .iter()
            .all(|d| d.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let cfg = DirectoryConfig::new("/tmp/usage");
        assert_eq!(cfg.reports.path, PathBuf::from("/tmp/usage/data"));
        assert_eq!(cfg.staging.path, PathBuf::from("/tmp/usage/staging"));
        assert_eq!(cfg.upload.path, PathBuf::from("/tmp/usage/upload"));
    }

    #[test]
    fn test_ensure_and_check_config() {
        let temp_dir = TempDir::new().unwrap();
        let cfg = DirectoryConfig::new(temp_dir.path().join("reports"));
        assert!(!cfg.check_config());

        cfg.ensure().unwrap();
        assert!(cfg.check_config());

        fs::remove_dir_all(&cfg.staging.path).unwrap();
        assert!(!cfg.check_config());
        check_exists_or_recreate(&[&cfg.reports, &cfg.staging, &cfg.upload]).unwrap();
        assert!(cfg.check_config());
    }

    #[test]
    fn test_files_sorted_and_remove_contents() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Directory::new(temp_dir.path());
        fs::write(temp_dir.path().join("b.csv"), "b").unwrap();
        fs::write(temp_dir.path().join("a.csv"), "a").unwrap();
        fs::create_dir(temp_dir.path().join("nested")).unwrap();

        assert_eq!(dir.files().unwrap(), vec!["a.csv", "b.csv"]);
        assert_eq!(
            dir.files_full_path().unwrap()[0],
            temp_dir.path().join("a.csv")
        );

        dir.remove_contents().unwrap();
        assert!(dir.exists());
        assert!(fs::read_dir(temp_dir.path()).unwrap().next().is_none());
    }
}
