//! gzip-tar archive construction and inspection

use super::manifest::{Manifest, MANIFEST_FILE};
use super::PackagingError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

/// One file to place in an archive under its upload name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub upload_name: String,
    pub path: PathBuf,
}

/// Write `entries` plus the manifest to `tmp_path`, then rename into `dest`
///
/// `dest` only appears once the archive is complete.
pub fn write_archive(
    tmp_path: &Path,
    dest: &Path,
    entries: &[ArchiveEntry],
    manifest_path: &Path,
) -> Result<(), PackagingError> {
    let file = File::create(tmp_path)
        .map_err(PackagingError::io(format!("create archive {tmp_path:?}")))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    for entry in entries {
        info!(file = %entry.path.display(), name = %entry.upload_name, "Adding file to tar.gz");
        builder
            .append_path_with_name(&entry.path, &entry.upload_name)
            .map_err(PackagingError::io(format!("add {:?} to archive", entry.path)))?;
    }
    builder
        .append_path_with_name(manifest_path, MANIFEST_FILE)
        .map_err(PackagingError::io("add manifest to archive".to_string()))?;

    let encoder = builder
        .into_inner()
        .map_err(PackagingError::io("finish tar stream".to_string()))?;
    let file = encoder
        .finish()
        .map_err(PackagingError::io("finish gzip stream".to_string()))?;
    file.sync_all()
        .map_err(PackagingError::io(format!("sync archive {tmp_path:?}")))?;

    fs::rename(tmp_path, dest)
        .map_err(PackagingError::io(format!("move archive to {dest:?}")))?;
    Ok(())
}

/// Read the embedded manifest back out of an archive
pub fn read_manifest(archive_path: &Path) -> Result<Manifest, PackagingError> {
    let file = File::open(archive_path)
        .map_err(PackagingError::io(format!("open archive {archive_path:?}")))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let entries = archive
        .entries()
        .map_err(PackagingError::io(format!("read archive {archive_path:?}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(PackagingError::io(format!("read archive {archive_path:?}")))?;
        let is_manifest = entry
            .path()
            .map(|p| p.as_os_str() == MANIFEST_FILE)
            .unwrap_or(false);
        if is_manifest {
            let mut body = Vec::new();
            entry
                .read_to_end(&mut body)
                .map_err(PackagingError::io(format!("read manifest from {archive_path:?}")))?;
            return Manifest::parse(&body);
        }
    }
    Err(PackagingError::MissingManifest(archive_path.to_path_buf()))
}

/// Names of every entry in an archive
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>, PackagingError> {
    let file = File::open(archive_path)
        .map_err(PackagingError::io(format!("open archive {archive_path:?}")))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut names = Vec::new();
    for entry in archive
        .entries()
        .map_err(PackagingError::io(format!("read archive {archive_path:?}")))?
    {
        let entry = entry.map_err(PackagingError::io(format!("read archive {archive_path:?}")))?;
        if let Ok(path) = entry.path() {
            names.push(path.to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_archive_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let csv_path = temp_dir.path().join("report.csv");
        fs::write(&csv_path, "a,b\n1,2\n").unwrap();

        let manifest = Manifest {
            uuid: "u".into(),
            cluster_id: "c".into(),
            version: "v".into(),
            date: Utc::now(),
            files: vec!["u_openshift_usage_report.0.csv".into()],
            start: None,
            end: None,
            certified: false,
            daily_reports: true,
        };
        let manifest_path = temp_dir.path().join(MANIFEST_FILE);
        manifest.write(&manifest_path).unwrap();

        let tmp = temp_dir.path().join("out.tar.gz.tmp");
        let dest = temp_dir.path().join("out.tar.gz");
        write_archive(
            &tmp,
            &dest,
            &[ArchiveEntry {
                upload_name: "u_openshift_usage_report.0.csv".into(),
                path: csv_path,
            }],
            &manifest_path,
        )
        .unwrap();

        assert!(!tmp.exists());
        assert_eq!(read_manifest(&dest).unwrap(), manifest);
        assert_eq!(
            list_entries(&dest).unwrap(),
            vec!["u_openshift_usage_report.0.csv", MANIFEST_FILE]
        );
    }

    #[test]
    fn test_missing_manifest_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.tar.gz");
        let file = File::create(&path).unwrap();
        let builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.into_inner().unwrap().finish().unwrap();

        assert!(matches!(
            read_manifest(&path),
            Err(PackagingError::MissingManifest(_))
        ));
    }
}
