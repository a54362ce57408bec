//! Size-bounded splitting of staged CSV reports

use super::PackagingError;
use crate::collector::encode_line;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// True when any file, or the running total, reaches `max_bytes`
pub fn need_split(sizes: &[u64], max_bytes: u64) -> bool {
    let mut total = 0u64;
    for size in sizes {
        total += size;
        if *size >= max_bytes || total >= max_bytes {
            return true;
        }
    }
    false
}

/// Estimated on-disk size of one encoded line, terminator included
pub fn estimate_line_size(line: &str, variance: f64) -> u64 {
    let len = line.len() as f64;
    (len + 1.0 + (len * variance).ceil()) as u64
}

struct Part {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    rows: usize,
}

impl Part {
    fn create(path: PathBuf, header: &str, variance: f64) -> Result<Self, PackagingError> {
        info!(file = %path.display(), "Creating file");
        let file = File::create(&path).map_err(PackagingError::io(format!("create {path:?}")))?;
        let mut part = Self {
            path,
            writer: BufWriter::new(file),
            size: 0,
            rows: 0,
        };
        part.write_line(header, variance)?;
        part.rows = 0;
        Ok(part)
    }

    fn write_line(&mut self, line: &str, variance: f64) -> Result<(), PackagingError> {
        writeln!(self.writer, "{line}")
            .map_err(PackagingError::io(format!("write {:?}", self.path)))?;
        self.size += estimate_line_size(line, variance);
        self.rows += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf, PackagingError> {
        self.writer
            .flush()
            .map_err(PackagingError::io(format!("flush {:?}", self.path)))?;
        Ok(self.path)
    }
}

fn part_path(original: &Path, number: usize) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    original.with_file_name(format!("{stem}{number}.csv"))
}

/// Split `path` into `<stem>1.csv`, `<stem>2.csv`, ... and remove the original
///
/// Every part starts with the header. A part rolls over before a row would
/// push its estimated size past `max_bytes`, so no part exceeds the limit
/// unless a single row does. Once `max_splits` parts exist the remaining rows
/// go into the last one.
pub fn split_file(
    path: &Path,
    max_bytes: u64,
    variance: f64,
    max_splits: usize,
) -> Result<Vec<PathBuf>, PackagingError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    let header_line = encode_line(&header)?;

    let mut finished = Vec::new();
    let mut number = 1;
    let mut current = Part::create(part_path(path, number), &header_line, variance)?;

    for record in reader.records() {
        let fields: Vec<String> = record?.iter().map(String::from).collect();
        let line = encode_line(&fields)?;
        let estimate = estimate_line_size(&line, variance);

        let can_roll = number < max_splits.max(1);
        if current.rows > 0 && current.size + estimate > max_bytes && can_roll {
            finished.push(current.finish()?);
            number += 1;
            current = Part::create(part_path(path, number), &header_line, variance)?;
        }
        current.write_line(&line, variance)?;
    }
    finished.push(current.finish()?);

    fs::remove_file(path).map_err(PackagingError::io(format!("remove {path:?}")))?;
    Ok(finished)
}
