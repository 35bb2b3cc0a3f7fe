//! Result files and summary records.
//!
//! Each completed measurement is written to `<output_dir>/<sample>/<basename><suffix>`
//! where the basename is `<sample>_<type>_<contact id>_<measurement id>_<start time>`
//! and every path component is reduced to a safe character set.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::error::PqcResult;
use crate::measurement::MeasurementData;
use crate::sequence::ItemState;

static UNSAFE_CHARS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[^\w+\-.]+").ok());

/// Replace runs of characters outside `[A-Za-z0-9_+-.]` with `_`.
pub fn safe_filename(name: &str) -> String {
    match UNSAFE_CHARS.as_ref() {
        Some(re) => re.replace_all(name, "_").into_owned(),
        None => name.to_string(),
    }
}

/// Local time as `2024-05-02T14-03-11`, usable in file names.
pub fn iso_filename_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%dT%H-%M-%S")
        .to_string()
}

/// Local time as `2024-05-02T14:03:11` for meta data.
pub fn iso_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

/// One-line summary of a completed measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRecord {
    /// Start time of the measurement
    pub timestamp: DateTime<Utc>,
    /// Sample name
    pub sample_name: String,
    /// Sample type
    pub sample_type: String,
    /// Contact name
    pub contact_name: String,
    /// Measurement name
    pub measurement_name: String,
    /// Final state of the measurement
    pub measurement_state: ItemState,
}

/// Where the files of one measurement go.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultLocation {
    directory: PathBuf,
    basename: String,
}

impl ResultLocation {
    /// Location for a measurement started at `timestamp`.
    pub fn new(
        output_dir: &Path,
        sample_name: &str,
        sample_type: &str,
        contact_id: &str,
        measurement_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let basename = format!(
            "{}_{}_{}_{}_{}",
            sample_name.trim(),
            sample_type.trim(),
            contact_id,
            measurement_id,
            iso_filename_timestamp(timestamp)
        );
        Self {
            directory: output_dir.join(safe_filename(sample_name.trim())),
            basename,
        }
    }

    /// Sample directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Unsanitized basename.
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// File path with `suffix` (e.g. `.json`).
    pub fn filename(&self, suffix: &str) -> PathBuf {
        self.directory
            .join(safe_filename(&format!("{}{suffix}", self.basename)))
    }
}

/// Write the data as pretty JSON.
pub async fn write_json(path: &Path, data: &MeasurementData) -> PqcResult<()> {
    info!("Writing {}", path.display());
    let text = data.to_json()?;
    ensure_parent(path).await?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

/// Write the data as a plain-text table.
pub async fn write_txt(path: &Path, data: &MeasurementData) -> PqcResult<()> {
    info!("Writing {}", path.display());
    ensure_parent(path).await?;
    tokio::fs::write(path, data.to_txt()).await?;
    Ok(())
}

async fn ensure_parent(path: &Path) -> PqcResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
