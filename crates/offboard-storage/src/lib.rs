//! Durable pipeline state: the CSV roster/artifact pair plus per-stage logs.
//!
//! Every stage reads one CSV, appends to a handful of categorized log files,
//! and drops a JSON run report. Writes are flushed row by row so a killed
//! run leaves a usable prefix behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use offboard_core::UserRecord;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "offboard-storage";

/// Fixed artifact schema shared by all three stages.
pub const ARTIFACT_HEADER: [&str; 3] = ["Email", "Port Name", "Auth0 ID"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("input file {0} does not exist")]
    MissingInput(PathBuf),
    #[error("input file {0} has no data rows")]
    EmptyInput(PathBuf),
    #[error("{path}: unrecognized header {found:?}")]
    BadHeader { path: PathBuf, found: Vec<String> },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One line of operator input: an email plus an optional display-name hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub email: String,
    pub name_hint: String,
}

/// Reads the operator-supplied roster.
///
/// Accepts either the bare two-column input (`Email,Port Name`) or a full
/// artifact, so a previous run's output can be fed straight back in. Rows
/// whose email is empty after trimming are dropped.
pub fn read_roster(path: &Path) -> Result<Vec<RosterEntry>, StorageError> {
    let mut reader = open_csv(path, 1)?;
    let mut entries = Vec::new();
    for result in reader.records() {
        let row = result?;
        let email = row.get(0).unwrap_or("").trim();
        if email.is_empty() {
            continue;
        }
        entries.push(RosterEntry {
            email: email.to_string(),
            name_hint: row.get(1).unwrap_or("").trim().to_string(),
        });
    }
    if entries.is_empty() {
        return Err(StorageError::EmptyInput(path.to_path_buf()));
    }
    debug!(path = %path.display(), rows = entries.len(), "roster loaded");
    Ok(entries)
}

/// Reads the resolve stage's artifact back into records.
///
/// An empty third column maps to `provider_id: None`: the user was not
/// found in the identity provider.
pub fn read_artifact(path: &Path) -> Result<Vec<UserRecord>, StorageError> {
    let mut reader = open_csv(path, ARTIFACT_HEADER.len())?;
    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let email = row.get(0).unwrap_or("").trim();
        if email.is_empty() {
            continue;
        }
        let provider_id = row.get(2).unwrap_or("").trim();
        records.push(UserRecord {
            email: email.to_string(),
            display_name: row.get(1).unwrap_or("").trim().to_string(),
            provider_id: (!provider_id.is_empty()).then(|| provider_id.to_string()),
        });
    }
    if records.is_empty() {
        return Err(StorageError::EmptyInput(path.to_path_buf()));
    }
    debug!(path = %path.display(), rows = records.len(), "artifact loaded");
    Ok(records)
}

fn open_csv(path: &Path, min_columns: usize) -> Result<csv::Reader<File>, StorageError> {
    if !path.exists() {
        return Err(StorageError::MissingInput(path.to_path_buf()));
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let first = headers
        .get(0)
        .unwrap_or("")
        .trim_start_matches('\u{feff}')
        .trim();
    if !first.eq_ignore_ascii_case(ARTIFACT_HEADER[0]) || headers.len() < min_columns {
        return Err(StorageError::BadHeader {
            path: path.to_path_buf(),
            found: headers.iter().map(str::to_string).collect(),
        });
    }
    Ok(reader)
}

/// Incremental writer for the pipeline artifact.
///
/// The header goes out at creation and each appended row is flushed, which
/// keeps the invariant that every processed input has exactly one artifact
/// row even if the process dies mid-batch.
pub struct ArtifactWriter {
    writer: csv::Writer<File>,
}

impl ArtifactWriter {
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_writer(File::create(path)?);
        writer.write_record(ARTIFACT_HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn append(&mut self, record: &UserRecord) -> Result<(), StorageError> {
        self.writer.write_record([
            record.email.as_str(),
            record.display_name.as_str(),
            record.provider_id.as_deref().unwrap_or(""),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

/// One categorized, append-only log file.
///
/// Created with truncation at stage start: logs describe the most recent run
/// only. Each line is prefixed with an RFC 3339 UTC timestamp and flushed.
pub struct StageLog {
    path: PathBuf,
    file: File,
}

impl StageLog {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, message: &str) -> Result<(), StorageError> {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writeln!(self.file, "{stamp} {message}")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Writes `<stage>_report.json` with the stage's summary for audit tooling.
pub fn write_run_report<T: Serialize>(
    dir: &Path,
    stage: &str,
    summary: &T,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{stage}_report.json"));
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run report")?;
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
