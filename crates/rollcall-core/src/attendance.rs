//! Attendance sink: append-only CSV log, one row per MarkEvent.

use crate::session::MarkEvent;
use crate::types::confidence_percent;
use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize, Serializer};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("attendance store {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// One persisted attendance row. Column order is the on-disk order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub session_id: String,
    pub identity: String,
    pub subject: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// Percentage in [0, 100], two decimals.
    #[serde(serialize_with = "two_decimals")]
    pub confidence: f64,
}

impl From<&MarkEvent> for AttendanceRecord {
    fn from(event: &MarkEvent) -> Self {
        let local = event.timestamp.naive_local();
        Self {
            session_id: event.session_id.clone(),
            identity: event.label.clone(),
            subject: event.subject.clone(),
            date: local.date(),
            time: local.time().with_nanosecond(0).unwrap_or(local.time()),
            confidence: confidence_percent(event.confidence),
        }
    }
}

fn two_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.2}"))
}

/// Durable destination for mark events. Append is the only operation.
pub trait AttendanceSink {
    fn record(&mut self, event: &MarkEvent) -> Result<(), SinkError>;
}

/// In-memory sink.
impl AttendanceSink for Vec<AttendanceRecord> {
    fn record(&mut self, event: &MarkEvent) -> Result<(), SinkError> {
        self.push(AttendanceRecord::from(event));
        Ok(())
    }
}

/// Headerless CSV file, opened in append mode for every record.
#[derive(Debug, Clone)]
pub struct CsvAttendanceSink {
    path: PathBuf,
}

impl CsvAttendanceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl AttendanceSink for CsvAttendanceSink {
    fn record(&mut self, event: &MarkEvent) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.serialize(AttendanceRecord::from(event))?;
        writer.flush().map_err(|e| self.io_err(e))?;

        tracing::debug!(path = %self.path.display(), label = %event.label, "attendance row appended");
        Ok(())
    }
}

/// Read every row of an attendance file.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<AttendanceRecord>, SinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path.as_ref())?;
    reader
        .deserialize()
        .collect::<Result<Vec<AttendanceRecord>, csv::Error>>()
        .map_err(SinkError::from)
}
