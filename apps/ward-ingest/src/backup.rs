//! Append-only CSV backup of raw observations and committed records. Best effort: callers log
//! failures and carry on.

use crate::error::BackupLogError;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackupFile {
    Raw,
    Ward,
    Patient,
}

impl BackupFile {
    pub fn file_name(self) -> &'static str {
        match self {
            BackupFile::Raw => "raw_sensor_data.csv",
            BackupFile::Ward => "ward_readings.csv",
            BackupFile::Patient => "patient_vitals.csv",
        }
    }

    pub fn header(self) -> &'static [&'static str] {
        match self {
            BackupFile::Raw => &["timestamp", "topic", "value"],
            BackupFile::Ward => &[
                "timestamp",
                "dht_temp",
                "lm35_temp",
                "humidity",
                "sound_level",
                "light_intensity",
            ],
            BackupFile::Patient => &["timestamp", "temperature", "heart_rate", "spo2"],
        }
    }
}

#[async_trait]
pub trait BackupLog: Send + Sync {
    async fn append_row(&self, file: BackupFile, fields: Vec<String>)
        -> Result<(), BackupLogError>;
}

/// Local wall-clock time, second resolution, matching what operators read in the CSVs.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Absent cells are written empty.
/// Whole numbers keep their trailing `.0` so rows match the existing sensor logs.
pub fn format_value(value: Option<f64>) -> String {
    value.map(|v| format!("{v:?}")).unwrap_or_default()
}

#[derive(Clone)]
pub struct CsvBackupLog {
    dir: PathBuf,
    write_guard: Arc<Mutex<()>>,
}

impl CsvBackupLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self, file: BackupFile) -> PathBuf {
        self.dir.join(file.file_name())
    }
}

fn append_blocking(path: &Path, file: BackupFile, fields: &[String]) -> Result<(), BackupLogError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let handle = OpenOptions::new().create(true).append(true).open(path)?;
    let needs_header = handle.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(handle);
    if needs_header {
        writer.write_record(file.header())?;
    }
    writer.write_record(fields)?;
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl BackupLog for CsvBackupLog {
    async fn append_row(
        &self,
        file: BackupFile,
        fields: Vec<String>,
    ) -> Result<(), BackupLogError> {
        let path = self.path(file);
        let guard = self.write_guard.clone();
        tokio::task::spawn_blocking(move || {
            // One writer at a time keeps the header check and the append together.
            let _lock = guard
                .lock()
                .map_err(|_| BackupLogError::Worker("backup write lock poisoned".to_string()))?;
            append_blocking(&path, file, &fields)
        })
        .await
        .map_err(|err| BackupLogError::Worker(err.to_string()))?
    }
}

/// Used when `WARD_INGEST_BACKUP_ENABLED=false`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledBackupLog;

#[async_trait]
impl BackupLog for DisabledBackupLog {
    async fn append_row(
        &self,
        _file: BackupFile,
        _fields: Vec<String>,
    ) -> Result<(), BackupLogError> {
        Ok(())
    }
}
