use crate::backup::{BackupFile, BackupLog};
use crate::error::{BackupLogError, StoreError};
use crate::ingest::{PatientVitals, WardReading};
use crate::layout::EntityRef;
use crate::storage::RecordStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MemoryStore {
    entities: Mutex<HashSet<EntityRef>>,
    pub ward_readings: Mutex<Vec<(WardReading, DateTime<Utc>)>>,
    pub patient_vitals: Mutex<Vec<(PatientVitals, DateTime<Utc>)>>,
    pub fail_writes: AtomicBool,
    pub fail_lookups: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
    pub lookups: AtomicUsize,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn with_entities(entities: impl IntoIterator<Item = EntityRef>) -> Self {
        let store = Self::default();
        if let Ok(mut guard) = store.entities.lock() {
            guard.extend(entities);
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn ward_count(&self) -> usize {
        self.ward_readings.lock().unwrap().len()
    }

    pub fn patient_count(&self) -> usize {
        self.patient_vitals.lock().unwrap().len()
    }

    pub fn last_ward(&self) -> Option<WardReading> {
        self.ward_readings
            .lock()
            .unwrap()
            .last()
            .map(|(reading, _)| reading.clone())
    }

    pub fn last_patient(&self) -> Option<PatientVitals> {
        self.patient_vitals
            .lock()
            .unwrap()
            .last()
            .map(|(vitals, _)| vitals.clone())
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn write_gate(&self) -> Result<i64, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::new("connection refused"));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn entity_exists(&self, entity: EntityRef) -> Result<bool, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::new("connection refused"));
        }
        Ok(self.entities.lock().unwrap().contains(&entity))
    }

    async fn create_ward_reading(
        &self,
        reading: &WardReading,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.pause().await;
        let id = self.write_gate()?;
        self.ward_readings
            .lock()
            .unwrap()
            .push((reading.clone(), timestamp));
        Ok(id)
    }

    async fn create_patient_vitals(
        &self,
        vitals: &PatientVitals,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.pause().await;
        let id = self.write_gate()?;
        self.patient_vitals
            .lock()
            .unwrap()
            .push((vitals.clone(), timestamp));
        Ok(id)
    }
}

#[derive(Default)]
pub struct MemoryBackupLog {
    pub rows: Mutex<Vec<(BackupFile, Vec<String>)>>,
    pub fail: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
}

impl MemoryBackupLog {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn rows_for(&self, file: BackupFile) -> Vec<Vec<String>> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, _)| *f == file)
            .map(|(_, row)| row.clone())
            .collect()
    }
}

#[async_trait]
impl BackupLog for MemoryBackupLog {
    async fn append_row(
        &self,
        file: BackupFile,
        fields: Vec<String>,
    ) -> Result<(), BackupLogError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackupLogError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            )));
        }
        self.rows.lock().unwrap().push((file, fields));
        Ok(())
    }
}
