use super::cache::AggregationCache;
use super::stats::IngestStats;
use super::types::{CompletedRecord, PersistenceOutcome, RecordPayload};
use crate::backup::{format_timestamp, format_value, BackupFile, BackupLog};
use crate::error::{BackupLogError, CommitError, ErrorClass};
use crate::layout::EntityRef;
use crate::storage::RecordStore;
use crate::telemetry::RawObservation;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Turns completed records into stored rows. Owns the only path that clears cache slots, and
/// only after the store acknowledged the write.
pub struct PersistenceCoordinator {
    store: Arc<dyn RecordStore>,
    backup: Arc<dyn BackupLog>,
    timeout: Duration,
    known_entities: HashSet<EntityRef>,
    stats: Arc<IngestStats>,
}

async fn bounded<T, E, F>(timeout: Duration, fut: F) -> Result<T, CommitError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<CommitError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(CommitError::Timeout(timeout)),
    }
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        backup: Arc<dyn BackupLog>,
        timeout: Duration,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            store,
            backup,
            timeout,
            known_entities: HashSet::new(),
            stats,
        }
    }

    /// Positive lookups are remembered; a missing entity is asked about again next time so
    /// a ward created while we run starts accepting records without a restart.
    async fn ensure_entity(&mut self, entity: EntityRef) -> Result<(), CommitError> {
        if self.known_entities.contains(&entity) {
            return Ok(());
        }
        let exists = bounded(self.timeout, self.store.entity_exists(entity)).await?;
        if !exists {
            return Err(CommitError::MissingEntity { entity });
        }
        self.known_entities.insert(entity);
        Ok(())
    }

    async fn persist(&mut self, record: &CompletedRecord) -> Result<i64, CommitError> {
        self.ensure_entity(record.payload.entity()).await?;
        match &record.payload {
            RecordPayload::Ward(reading) => {
                bounded(
                    self.timeout,
                    self.store.create_ward_reading(reading, record.stamped_at),
                )
                .await
            }
            RecordPayload::Patient(vitals) => {
                bounded(
                    self.timeout,
                    self.store.create_patient_vitals(vitals, record.stamped_at),
                )
                .await
            }
        }
    }

    async fn append_backup(&self, file: BackupFile, fields: Vec<String>) {
        let appended = match tokio::time::timeout(self.timeout, self.backup.append_row(file, fields))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BackupLogError::Timeout(self.timeout)),
        };
        if let Err(err) = appended {
            IngestStats::incr(&self.stats.backup_failures);
            tracing::warn!(
                error = %err,
                class = err.class().as_str(),
                file = file.file_name(),
                "backup log append failed"
            );
        }
    }

    /// Raw log of every routed, decoded observation. Never affects the pipeline.
    pub async fn log_raw(&self, observation: &RawObservation) {
        let fields = vec![
            format_timestamp(observation.received_at),
            observation.topic.clone(),
            format_value(Some(observation.value)),
        ];
        self.append_backup(BackupFile::Raw, fields).await;
    }

    /// Store, then back up, then clear the consumed slots. On any storage failure the cache is
    /// left untouched so the group is retried on its next update.
    pub async fn commit(
        &mut self,
        record: CompletedRecord,
        cache: &mut AggregationCache,
    ) -> PersistenceOutcome {
        let entity = record.payload.entity();
        let kind = record.payload.kind();

        let record_id = match self.persist(&record).await {
            Ok(id) => id,
            Err(err) => {
                IngestStats::incr(&self.stats.commit_failures);
                self.stats.record_error(err.to_string());
                let class = err.class();
                if class == ErrorClass::Configuration {
                    tracing::error!(
                        error = %err,
                        class = class.as_str(),
                        group = %record.group,
                        kind = kind.as_str(),
                        "record skipped; cache retained"
                    );
                } else {
                    tracing::warn!(
                        error = %err,
                        class = class.as_str(),
                        group = %record.group,
                        entity = %entity,
                        kind = kind.as_str(),
                        "record not persisted; cache retained"
                    );
                }
                return PersistenceOutcome::failed(err);
            }
        };

        let mut row = Vec::with_capacity(record.backup_row.len() + 1);
        row.push(format_timestamp(record.stamped_at));
        row.extend(record.backup_row.iter().copied().map(format_value));
        self.append_backup(kind.backup_file(), row).await;

        let cleared = cache.clear(&record.group, &record.consumed);
        cache.mark_committed(&record.group, record.stamped_at);
        IngestStats::incr(&self.stats.records_committed);
        self.stats.clear_error();

        let provenance = record
            .provenance
            .iter()
            .map(|(column, source)| format!("{column}={source}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            record_id,
            group = %record.group,
            entity = %entity,
            kind = kind.as_str(),
            cleared,
            provenance = %provenance,
            defaulted = ?record.defaulted_columns(),
            "record persisted"
        );
        PersistenceOutcome::stored(record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::policy::{evaluate, Evaluation};
    use crate::ingest::test_support::{MemoryBackupLog, MemoryStore};
    use crate::layout::{PipelineLayout, WARD_GROUP};
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    struct Harness {
        store: Arc<MemoryStore>,
        backup: Arc<MemoryBackupLog>,
        stats: Arc<IngestStats>,
        coordinator: PersistenceCoordinator,
        cache: AggregationCache,
        layout: PipelineLayout,
    }

    fn harness(store: MemoryStore, timeout: Duration) -> Harness {
        let layout = PipelineLayout::pico(1, 2);
        let store = Arc::new(store);
        let backup = Arc::new(MemoryBackupLog::default());
        let stats = Arc::new(IngestStats::new());
        let coordinator =
            PersistenceCoordinator::new(store.clone(), backup.clone(), timeout, stats.clone());
        Harness {
            store,
            backup,
            stats,
            coordinator,
            cache: AggregationCache::from_layout(&layout),
            layout,
        }
    }

    fn seeded() -> MemoryStore {
        MemoryStore::with_entities([EntityRef::Ward(1), EntityRef::Patient(2)])
    }

    fn complete_ward(h: &mut Harness) -> CompletedRecord {
        let now = Utc::now();
        h.cache.update(WARD_GROUP, "temperature_dht", 21.5, now);
        h.cache.update(WARD_GROUP, "humidity", 55.0, now);
        h.cache.update(WARD_GROUP, "light_intensity", 300.0, now);
        let spec = h.layout.group(WARD_GROUP).unwrap();
        match evaluate(spec, &h.cache.snapshots(), now) {
            Evaluation::Complete(record) => record,
            other => panic!("not complete: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stored_record_clears_consumed_slots_and_is_backed_up() {
        let mut h = harness(seeded(), Duration::from_secs(1));
        let record = complete_ward(&mut h);

        let outcome = h.coordinator.commit(record, &mut h.cache).await;
        assert!(outcome.success);
        assert_eq!(outcome.record_id, Some(1));
        assert_eq!(h.store.ward_count(), 1);

        let snapshot = h.cache.snapshot(WARD_GROUP).unwrap();
        assert!(snapshot.values().all(Option::is_none));
        assert!(h.cache.group(WARD_GROUP).unwrap().last_committed_at().is_some());

        let rows = h.backup.rows_for(BackupFile::Ward);
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1..], &["21.5", "", "55.0", "", "300.0"]);
        assert_eq!(h.stats.records_committed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn storage_failure_keeps_the_cache() {
        let store = seeded();
        store.set_fail_writes(true);
        let mut h = harness(store, Duration::from_secs(1));
        let record = complete_ward(&mut h);

        let outcome = h.coordinator.commit(record, &mut h.cache).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.failure, Some(CommitError::Storage(_))));
        assert_eq!(h.cache.snapshot(WARD_GROUP).unwrap()["humidity"], Some(55.0));
        assert!(h.backup.rows_for(BackupFile::Ward).is_empty());
        assert_eq!(h.stats.commit_failures.load(Ordering::Relaxed), 1);
        assert!(h.stats.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn missing_entity_is_a_configuration_failure() {
        let mut h = harness(MemoryStore::default(), Duration::from_secs(1));
        let record = complete_ward(&mut h);

        let outcome = h.coordinator.commit(record, &mut h.cache).await;
        let failure = outcome.failure.expect("failure");
        assert!(matches!(
            failure,
            CommitError::MissingEntity {
                entity: EntityRef::Ward(1)
            }
        ));
        assert_eq!(failure.class(), ErrorClass::Configuration);
        assert_eq!(h.store.ward_count(), 0);
        assert_eq!(h.cache.snapshot(WARD_GROUP).unwrap()["temperature_dht"], Some(21.5));
    }

    #[tokio::test]
    async fn backup_failure_does_not_undo_the_commit() {
        let mut h = harness(seeded(), Duration::from_secs(1));
        h.backup.set_fail(true);
        let record = complete_ward(&mut h);

        let outcome = h.coordinator.commit(record, &mut h.cache).await;
        assert!(outcome.success);
        assert_eq!(h.store.ward_count(), 1);
        assert!(h
            .cache
            .snapshot(WARD_GROUP)
            .unwrap()
            .values()
            .all(Option::is_none));
        assert_eq!(h.stats.backup_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn slow_storage_times_out_as_recoverable() {
        let store = seeded();
        store.set_delay(Duration::from_millis(500));
        let mut h = harness(store, Duration::from_millis(50));
        let record = complete_ward(&mut h);

        let outcome = h.coordinator.commit(record, &mut h.cache).await;
        assert!(matches!(outcome.failure, Some(CommitError::Timeout(_))));
        assert_eq!(h.cache.snapshot(WARD_GROUP).unwrap()["humidity"], Some(55.0));
    }

    #[tokio::test]
    async fn slow_backup_times_out_but_the_commit_stands() {
        let mut h = harness(seeded(), Duration::from_millis(50));
        h.backup.set_delay(Duration::from_millis(500));
        let record = complete_ward(&mut h);

        let outcome = h.coordinator.commit(record, &mut h.cache).await;
        assert!(outcome.success);
        assert_eq!(h.store.ward_count(), 1);
        assert!(h
            .cache
            .snapshot(WARD_GROUP)
            .unwrap()
            .values()
            .all(Option::is_none));
        assert!(h.backup.rows_for(BackupFile::Ward).is_empty());
        assert_eq!(h.stats.backup_failures.load(Ordering::Relaxed), 1);
        assert_eq!(h.stats.records_committed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_entity_lookup_is_recoverable_and_not_remembered() {
        let store = seeded();
        store.set_fail_lookups(true);
        let mut h = harness(store, Duration::from_secs(1));
        let record = complete_ward(&mut h);

        let outcome = h.coordinator.commit(record, &mut h.cache).await;
        let failure = outcome.failure.expect("failure");
        assert!(matches!(failure, CommitError::Storage(_)));
        assert_eq!(failure.class(), ErrorClass::RecoverableStorage);
        assert_eq!(h.store.ward_count(), 0);
        assert_eq!(h.cache.snapshot(WARD_GROUP).unwrap()["humidity"], Some(55.0));

        h.store.set_fail_lookups(false);
        let record = complete_ward(&mut h);
        assert!(h.coordinator.commit(record, &mut h.cache).await.success);
        assert_eq!(h.store.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.ward_count(), 1);
    }

    #[tokio::test]
    async fn entity_existence_is_looked_up_once() {
        let mut h = harness(seeded(), Duration::from_secs(1));
        for _ in 0..3 {
            let record = complete_ward(&mut h);
            assert!(h.coordinator.commit(record, &mut h.cache).await.success);
        }
        assert_eq!(h.store.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.ward_count(), 3);
    }

    #[tokio::test]
    async fn raw_observations_go_to_the_raw_file() {
        let h = harness(seeded(), Duration::from_secs(1));
        h.coordinator
            .log_raw(&RawObservation {
                topic: "ward/humidity".to_string(),
                value: 55.0,
                received_at: Utc::now(),
            })
            .await;

        let rows = h.backup.rows_for(BackupFile::Raw);
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1..], &["ward/humidity", "55.0"]);
    }
}
