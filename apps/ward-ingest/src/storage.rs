use crate::error::StoreError;
use crate::ingest::{PatientVitals, WardReading};
use crate::layout::EntityRef;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Authoritative record storage. Implementations report every failure as [`StoreError`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn entity_exists(&self, entity: EntityRef) -> Result<bool, StoreError>;

    async fn create_ward_reading(
        &self,
        reading: &WardReading,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn create_patient_vitals(
        &self,
        vitals: &PatientVitals,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
}

/// Lazily connected so a database outage at startup degrades to per-record storage failures
/// instead of keeping the listener down.
pub fn build_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_lazy(database_url)?;
    Ok(pool)
}

/// Writes into the dashboard's `data_management_*` tables.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn entity_exists(&self, entity: EntityRef) -> Result<bool, StoreError> {
        let exists: bool = match entity {
            EntityRef::Ward(id) => {
                sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM data_management_ward WHERE id = $1)",
                )
                .bind(id)
                .fetch_one(&self.pool)
                .await?
            }
            EntityRef::Patient(id) => {
                sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM data_management_patient WHERE user_id = $1)",
                )
                .bind(id)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(exists)
    }

    async fn create_ward_reading(
        &self,
        reading: &WardReading,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO data_management_wardreading
                (ward_id, temperature, humidity, noise_level, light_intensity, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id::bigint
            "#,
        )
        .bind(reading.ward_id)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.noise_level)
        .bind(reading.light_intensity)
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn create_patient_vitals(
        &self,
        vitals: &PatientVitals,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO data_management_patientvitals
                (patient_id, temperature, heart_rate, oxygen_saturation, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id::bigint
            "#,
        )
        .bind(vitals.patient_id)
        .bind(vitals.temperature)
        .bind(vitals.heart_rate)
        .bind(vitals.oxygen_saturation)
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}
