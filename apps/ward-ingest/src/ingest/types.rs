use crate::error::CommitError;
use crate::layout::{EntityRef, FieldName, GroupId, RecordKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldSlot {
    pub value: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of a group's slots. Absent fields map to `None`.
pub type Snapshot = BTreeMap<FieldName, Option<f64>>;

/// Where a stored value came from.
#[derive(Clone, Debug, PartialEq)]
pub enum Provenance {
    /// First source of the chain.
    Sensor { group: GroupId, field: FieldName },
    /// A later slot in the chain stood in for the primary sensor.
    Substituted { group: GroupId, field: FieldName },
    /// Configured constant; a data-quality gap, not a measurement.
    Default,
}

impl Provenance {
    pub fn is_measured(&self) -> bool {
        !matches!(self, Provenance::Default)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Sensor { group, field } => write!(f, "sensor:{group}.{field}"),
            Provenance::Substituted { group, field } => write!(f, "substituted:{group}.{field}"),
            Provenance::Default => f.write_str("default"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedValue {
    pub value: f64,
    pub provenance: Provenance,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WardReading {
    pub ward_id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub noise_level: f64,
    pub light_intensity: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatientVitals {
    pub patient_id: i64,
    pub temperature: f64,
    pub heart_rate: i32,
    pub oxygen_saturation: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordPayload {
    Ward(WardReading),
    Patient(PatientVitals),
}

impl RecordPayload {
    pub fn entity(&self) -> EntityRef {
        match self {
            RecordPayload::Ward(reading) => EntityRef::Ward(reading.ward_id),
            RecordPayload::Patient(vitals) => EntityRef::Patient(vitals.patient_id),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::Ward(_) => RecordKind::WardReading,
            RecordPayload::Patient(_) => RecordKind::PatientVitals,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletedRecord {
    pub group: GroupId,
    pub payload: RecordPayload,
    pub provenance: BTreeMap<String, Provenance>,
    /// Own-group slots to reset once the record is stored.
    pub consumed: Vec<FieldName>,
    /// Backup cells after the timestamp, in the backup file's column order.
    pub backup_row: Vec<Option<f64>>,
    pub stamped_at: DateTime<Utc>,
}

impl CompletedRecord {
    pub fn defaulted_columns(&self) -> Vec<&str> {
        self.provenance
            .iter()
            .filter(|(_, provenance)| !provenance.is_measured())
            .map(|(column, _)| column.as_str())
            .collect()
    }
}

#[derive(Debug)]
pub struct PersistenceOutcome {
    pub record_id: Option<i64>,
    pub success: bool,
    pub failure: Option<CommitError>,
}

impl PersistenceOutcome {
    pub fn stored(record_id: i64) -> Self {
        Self {
            record_id: Some(record_id),
            success: true,
            failure: None,
        }
    }

    pub fn failed(err: CommitError) -> Self {
        Self {
            record_id: None,
            success: false,
            failure: Some(err),
        }
    }
}
