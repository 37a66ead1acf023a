//! Declarative description of the pipeline: which groups exist, which topics feed which slots,
//! how each stored column is resolved, and when a group is complete enough to persist.
//!
//! The built-in profiles reproduce the two sensor deployments the dashboard has shipped with
//! (a Pico board publishing plain `ward/*` topics, and Adafruit IO feeds). A setup file can
//! replace them wholesale with its own layout.

use crate::backup::BackupFile;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type GroupId = String;
pub type FieldName = String;

pub const TEMPERATURE: &str = "temperature";
pub const HUMIDITY: &str = "humidity";
pub const NOISE_LEVEL: &str = "noise_level";
pub const LIGHT_INTENSITY: &str = "light_intensity";
pub const HEART_RATE: &str = "heart_rate";
pub const OXYGEN_SATURATION: &str = "oxygen_saturation";

pub const DEFAULT_NOISE_LEVEL: f64 = 0.0;
pub const DEFAULT_BODY_TEMPERATURE: f64 = 36.5;
pub const DEFAULT_HEART_RATE: f64 = 70.0;
pub const DEFAULT_OXYGEN_SATURATION: f64 = 98.0;

pub const WARD_GROUP: &str = "ward-environmental";
pub const PATIENT_GROUP: &str = "patient-vitals";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    WardReading,
    PatientVitals,
}

impl RecordKind {
    /// Stored columns for this record kind and whether each may be null.
    pub fn columns(self) -> &'static [(&'static str, bool)] {
        match self {
            RecordKind::WardReading => &[
                (TEMPERATURE, false),
                (HUMIDITY, false),
                (NOISE_LEVEL, false),
                (LIGHT_INTENSITY, true),
            ],
            RecordKind::PatientVitals => &[
                (TEMPERATURE, false),
                (HEART_RATE, false),
                (OXYGEN_SATURATION, false),
            ],
        }
    }

    pub fn backup_file(self) -> BackupFile {
        match self {
            RecordKind::WardReading => BackupFile::Ward,
            RecordKind::PatientVitals => BackupFile::Patient,
        }
    }

    pub fn entity(self, id: i64) -> EntityRef {
        match self {
            RecordKind::WardReading => EntityRef::Ward(id),
            RecordKind::PatientVitals => EntityRef::Patient(id),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::WardReading => "ward_reading",
            RecordKind::PatientVitals => "patient_vitals",
        }
    }
}

/// The dashboard entity a record is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Ward(i64),
    Patient(i64),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Ward(id) => write!(f, "ward {id}"),
            EntityRef::Patient(id) => write!(f, "patient {id}"),
        }
    }
}

/// One link of a fallback chain.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// A cached slot. `group` defaults to the group that owns the chain.
    Slot {
        #[serde(default)]
        group: Option<GroupId>,
        field: FieldName,
    },
    Default { value: f64 },
}

impl ValueSource {
    pub fn slot(field: &str) -> Self {
        ValueSource::Slot {
            group: None,
            field: field.to_string(),
        }
    }

    pub fn slot_in(group: &str, field: &str) -> Self {
        ValueSource::Slot {
            group: Some(group.to_string()),
            field: field.to_string(),
        }
    }

    pub fn default_value(value: f64) -> Self {
        ValueSource::Default { value }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct OutputSpec {
    pub column: String,
    pub sources: Vec<ValueSource>,
}

/// A cell of the per-record backup row, after the timestamp.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupColumn {
    Slot(FieldName),
    Output(String),
    Blank,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct GroupSpec {
    pub id: GroupId,
    pub kind: RecordKind,
    pub entity_id: i64,
    pub fields: Vec<FieldName>,
    /// Output columns that must resolve from a measured slot before the group persists.
    pub required: Vec<String>,
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub backup_columns: Vec<BackupColumn>,
}

impl GroupSpec {
    pub fn entity(&self) -> EntityRef {
        self.kind.entity(self.entity_id)
    }

    pub fn output(&self, column: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|output| output.column == column)
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    /// Own-group slots read by any output chain; these are reset after a successful commit.
    /// Slots borrowed from other groups are never part of this set.
    pub fn consumed_fields(&self) -> Vec<FieldName> {
        let referenced: HashSet<&str> = self
            .outputs
            .iter()
            .flat_map(|output| output.sources.iter())
            .filter_map(|source| match source {
                ValueSource::Slot { group, field }
                    if group.as_deref().map_or(true, |g| g == self.id) =>
                {
                    Some(field.as_str())
                }
                _ => None,
            })
            .collect();
        self.fields
            .iter()
            .filter(|field| referenced.contains(field.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RouteSpec {
    pub topic: String,
    pub group: GroupId,
    pub field: FieldName,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PipelineLayout {
    pub groups: Vec<GroupSpec>,
    pub routes: Vec<RouteSpec>,
}

#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("layout declares no routes")]
    NoRoutes,
    #[error("group {0:?} is declared twice")]
    DuplicateGroup(GroupId),
    #[error("group {group:?} declares field {field:?} twice")]
    DuplicateField { group: GroupId, field: FieldName },
    #[error("topic {0:?} is routed twice")]
    DuplicateTopic(String),
    #[error("route for {topic:?} targets unknown slot {group}.{field}")]
    UnknownRouteTarget {
        topic: String,
        group: GroupId,
        field: FieldName,
    },
    #[error("group {group:?} is missing output column {column:?}")]
    MissingColumn { group: GroupId, column: String },
    #[error("group {group:?} has output {column:?} which its record kind does not store")]
    UnknownColumn { group: GroupId, column: String },
    #[error("group {group:?} output {column:?} has no sources")]
    EmptyChain { group: GroupId, column: String },
    #[error("group {group:?} output {column:?} reads unknown slot {source_group}.{field}")]
    UnknownSource {
        group: GroupId,
        column: String,
        source_group: GroupId,
        field: FieldName,
    },
    #[error("group {group:?} requires {column:?} but that output has no slot source")]
    UnmeasurableRequirement { group: GroupId, column: String },
    #[error("group {group:?} backup column references unknown {name:?}")]
    UnknownBackupColumn { group: GroupId, name: String },
}

impl PipelineLayout {
    pub fn group(&self, id: &str) -> Option<&GroupSpec> {
        self.groups.iter().find(|group| group.id == id)
    }

    pub fn topics(&self) -> Vec<String> {
        self.routes.iter().map(|route| route.topic.clone()).collect()
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.routes.is_empty() {
            return Err(LayoutError::NoRoutes);
        }

        let mut fields_by_group: HashMap<&str, HashSet<&str>> = HashMap::new();
        for group in &self.groups {
            if fields_by_group.contains_key(group.id.as_str()) {
                return Err(LayoutError::DuplicateGroup(group.id.clone()));
            }
            let mut fields = HashSet::new();
            for field in &group.fields {
                if !fields.insert(field.as_str()) {
                    return Err(LayoutError::DuplicateField {
                        group: group.id.clone(),
                        field: field.clone(),
                    });
                }
            }
            fields_by_group.insert(group.id.as_str(), fields);
        }
        let slot_exists = |group: &str, field: &str| {
            fields_by_group
                .get(group)
                .map(|fields| fields.contains(field))
                .unwrap_or(false)
        };

        let mut topics = HashSet::new();
        for route in &self.routes {
            if !topics.insert(route.topic.as_str()) {
                return Err(LayoutError::DuplicateTopic(route.topic.clone()));
            }
            if !slot_exists(&route.group, &route.field) {
                return Err(LayoutError::UnknownRouteTarget {
                    topic: route.topic.clone(),
                    group: route.group.clone(),
                    field: route.field.clone(),
                });
            }
        }

        for group in &self.groups {
            let columns = group.kind.columns();
            for (column, _) in columns {
                if group.output(column).is_none() {
                    return Err(LayoutError::MissingColumn {
                        group: group.id.clone(),
                        column: column.to_string(),
                    });
                }
            }
            for output in &group.outputs {
                if !columns.iter().any(|(column, _)| *column == output.column) {
                    return Err(LayoutError::UnknownColumn {
                        group: group.id.clone(),
                        column: output.column.clone(),
                    });
                }
                if output.sources.is_empty() {
                    return Err(LayoutError::EmptyChain {
                        group: group.id.clone(),
                        column: output.column.clone(),
                    });
                }
                for source in &output.sources {
                    if let ValueSource::Slot {
                        group: source_group,
                        field,
                    } = source
                    {
                        let source_group = source_group.as_deref().unwrap_or(&group.id);
                        if !slot_exists(source_group, field) {
                            return Err(LayoutError::UnknownSource {
                                group: group.id.clone(),
                                column: output.column.clone(),
                                source_group: source_group.to_string(),
                                field: field.clone(),
                            });
                        }
                    }
                }
            }
            for column in &group.required {
                let measurable = group
                    .output(column)
                    .map(|output| {
                        output
                            .sources
                            .iter()
                            .any(|source| matches!(source, ValueSource::Slot { .. }))
                    })
                    .unwrap_or(false);
                if !measurable {
                    return Err(LayoutError::UnmeasurableRequirement {
                        group: group.id.clone(),
                        column: column.clone(),
                    });
                }
            }
            for column in &group.backup_columns {
                let known = match column {
                    BackupColumn::Slot(field) => group.has_field(field),
                    BackupColumn::Output(name) => group.output(name).is_some(),
                    BackupColumn::Blank => true,
                };
                if !known {
                    let name = match column {
                        BackupColumn::Slot(name) | BackupColumn::Output(name) => name.clone(),
                        BackupColumn::Blank => String::new(),
                    };
                    return Err(LayoutError::UnknownBackupColumn {
                        group: group.id.clone(),
                        name,
                    });
                }
            }
        }

        Ok(())
    }

    /// Pico board layout: DHT22 + LM35 temperature, humidity, sound, light, pulse oximeter.
    pub fn pico(ward_id: i64, patient_id: i64) -> Self {
        let ward = GroupSpec {
            id: WARD_GROUP.to_string(),
            kind: RecordKind::WardReading,
            entity_id: ward_id,
            fields: strings(&[
                "temperature_dht",
                "temperature_lm35",
                HUMIDITY,
                NOISE_LEVEL,
                LIGHT_INTENSITY,
            ]),
            required: strings(&[TEMPERATURE, HUMIDITY]),
            outputs: vec![
                OutputSpec {
                    column: TEMPERATURE.to_string(),
                    sources: vec![
                        ValueSource::slot("temperature_dht"),
                        ValueSource::slot("temperature_lm35"),
                    ],
                },
                OutputSpec {
                    column: HUMIDITY.to_string(),
                    sources: vec![ValueSource::slot(HUMIDITY)],
                },
                OutputSpec {
                    column: NOISE_LEVEL.to_string(),
                    sources: vec![
                        ValueSource::slot(NOISE_LEVEL),
                        ValueSource::default_value(DEFAULT_NOISE_LEVEL),
                    ],
                },
                OutputSpec {
                    column: LIGHT_INTENSITY.to_string(),
                    sources: vec![ValueSource::slot(LIGHT_INTENSITY)],
                },
            ],
            backup_columns: vec![
                BackupColumn::Slot("temperature_dht".to_string()),
                BackupColumn::Slot("temperature_lm35".to_string()),
                BackupColumn::Slot(HUMIDITY.to_string()),
                BackupColumn::Slot(NOISE_LEVEL.to_string()),
                BackupColumn::Slot(LIGHT_INTENSITY.to_string()),
            ],
        };

        let patient = GroupSpec {
            id: PATIENT_GROUP.to_string(),
            kind: RecordKind::PatientVitals,
            entity_id: patient_id,
            fields: strings(&[TEMPERATURE, HEART_RATE, OXYGEN_SATURATION]),
            required: strings(&[HEART_RATE, OXYGEN_SATURATION]),
            outputs: vec![
                OutputSpec {
                    column: TEMPERATURE.to_string(),
                    sources: vec![
                        ValueSource::slot(TEMPERATURE),
                        ValueSource::slot_in(WARD_GROUP, "temperature_dht"),
                        ValueSource::slot_in(WARD_GROUP, "temperature_lm35"),
                        ValueSource::default_value(DEFAULT_BODY_TEMPERATURE),
                    ],
                },
                OutputSpec {
                    column: HEART_RATE.to_string(),
                    sources: vec![ValueSource::slot(HEART_RATE)],
                },
                OutputSpec {
                    column: OXYGEN_SATURATION.to_string(),
                    sources: vec![ValueSource::slot(OXYGEN_SATURATION)],
                },
            ],
            backup_columns: patient_backup_columns(),
        };

        let routes = [
            ("ward/temperature_dht", WARD_GROUP, "temperature_dht"),
            ("ward/temperature_lm35", WARD_GROUP, "temperature_lm35"),
            ("ward/humidity", WARD_GROUP, HUMIDITY),
            ("ward/sound", WARD_GROUP, NOISE_LEVEL),
            ("ward/light", WARD_GROUP, LIGHT_INTENSITY),
            ("ward/spo2", PATIENT_GROUP, OXYGEN_SATURATION),
            ("ward/heart_rate", PATIENT_GROUP, HEART_RATE),
        ];

        Self {
            groups: vec![ward, patient],
            routes: routes
                .iter()
                .map(|(topic, group, field)| RouteSpec {
                    topic: topic.to_string(),
                    group: group.to_string(),
                    field: field.to_string(),
                })
                .collect(),
        }
    }

    /// Adafruit IO layout: ward temperature/humidity/light feeds and a patient temperature feed.
    /// Heart rate and SpO2 have no sensor here and are always the physiological defaults.
    pub fn adafruit(username: &str, ward_id: i64, patient_id: i64) -> Self {
        let ward = GroupSpec {
            id: WARD_GROUP.to_string(),
            kind: RecordKind::WardReading,
            entity_id: ward_id,
            fields: strings(&[TEMPERATURE, HUMIDITY, LIGHT_INTENSITY]),
            required: strings(&[TEMPERATURE, HUMIDITY, LIGHT_INTENSITY]),
            outputs: vec![
                OutputSpec {
                    column: TEMPERATURE.to_string(),
                    sources: vec![ValueSource::slot(TEMPERATURE)],
                },
                OutputSpec {
                    column: HUMIDITY.to_string(),
                    sources: vec![ValueSource::slot(HUMIDITY)],
                },
                OutputSpec {
                    column: NOISE_LEVEL.to_string(),
                    sources: vec![ValueSource::default_value(DEFAULT_NOISE_LEVEL)],
                },
                OutputSpec {
                    column: LIGHT_INTENSITY.to_string(),
                    sources: vec![ValueSource::slot(LIGHT_INTENSITY)],
                },
            ],
            backup_columns: vec![
                BackupColumn::Slot(TEMPERATURE.to_string()),
                BackupColumn::Blank,
                BackupColumn::Slot(HUMIDITY.to_string()),
                BackupColumn::Output(NOISE_LEVEL.to_string()),
                BackupColumn::Slot(LIGHT_INTENSITY.to_string()),
            ],
        };

        let patient = GroupSpec {
            id: PATIENT_GROUP.to_string(),
            kind: RecordKind::PatientVitals,
            entity_id: patient_id,
            fields: strings(&[TEMPERATURE]),
            required: strings(&[TEMPERATURE]),
            outputs: vec![
                OutputSpec {
                    column: TEMPERATURE.to_string(),
                    sources: vec![ValueSource::slot(TEMPERATURE)],
                },
                OutputSpec {
                    column: HEART_RATE.to_string(),
                    sources: vec![ValueSource::default_value(DEFAULT_HEART_RATE)],
                },
                OutputSpec {
                    column: OXYGEN_SATURATION.to_string(),
                    sources: vec![ValueSource::default_value(DEFAULT_OXYGEN_SATURATION)],
                },
            ],
            backup_columns: patient_backup_columns(),
        };

        let feed = |name: &str| format!("{username}/feeds/{name}");
        Self {
            groups: vec![ward, patient],
            routes: vec![
                RouteSpec {
                    topic: feed("ward-temperature"),
                    group: WARD_GROUP.to_string(),
                    field: TEMPERATURE.to_string(),
                },
                RouteSpec {
                    topic: feed("ward-humidity"),
                    group: WARD_GROUP.to_string(),
                    field: HUMIDITY.to_string(),
                },
                RouteSpec {
                    topic: feed("light-intensity"),
                    group: WARD_GROUP.to_string(),
                    field: LIGHT_INTENSITY.to_string(),
                },
                RouteSpec {
                    topic: feed("patient-temperature"),
                    group: PATIENT_GROUP.to_string(),
                    field: TEMPERATURE.to_string(),
                },
            ],
        }
    }
}

fn patient_backup_columns() -> Vec<BackupColumn> {
    vec![
        BackupColumn::Output(TEMPERATURE.to_string()),
        BackupColumn::Output(HEART_RATE.to_string()),
        BackupColumn::Output(OXYGEN_SATURATION.to_string()),
    ]
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Pico,
    Adafruit,
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pico" => Ok(Profile::Pico),
            "adafruit" | "adafruit-io" | "aio" => Ok(Profile::Adafruit),
            other => anyhow::bail!("unknown profile {other:?} (expected pico or adafruit)"),
        }
    }
}
