//! Completeness predicate and fallback resolution. Everything here is a pure function of the
//! group specs and the snapshots handed in.

use super::types::{
    CompletedRecord, PatientVitals, Provenance, RecordPayload, ResolvedValue, Snapshot,
    WardReading,
};
use crate::layout::{
    BackupColumn, GroupId, GroupSpec, OutputSpec, RecordKind, ValueSource, HEART_RATE, HUMIDITY,
    LIGHT_INTENSITY, NOISE_LEVEL, OXYGEN_SATURATION, TEMPERATURE,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, PartialEq)]
pub enum Evaluation {
    Complete(CompletedRecord),
    Incomplete { missing: Vec<String> },
    /// A resolved value the target column cannot hold. Nothing is written.
    Rejected { column: String, value: f64 },
}

/// First present source wins, left to right.
pub fn resolve(
    spec: &GroupSpec,
    output: &OutputSpec,
    snapshots: &BTreeMap<GroupId, Snapshot>,
) -> Option<ResolvedValue> {
    output
        .sources
        .iter()
        .enumerate()
        .find_map(|(position, source)| match source {
            ValueSource::Slot { group, field } => {
                let group = group.as_deref().unwrap_or(&spec.id);
                let value = snapshots.get(group)?.get(field).copied().flatten()?;
                let provenance = if position == 0 {
                    Provenance::Sensor {
                        group: group.to_string(),
                        field: field.clone(),
                    }
                } else {
                    Provenance::Substituted {
                        group: group.to_string(),
                        field: field.clone(),
                    }
                };
                Some(ResolvedValue { value, provenance })
            }
            ValueSource::Default { value } => Some(ResolvedValue {
                value: *value,
                provenance: Provenance::Default,
            }),
        })
}

pub fn evaluate(
    spec: &GroupSpec,
    snapshots: &BTreeMap<GroupId, Snapshot>,
    stamped_at: DateTime<Utc>,
) -> Evaluation {
    let resolved: BTreeMap<&str, ResolvedValue> = spec
        .outputs
        .iter()
        .filter_map(|output| {
            resolve(spec, output, snapshots).map(|value| (output.column.as_str(), value))
        })
        .collect();

    let mut missing = Vec::new();
    for column in &spec.required {
        let measured = resolved
            .get(column.as_str())
            .map(|value| value.provenance.is_measured())
            .unwrap_or(false);
        if !measured {
            missing.push(column.clone());
        }
    }
    for (column, nullable) in spec.kind.columns() {
        if !nullable && !resolved.contains_key(column) && !missing.iter().any(|m| m == column) {
            missing.push(column.to_string());
        }
    }
    if !missing.is_empty() {
        return Evaluation::Incomplete { missing };
    }

    let value = |column: &str| resolved.get(column).map(|resolved| resolved.value);
    if spec.kind == RecordKind::PatientVitals {
        if let Some(rate) = value(HEART_RATE).filter(|rate| !fits_integer_column(*rate)) {
            return Evaluation::Rejected {
                column: HEART_RATE.to_string(),
                value: rate,
            };
        }
    }
    let Some(payload) = build_payload(spec, &value) else {
        // Every non-null column resolved above, so this only trips on a layout/kind mismatch.
        return Evaluation::Incomplete { missing };
    };

    let own = snapshots.get(&spec.id);
    let backup_row = spec
        .backup_columns
        .iter()
        .map(|column| match column {
            BackupColumn::Slot(field) => own.and_then(|s| s.get(field).copied().flatten()),
            BackupColumn::Output(name) => value(name.as_str()),
            BackupColumn::Blank => None,
        })
        .collect();

    Evaluation::Complete(CompletedRecord {
        group: spec.id.clone(),
        payload,
        provenance: resolved
            .into_iter()
            .map(|(column, value)| (column.to_string(), value.provenance))
            .collect(),
        consumed: spec.consumed_fields(),
        backup_row,
        stamped_at,
    })
}

fn fits_integer_column(value: f64) -> bool {
    let whole = value.trunc();
    whole.is_finite() && whole >= f64::from(i32::MIN) && whole <= f64::from(i32::MAX)
}

fn build_payload(spec: &GroupSpec, value: &dyn Fn(&str) -> Option<f64>) -> Option<RecordPayload> {
    match spec.kind {
        RecordKind::WardReading => Some(RecordPayload::Ward(WardReading {
            ward_id: spec.entity_id,
            temperature: value(TEMPERATURE)?,
            humidity: value(HUMIDITY)?,
            noise_level: value(NOISE_LEVEL)?,
            light_intensity: value(LIGHT_INTENSITY),
        })),
        RecordKind::PatientVitals => Some(RecordPayload::Patient(PatientVitals {
            patient_id: spec.entity_id,
            temperature: value(TEMPERATURE)?,
            // Range checked in `evaluate`; fractional beats are dropped.
            heart_rate: value(HEART_RATE)?.trunc() as i32,
            oxygen_saturation: value(OXYGEN_SATURATION)?,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{PipelineLayout, PATIENT_GROUP, WARD_GROUP};

    fn snapshots(
        layout: &PipelineLayout,
        values: &[(&str, &str, f64)],
    ) -> BTreeMap<GroupId, Snapshot> {
        let mut out: BTreeMap<GroupId, Snapshot> = layout
            .groups
            .iter()
            .map(|group| {
                (
                    group.id.clone(),
                    group.fields.iter().map(|f| (f.clone(), None)).collect(),
                )
            })
            .collect();
        for (group, field, value) in values {
            out.get_mut(*group)
                .unwrap()
                .insert(field.to_string(), Some(*value));
        }
        out
    }

    fn complete(evaluation: Evaluation) -> CompletedRecord {
        match evaluation {
            Evaluation::Complete(record) => record,
            Evaluation::Incomplete { missing } => panic!("expected complete, missing {missing:?}"),
            Evaluation::Rejected { column, value } => {
                panic!("expected complete, rejected {column}={value}")
            }
        }
    }

    #[test]
    fn ward_needs_temperature_and_humidity() {
        let layout = PipelineLayout::pico(1, 2);
        let ward = layout.group(WARD_GROUP).unwrap();
        let snaps = snapshots(&layout, &[(WARD_GROUP, "temperature_dht", 21.5)]);

        assert_eq!(
            evaluate(ward, &snaps, Utc::now()),
            Evaluation::Incomplete {
                missing: vec!["humidity".to_string()]
            }
        );
    }

    #[test]
    fn ward_defaults_noise_and_leaves_light_null() {
        let layout = PipelineLayout::pico(4, 2);
        let ward = layout.group(WARD_GROUP).unwrap();
        let snaps = snapshots(
            &layout,
            &[(WARD_GROUP, "temperature_dht", 21.5), (WARD_GROUP, "humidity", 55.0)],
        );

        let record = complete(evaluate(ward, &snaps, Utc::now()));
        assert_eq!(
            record.payload,
            RecordPayload::Ward(WardReading {
                ward_id: 4,
                temperature: 21.5,
                humidity: 55.0,
                noise_level: 0.0,
                light_intensity: None,
            })
        );
        assert_eq!(record.provenance["noise_level"], Provenance::Default);
        assert_eq!(record.defaulted_columns(), vec!["noise_level"]);
        assert!(!record.provenance.contains_key("light_intensity"));
        assert_eq!(
            record.backup_row,
            vec![Some(21.5), None, Some(55.0), None, None]
        );
    }

    #[test]
    fn lm35_stands_in_for_missing_dht() {
        let layout = PipelineLayout::pico(1, 2);
        let ward = layout.group(WARD_GROUP).unwrap();
        let snaps = snapshots(
            &layout,
            &[(WARD_GROUP, "temperature_lm35", 23.0), (WARD_GROUP, "humidity", 40.0)],
        );

        let record = complete(evaluate(ward, &snaps, Utc::now()));
        assert_eq!(
            record.provenance["temperature"],
            Provenance::Substituted {
                group: WARD_GROUP.to_string(),
                field: "temperature_lm35".to_string(),
            }
        );
    }

    #[test]
    fn patient_temperature_prefers_ward_ambient_over_default() {
        let layout = PipelineLayout::pico(1, 2);
        let patient = layout.group(PATIENT_GROUP).unwrap();
        let snaps = snapshots(
            &layout,
            &[
                (WARD_GROUP, "temperature_dht", 22.0),
                (PATIENT_GROUP, "heart_rate", 80.0),
                (PATIENT_GROUP, "oxygen_saturation", 96.0),
            ],
        );

        let record = complete(evaluate(patient, &snaps, Utc::now()));
        let RecordPayload::Patient(vitals) = &record.payload else {
            panic!("expected patient vitals");
        };
        assert_eq!(vitals.temperature, 22.0);
        assert!(record.provenance["temperature"].is_measured());
    }

    #[test]
    fn dedicated_patient_sensor_beats_ward_ambient() {
        let layout = PipelineLayout::pico(1, 2);
        let patient = layout.group(PATIENT_GROUP).unwrap();
        let snaps = snapshots(
            &layout,
            &[
                (WARD_GROUP, "temperature_dht", 22.0),
                (PATIENT_GROUP, "temperature", 37.2),
                (PATIENT_GROUP, "heart_rate", 80.0),
                (PATIENT_GROUP, "oxygen_saturation", 96.0),
            ],
        );

        let record = complete(evaluate(patient, &snaps, Utc::now()));
        let RecordPayload::Patient(vitals) = &record.payload else {
            panic!("expected patient vitals");
        };
        assert_eq!(vitals.temperature, 37.2);
    }

    #[test]
    fn patient_falls_back_to_body_temperature_default() {
        let layout = PipelineLayout::pico(1, 2);
        let patient = layout.group(PATIENT_GROUP).unwrap();
        let snaps = snapshots(
            &layout,
            &[
                (PATIENT_GROUP, "heart_rate", 72.9),
                (PATIENT_GROUP, "oxygen_saturation", 97.0),
            ],
        );

        let record = complete(evaluate(patient, &snaps, Utc::now()));
        assert_eq!(
            record.payload,
            RecordPayload::Patient(PatientVitals {
                patient_id: 2,
                temperature: 36.5,
                heart_rate: 72,
                oxygen_saturation: 97.0,
            })
        );
        assert_eq!(record.defaulted_columns(), vec!["temperature"]);
        assert_eq!(record.backup_row, vec![Some(36.5), Some(72.9), Some(97.0)]);
        assert_eq!(
            record.consumed,
            vec!["temperature", "heart_rate", "oxygen_saturation"]
        );
    }

    #[test]
    fn heart_rate_beyond_the_integer_column_is_rejected() {
        let layout = PipelineLayout::pico(1, 2);
        let patient = layout.group(PATIENT_GROUP).unwrap();
        let snaps = snapshots(
            &layout,
            &[
                (PATIENT_GROUP, "heart_rate", 1e10),
                (PATIENT_GROUP, "oxygen_saturation", 97.0),
            ],
        );

        assert_eq!(
            evaluate(patient, &snaps, Utc::now()),
            Evaluation::Rejected {
                column: "heart_rate".to_string(),
                value: 1e10,
            }
        );
        assert!(fits_integer_column(2_147_483_647.9));
        assert!(!fits_integer_column(f64::NAN));
    }

    #[test]
    fn defaults_never_satisfy_requirements() {
        let layout = PipelineLayout::adafruit("nurse", 1, 2);
        let patient = layout.group(PATIENT_GROUP).unwrap();
        let empty = snapshots(&layout, &[]);
        assert_eq!(
            evaluate(patient, &empty, Utc::now()),
            Evaluation::Incomplete {
                missing: vec!["temperature".to_string()]
            }
        );

        let snaps = snapshots(&layout, &[(PATIENT_GROUP, "temperature", 37.0)]);
        let record = complete(evaluate(patient, &snaps, Utc::now()));
        assert_eq!(
            record.payload,
            RecordPayload::Patient(PatientVitals {
                patient_id: 2,
                temperature: 37.0,
                heart_rate: 70,
                oxygen_saturation: 98.0,
            })
        );
    }

    #[test]
    fn evaluation_is_deterministic_for_equal_inputs() {
        let layout = PipelineLayout::pico(1, 2);
        let ward = layout.group(WARD_GROUP).unwrap();
        let snaps = snapshots(
            &layout,
            &[
                (WARD_GROUP, "temperature_dht", 19.0),
                (WARD_GROUP, "temperature_lm35", 20.0),
                (WARD_GROUP, "humidity", 45.0),
                (WARD_GROUP, "light_intensity", 120.0),
            ],
        );
        let at = Utc::now();
        assert_eq!(evaluate(ward, &snaps, at), evaluate(ward, &snaps, at));
    }
}
