use super::types::{FieldSlot, Snapshot};
use crate::layout::{FieldName, GroupId, PipelineLayout};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct AggregationGroup {
    slots: BTreeMap<FieldName, FieldSlot>,
    dirty: bool,
    last_committed_at: Option<DateTime<Utc>>,
}

impl AggregationGroup {
    fn new<'a>(fields: impl IntoIterator<Item = &'a FieldName>) -> Self {
        Self {
            slots: fields
                .into_iter()
                .map(|field| (field.clone(), FieldSlot::default()))
                .collect(),
            dirty: false,
            last_committed_at: None,
        }
    }

    pub fn slots(&self) -> &BTreeMap<FieldName, FieldSlot> {
        &self.slots
    }

    pub fn last_committed_at(&self) -> Option<DateTime<Utc>> {
        self.last_committed_at
    }
}

/// Latest value per field for every monitored entity. Groups are fixed at construction;
/// slots start absent and are only ever overwritten or reset.
#[derive(Debug, Default)]
pub struct AggregationCache {
    groups: BTreeMap<GroupId, AggregationGroup>,
}

impl AggregationCache {
    pub fn from_layout(layout: &PipelineLayout) -> Self {
        let groups = layout
            .groups
            .iter()
            .map(|spec| (spec.id.clone(), AggregationGroup::new(&spec.fields)))
            .collect();
        Self { groups }
    }

    /// Last write wins. Returns `false` (and changes nothing) for an undeclared slot.
    pub fn update(&mut self, group: &str, field: &str, value: f64, at: DateTime<Utc>) -> bool {
        let Some(entry) = self.groups.get_mut(group) else {
            return false;
        };
        let Some(slot) = entry.slots.get_mut(field) else {
            return false;
        };
        slot.value = Some(value);
        slot.updated_at = Some(at);
        entry.dirty = true;
        true
    }

    pub fn snapshot(&self, group: &str) -> Option<Snapshot> {
        self.groups.get(group).map(|entry| {
            entry
                .slots
                .iter()
                .map(|(field, slot)| (field.clone(), slot.value))
                .collect()
        })
    }

    pub fn snapshots(&self) -> BTreeMap<GroupId, Snapshot> {
        self.groups
            .keys()
            .filter_map(|id| self.snapshot(id).map(|snapshot| (id.clone(), snapshot)))
            .collect()
    }

    /// Resets only the named slots; everything else in the group keeps its value.
    /// Returns how many slots held a value before the reset.
    pub fn clear(&mut self, group: &str, fields: &[FieldName]) -> usize {
        let Some(entry) = self.groups.get_mut(group) else {
            return 0;
        };
        let mut cleared = 0;
        for field in fields {
            if let Some(slot) = entry.slots.get_mut(field) {
                if slot.value.is_some() {
                    cleared += 1;
                }
                *slot = FieldSlot::default();
            }
        }
        cleared
    }

    /// Groups updated since the previous call, in stable order. Resets the flags.
    pub fn take_dirty(&mut self) -> Vec<GroupId> {
        self.groups
            .iter_mut()
            .filter_map(|(id, entry)| {
                std::mem::take(&mut entry.dirty).then(|| id.clone())
            })
            .collect()
    }

    pub fn mark_committed(&mut self, group: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.groups.get_mut(group) {
            entry.last_committed_at = Some(at);
        }
    }

    pub fn group(&self, group: &str) -> Option<&AggregationGroup> {
        self.groups.get(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&GroupId, &AggregationGroup)> {
        self.groups.iter()
    }
}
