use crate::entities::entity::Entity;
use crate::entities::properties::{PropertyKind, PropertyUpdate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VitalKind {
    Health,
    Focus,
}

impl VitalKind {
    pub fn raw(self) -> u8 {
        match self {
            VitalKind::Health => 0,
            VitalKind::Focus => 1,
        }
    }

    /// Property that caps this vital.
    pub fn capacity(self) -> PropertyKind {
        match self {
            VitalKind::Health => PropertyKind::HealthCapacity,
            VitalKind::Focus => PropertyKind::FocusCapacity,
        }
    }
}

pub type VitalGetter = fn(&Entity) -> f32;
pub type VitalSetter = fn(&mut Entity, f32);

struct VitalAccessor {
    kind: VitalKind,
    get: VitalGetter,
    set: VitalSetter,
}

/// Static vital -> accessor table, populated by an explicit registration
/// pass at construction instead of any runtime scanning.
pub struct VitalTable {
    entries: Vec<VitalAccessor>,
}

impl VitalTable {
    pub fn standard() -> Self {
        let mut table = Self {
            entries: Vec::new(),
        };
        table.register(
            VitalKind::Health,
            |entity| entity.health,
            |entity, value| entity.health = value,
        );
        table.register(
            VitalKind::Focus,
            |entity| entity.focus,
            |entity, value| entity.focus = value,
        );
        table
    }

    fn register(&mut self, kind: VitalKind, get: VitalGetter, set: VitalSetter) {
        self.entries.push(VitalAccessor { kind, get, set });
    }

    fn accessor(&self, kind: VitalKind) -> Option<&VitalAccessor> {
        self.entries.iter().find(|entry| entry.kind == kind)
    }

    pub fn get(&self, entity: &Entity, kind: VitalKind) -> f32 {
        self.accessor(kind)
            .map(|entry| (entry.get)(entity))
            .unwrap_or(0.0)
    }

    pub fn set(&self, entity: &mut Entity, kind: VitalKind, value: f32) {
        if let Some(entry) = self.accessor(kind) {
            (entry.set)(entity, value);
        }
    }

    /// Post-flush pass: a capacity that dropped below its vital's current
    /// value clamps the vital down. Returns the vitals that moved.
    pub fn clamp_to_capacities(
        &self,
        entity: &mut Entity,
        changed: &[PropertyUpdate],
    ) -> Vec<(VitalKind, f32)> {
        let mut clamped = Vec::new();
        for entry in &self.entries {
            let capacity_kind = entry.kind.capacity();
            let Some(update) = changed.iter().find(|update| update.kind == capacity_kind)
            else {
                continue;
            };
            let current = (entry.get)(entity);
            if current > update.value {
                (entry.set)(entity, update.value);
                clamped.push((entry.kind, update.value));
            }
        }
        clamped
    }
}
