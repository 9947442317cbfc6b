use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PropertyKind {
    Strength,
    Dexterity,
    Stamina,
    Intellect,
    Armor,
    MoveSpeed,
    CastSpeed,
    AttackPower,
    SpellPower,
    HealthCapacity,
    FocusCapacity,
    HealthRegen,
    FocusRegen,
}

impl PropertyKind {
    pub const ALL: [PropertyKind; 13] = [
        PropertyKind::Strength,
        PropertyKind::Dexterity,
        PropertyKind::Stamina,
        PropertyKind::Intellect,
        PropertyKind::Armor,
        PropertyKind::MoveSpeed,
        PropertyKind::CastSpeed,
        PropertyKind::AttackPower,
        PropertyKind::SpellPower,
        PropertyKind::HealthCapacity,
        PropertyKind::FocusCapacity,
        PropertyKind::HealthRegen,
        PropertyKind::FocusRegen,
    ];

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EquipSlot {
    Head,
    Chest,
    Legs,
    Feet,
    Hands,
    WeaponMain,
    WeaponOff,
    Trinket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CastingId(pub u32);

/// One spell contribution to a property. `factor` and `term` compose per
/// the stacking rules in `recompute`; `priority` fixes evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpellModifier {
    pub priority: u32,
    pub factor: f32,
    pub term: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyUpdate {
    pub kind: PropertyKind,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct PropertyEntry {
    base: f32,
    value: f32,
}

#[derive(Debug, Default)]
pub struct PropertySet {
    entries: HashMap<PropertyKind, PropertyEntry>,
    item_contributions: HashMap<PropertyKind, BTreeMap<EquipSlot, f32>>,
    modifiers: HashMap<PropertyKind, BTreeMap<CastingId, SpellModifier>>,
    dirty: BTreeSet<PropertyKind>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(&self, kind: PropertyKind) -> f32 {
        self.entries.get(&kind).map(|entry| entry.base).unwrap_or(0.0)
    }

    /// Effective value as of the last flush.
    pub fn value(&self, kind: PropertyKind) -> f32 {
        self.entries
            .get(&kind)
            .map(|entry| entry.value)
            .unwrap_or(0.0)
    }

    pub fn is_dirty(&self, kind: PropertyKind) -> bool {
        self.dirty.contains(&kind)
    }

    pub fn set_base(&mut self, kind: PropertyKind, value: f32) {
        self.entries.entry(kind).or_default().base = value;
        self.dirty.insert(kind);
    }

    pub fn add_item_contribution(&mut self, kind: PropertyKind, slot: EquipSlot, value: f32) {
        self.item_contributions
            .entry(kind)
            .or_default()
            .insert(slot, value);
        self.dirty.insert(kind);
    }

    pub fn remove_item_contribution(&mut self, kind: PropertyKind, slot: EquipSlot) {
        if let Some(slots) = self.item_contributions.get_mut(&kind) {
            if slots.remove(&slot).is_some() {
                self.dirty.insert(kind);
            }
            if slots.is_empty() {
                self.item_contributions.remove(&kind);
            }
        }
    }

    pub fn add_spell_modifier(
        &mut self,
        kind: PropertyKind,
        casting: CastingId,
        modifier: SpellModifier,
    ) {
        self.modifiers
            .entry(kind)
            .or_default()
            .insert(casting, modifier);
        self.dirty.insert(kind);
    }

    pub fn remove_spell_modifier(&mut self, kind: PropertyKind, casting: CastingId) {
        if let Some(mods) = self.modifiers.get_mut(&kind) {
            if mods.remove(&casting).is_some() {
                self.dirty.insert(kind);
            }
            if mods.is_empty() {
                self.modifiers.remove(&kind);
            }
        }
    }

    /// Removes every modifier the casting instance contributed, across all
    /// property kinds, leaving other castings untouched.
    pub fn remove_casting_modifiers(&mut self, casting: CastingId) {
        let mut emptied = Vec::new();
        for (kind, mods) in self.modifiers.iter_mut() {
            if mods.remove(&casting).is_some() {
                self.dirty.insert(*kind);
            }
            if mods.is_empty() {
                emptied.push(*kind);
            }
        }
        for kind in emptied {
            self.modifiers.remove(&kind);
        }
    }

    /// Recomputes every dirty kind and returns the kinds whose effective
    /// value actually changed, in kind order. Clears the dirty set.
    pub fn flush(&mut self) -> Vec<PropertyUpdate> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut changed = Vec::new();
        for kind in dirty {
            let recomputed = self.recompute(kind);
            let entry = self.entries.entry(kind).or_default();
            if entry.value != recomputed {
                entry.value = recomputed;
                changed.push(PropertyUpdate {
                    kind,
                    value: recomputed,
                });
            }
        }
        changed
    }

    /// The stacking formula. Modifiers apply in ascending (priority,
    /// casting) order; the factor/term branch structure encodes how
    /// percentage, flat, and combined effects compose and must not be
    /// reordered.
    fn recompute(&self, kind: PropertyKind) -> f32 {
        let base = self.base(kind);
        let item_sum: f32 = self
            .item_contributions
            .get(&kind)
            .map(|slots| slots.values().sum())
            .unwrap_or(0.0);

        let mut value = base + item_sum;
        let Some(mods) = self.modifiers.get(&kind) else {
            return value;
        };
        let mut ordered: Vec<(&CastingId, &SpellModifier)> = mods.iter().collect();
        ordered.sort_by_key(|(casting, modifier)| (modifier.priority, casting.0));
        for (_, modifier) in ordered {
            if modifier.factor != 0.0 && modifier.term != 0.0 {
                value = value * modifier.factor + modifier.term;
            } else if modifier.term != 0.0 {
                if modifier.factor.fract() != 0.0 {
                    value *= modifier.term;
                } else {
                    value += modifier.term;
                }
            } else if modifier.factor != 0.0 {
                value *= modifier.factor;
            }
        }
        value
    }

    /// Base values for persistence; effective values are never saved.
    pub fn bases(&self) -> BTreeMap<PropertyKind, f32> {
        self.entries
            .iter()
            .map(|(kind, entry)| (*kind, entry.base))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(priority: u32, term: f32) -> SpellModifier {
        SpellModifier {
            priority,
            factor: 0.0,
            term,
        }
    }

    fn scale(priority: u32, factor: f32) -> SpellModifier {
        SpellModifier {
            priority,
            factor,
            term: 0.0,
        }
    }

    #[test]
    fn base_plus_item_times_factor() {
        let mut props = PropertySet::new();
        props.set_base(PropertyKind::HealthCapacity, 100.0);
        props.add_item_contribution(PropertyKind::HealthCapacity, EquipSlot::Chest, 20.0);
        props.add_spell_modifier(
            PropertyKind::HealthCapacity,
            CastingId(1),
            scale(0, 1.1),
        );
        let updates = props.flush();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].kind, PropertyKind::HealthCapacity);
        assert_eq!(updates[0].value, (100.0 + 20.0) * 1.1);
        assert_eq!(props.value(PropertyKind::HealthCapacity), 132.0);
    }

    #[test]
    fn flush_is_idempotent_and_order_independent() {
        let mut forward = PropertySet::new();
        forward.set_base(PropertyKind::Strength, 50.0);
        forward.add_item_contribution(PropertyKind::Strength, EquipSlot::Hands, 5.0);
        forward.add_item_contribution(PropertyKind::Strength, EquipSlot::Head, 3.0);
        forward.add_spell_modifier(PropertyKind::Strength, CastingId(1), scale(1, 2.0));
        forward.add_spell_modifier(PropertyKind::Strength, CastingId(2), flat(0, 10.0));

        let mut reversed = PropertySet::new();
        reversed.add_spell_modifier(PropertyKind::Strength, CastingId(2), flat(0, 10.0));
        reversed.add_spell_modifier(PropertyKind::Strength, CastingId(1), scale(1, 2.0));
        reversed.add_item_contribution(PropertyKind::Strength, EquipSlot::Head, 3.0);
        reversed.add_item_contribution(PropertyKind::Strength, EquipSlot::Hands, 5.0);
        reversed.set_base(PropertyKind::Strength, 50.0);

        let a = forward.flush();
        let b = reversed.flush();
        assert_eq!(a, b);
        // Flat +10 applies at priority 0, doubling at priority 1.
        assert_eq!(forward.value(PropertyKind::Strength), (58.0 + 10.0) * 2.0);
        assert!(forward.flush().is_empty());
    }

    #[test]
    fn combined_factor_and_term_apply_together() {
        let mut props = PropertySet::new();
        props.set_base(PropertyKind::Armor, 40.0);
        props.add_spell_modifier(
            PropertyKind::Armor,
            CastingId(9),
            SpellModifier {
                priority: 0,
                factor: 1.5,
                term: 7.0,
            },
        );
        props.flush();
        assert_eq!(props.value(PropertyKind::Armor), 40.0 * 1.5 + 7.0);
    }

    #[test]
    fn equal_priority_breaks_ties_by_casting() {
        let mut props = PropertySet::new();
        props.set_base(PropertyKind::AttackPower, 10.0);
        props.add_spell_modifier(PropertyKind::AttackPower, CastingId(2), scale(5, 3.0));
        props.add_spell_modifier(PropertyKind::AttackPower, CastingId(1), flat(5, 4.0));
        props.flush();
        // CastingId(1) applies first at the shared priority.
        assert_eq!(props.value(PropertyKind::AttackPower), (10.0 + 4.0) * 3.0);
    }

    #[test]
    fn remove_casting_modifiers_is_exact() {
        let mut props = PropertySet::new();
        props.set_base(PropertyKind::MoveSpeed, 7.0);
        props.set_base(PropertyKind::CastSpeed, 1.0);
        props.add_spell_modifier(PropertyKind::MoveSpeed, CastingId(1), scale(0, 1.5));
        props.add_spell_modifier(PropertyKind::MoveSpeed, CastingId(2), flat(1, 2.0));
        props.add_spell_modifier(PropertyKind::CastSpeed, CastingId(1), flat(0, 0.2));
        props.flush();

        props.remove_casting_modifiers(CastingId(1));
        let updates = props.flush();
        assert_eq!(updates.len(), 2);
        assert_eq!(props.value(PropertyKind::MoveSpeed), 7.0 + 2.0);
        assert_eq!(props.value(PropertyKind::CastSpeed), 1.0);
    }

    #[test]
    fn flush_reports_only_changed_kinds() {
        let mut props = PropertySet::new();
        props.set_base(PropertyKind::Stamina, 25.0);
        props.flush();

        // Re-marking dirty without changing inputs produces no update.
        props.set_base(PropertyKind::Stamina, 25.0);
        assert!(props.flush().is_empty());

        props.add_item_contribution(PropertyKind::Stamina, EquipSlot::Legs, 0.0);
        assert!(props.flush().is_empty());
    }

    #[test]
    fn item_contribution_replaces_per_slot() {
        let mut props = PropertySet::new();
        props.set_base(PropertyKind::Armor, 10.0);
        props.add_item_contribution(PropertyKind::Armor, EquipSlot::Chest, 8.0);
        props.flush();
        props.add_item_contribution(PropertyKind::Armor, EquipSlot::Chest, 12.0);
        props.flush();
        assert_eq!(props.value(PropertyKind::Armor), 22.0);
        props.remove_item_contribution(PropertyKind::Armor, EquipSlot::Chest);
        props.flush();
        assert_eq!(props.value(PropertyKind::Armor), 10.0);
    }

    #[test]
    fn property_kind_raw_roundtrip() {
        for kind in PropertyKind::ALL {
            assert_eq!(PropertyKind::from_raw(kind.raw()), Some(kind));
        }
        assert_eq!(PropertyKind::from_raw(0xff), None);
    }
}
