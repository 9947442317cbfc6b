use crate::combat::engagement::CombatState;
use crate::combat::procs::ProcTracker;
use crate::combat::spells::SpellBook;
use crate::combat::threat::ThreatList;
use crate::entities::death::DeathState;
use crate::entities::properties::{PropertyKind, PropertySet};
use crate::net::session::SessionId;
use crate::world::position::Position;
use crate::world::visibility::VisibilityState;
use serde::{Deserialize, Serialize};

/// Partition-scoped handle. Stable only within one map's lifetime; holders
/// must re-resolve through the map before every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Player,
    Npc,
    Pet,
    Ghost,
    Prop,
}

impl EntityKind {
    pub fn raw(self) -> u8 {
        match self {
            EntityKind::Player => 0,
            EntityKind::Npc => 1,
            EntityKind::Pet => 2,
            EntityKind::Ghost => 3,
            EntityKind::Prop => 4,
        }
    }

    pub fn can_be_attacked(self) -> bool {
        matches!(self, EntityKind::Player | EntityKind::Npc | EntityKind::Pet)
    }

    pub fn has_threat_ai(self) -> bool {
        matches!(self, EntityKind::Npc | EntityKind::Pet)
    }

    pub fn controls_another(self) -> bool {
        matches!(self, EntityKind::Player)
    }

    /// Player-controlled entities never reach the terminal dead state;
    /// they resurrect out of corpse instead.
    pub fn is_player_controlled(self) -> bool {
        matches!(self, EntityKind::Player)
    }
}

#[derive(Debug)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    /// Catalog id this entity was spawned from; players have none.
    pub template_id: Option<u32>,
    /// Session receiving this entity's view of the world, players only.
    pub session: Option<SessionId>,
    pub position: Position,
    pub death: DeathState,
    pub combat: CombatState,
    pub properties: PropertySet,
    pub health: f32,
    pub focus: f32,
    pub threat: ThreatList,
    pub spells: SpellBook,
    pub procs: ProcTracker,
    pub visibility: VisibilityState,
    /// Handle of the controlling entity, pets only; resolved through the
    /// map at time of use.
    pub owner: Option<EntityId>,
    pub pets: Vec<EntityId>,
    pub loot: Vec<u32>,
    pub dirty_since_save: bool,
}

impl Entity {
    pub fn new(id: EntityId, kind: EntityKind, name: String, position: Position) -> Self {
        Self {
            id,
            kind,
            name,
            template_id: None,
            session: None,
            position,
            death: DeathState::JustSpawned,
            combat: CombatState::new(),
            properties: PropertySet::new(),
            health: 0.0,
            focus: 0.0,
            threat: ThreatList::new(),
            spells: SpellBook::new(),
            procs: ProcTracker::new(),
            visibility: VisibilityState::new(),
            owner: None,
            pets: Vec::new(),
            loot: Vec::new(),
            dirty_since_save: false,
        }
    }

    pub fn is_player(&self) -> bool {
        self.kind == EntityKind::Player
    }

    pub fn is_alive(&self) -> bool {
        self.death.is_alive()
    }

    pub fn mark_dirty_for_save(&mut self) {
        self.dirty_since_save = true;
    }

    pub fn health_capacity(&self) -> f32 {
        self.properties.value(PropertyKind::HealthCapacity)
    }

    pub fn focus_capacity(&self) -> f32 {
        self.properties.value(PropertyKind::FocusCapacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_capabilities() {
        assert!(EntityKind::Player.can_be_attacked());
        assert!(EntityKind::Npc.can_be_attacked());
        assert!(!EntityKind::Ghost.can_be_attacked());
        assert!(!EntityKind::Prop.can_be_attacked());

        assert!(EntityKind::Npc.has_threat_ai());
        assert!(!EntityKind::Player.has_threat_ai());

        assert!(EntityKind::Player.is_player_controlled());
        assert!(!EntityKind::Pet.is_player_controlled());
    }

    #[test]
    fn new_entity_spawns_in_edge_state() {
        let entity = Entity::new(
            EntityId(1),
            EntityKind::Npc,
            "Mire Stalker".to_string(),
            Position::default(),
        );
        assert_eq!(entity.death, DeathState::JustSpawned);
        assert!(!entity.combat.in_combat());
        assert!(!entity.dirty_since_save);
    }
}
