use crate::catalog::{CatalogError, ContentCatalog};
use crate::combat::procs::{ProcApplyError, ProcKind};
use crate::combat::spells::{SpellEvent, SpellEventKind, SpellExecution};
use crate::config::WorldSettings;
use crate::entities::death::DeathState;
use crate::entities::entity::{Entity, EntityId, EntityKind};
use crate::entities::properties::{CastingId, PropertyKind, SpellModifier};
use crate::entities::vitals::{VitalKind, VitalTable};
use crate::net::messages;
use crate::net::session::{SessionHub, SessionId};
use crate::telemetry::logging;
use crate::world::grid::SpatialGrid;
use crate::world::position::Position;
use crate::world::scheduler::{TimedAction, TimerWheel};
use crate::world::time::{GameClock, GameTick};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Data-integrity faults: fatal to the operation that found them, logged
/// loudly, never allowed to take the tick down for other maps.
#[derive(Debug)]
pub enum WorldError {
    EntityNotFound(EntityId),
    Invariant(String),
    Content(CatalogError),
}

impl std::fmt::Display for WorldError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WorldError::EntityNotFound(id) => write!(f, "entity {} not found", id.0),
            WorldError::Invariant(message) => write!(f, "invariant violated: {}", message),
            WorldError::Content(err) => write!(f, "{}", err),
        }
    }
}

impl From<CatalogError> for WorldError {
    fn from(err: CatalogError) -> Self {
        WorldError::Content(err)
    }
}

/// Transient gameplay rejections: typed, synchronous, never logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionError {
    OutOfRange,
    OnCooldown,
    InsufficientFocus,
    InvalidTarget,
    NotAlive,
}

impl ActionError {
    pub fn code(self) -> u8 {
        match self {
            ActionError::OutOfRange => 1,
            ActionError::OnCooldown => 2,
            ActionError::InsufficientFocus => 3,
            ActionError::InvalidTarget => 4,
            ActionError::NotAlive => 5,
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            ActionError::OutOfRange => "target out of range",
            ActionError::OnCooldown => "action not ready",
            ActionError::InsufficientFocus => "not enough focus",
            ActionError::InvalidTarget => "invalid target",
            ActionError::NotAlive => "must be alive",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
pub enum CastError {
    Action(ActionError),
    World(WorldError),
}

impl From<ActionError> for CastError {
    fn from(err: ActionError) -> Self {
        CastError::Action(err)
    }
}

impl From<WorldError> for CastError {
    fn from(err: WorldError) -> Self {
        CastError::World(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeathEdge {
    pub entity: EntityId,
    pub state: DeathState,
}

const MELEE_RANGE: f32 = 5.0;

#[derive(Debug, Clone, Copy)]
struct RespawnInfo {
    template_id: u32,
    position: Position,
}

/// One world partition: exclusive owner of its entities, its spatial
/// index, and its timers. All mutation is serialized through the owning
/// lock; other maps are never touched from here.
pub struct MapInstance {
    label: String,
    settings: Arc<WorldSettings>,
    catalog: Arc<dyn ContentCatalog>,
    hub: Arc<SessionHub>,
    vitals: VitalTable,
    entities: HashMap<EntityId, Entity>,
    grid: SpatialGrid,
    timers: TimerWheel,
    respawn_info: HashMap<EntityId, RespawnInfo>,
    next_guid: u32,
    next_casting: u32,
    last_player_activity: Instant,
}

impl MapInstance {
    pub fn new(
        label: String,
        settings: Arc<WorldSettings>,
        catalog: Arc<dyn ContentCatalog>,
        hub: Arc<SessionHub>,
    ) -> Self {
        let cell = settings.grid_cell_size;
        Self {
            label,
            settings,
            catalog,
            hub,
            vitals: VitalTable::standard(),
            entities: HashMap::new(),
            grid: SpatialGrid::new(cell),
            timers: TimerWheel::new(),
            respawn_info: HashMap::new(),
            next_guid: 1,
            next_casting: 1,
            last_player_activity: Instant::now(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn player_count(&self) -> usize {
        self.entities
            .values()
            .filter(|entity| entity.is_player())
            .count()
    }

    /// Private instances are torn down once no player has been present for
    /// the configured idle window.
    pub fn idle_since(&self) -> Instant {
        self.last_player_activity
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Players changed since their last snapshot; the persistence pass
    /// clears the marker as it takes snapshots.
    pub fn dirty_players_mut(&mut self) -> Vec<&mut Entity> {
        self.entities
            .values_mut()
            .filter(|entity| entity.is_player() && entity.dirty_since_save)
            .collect()
    }

    pub fn find_player_by_session(&self, session: SessionId) -> Option<EntityId> {
        self.entities
            .values()
            .find(|entity| entity.session == Some(session))
            .map(|entity| entity.id)
    }

    pub fn player_ids(&self) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|entity| entity.is_player())
            .map(|entity| entity.id)
            .collect()
    }

    /// Applies a saved snapshot onto a freshly spawned player and keeps
    /// the spatial index in step with the restored position.
    pub fn restore_player(&mut self, id: EntityId, snapshot: &crate::persistence::snapshot::EntitySnapshot) {
        let position = {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            crate::persistence::snapshot::restore_snapshot(entity, snapshot);
            entity.position
        };
        self.grid.relocate(id, position);
    }

    fn allocate_guid(&mut self) -> EntityId {
        let id = EntityId(self.next_guid);
        self.next_guid = self.next_guid.wrapping_add(1).max(1);
        id
    }

    fn allocate_casting(&mut self) -> CastingId {
        let id = CastingId(self.next_casting);
        self.next_casting = self.next_casting.wrapping_add(1).max(1);
        id
    }

    pub fn spawn_player(
        &mut self,
        name: String,
        session: SessionId,
        position: Position,
    ) -> Result<EntityId, WorldError> {
        let id = self.allocate_guid();
        let mut entity = Entity::new(id, EntityKind::Player, name, position);
        entity.session = Some(session);
        entity.properties.set_base(PropertyKind::HealthCapacity, 100.0);
        entity.properties.set_base(PropertyKind::FocusCapacity, 50.0);
        entity.properties.set_base(PropertyKind::MoveSpeed, 7.0);
        entity.properties.flush();
        entity.health = entity.health_capacity();
        entity.focus = entity.focus_capacity();
        self.grid.insert(id, position);
        self.entities.insert(id, entity);
        self.advance_death_state(id, DeathState::Alive, GameTick(0))?;
        self.hub
            .send(session, messages::build_world_joined(id, position));
        self.last_player_activity = Instant::now();
        Ok(id)
    }

    pub fn spawn_creature(
        &mut self,
        template_id: u32,
        position: Position,
    ) -> Result<EntityId, WorldError> {
        let id = self.allocate_guid();
        self.spawn_creature_with_guid(id, template_id, position)?;
        Ok(id)
    }

    fn spawn_creature_with_guid(
        &mut self,
        id: EntityId,
        template_id: u32,
        position: Position,
    ) -> Result<(), WorldError> {
        let template = self.catalog.creature(template_id)?;
        let mut entity = Entity::new(id, EntityKind::Npc, template.name.clone(), position);
        entity.template_id = Some(template_id);
        for (kind, value) in &template.base_properties {
            entity.properties.set_base(*kind, *value);
        }
        entity.properties.flush();
        entity.health = entity.health_capacity();
        entity.focus = entity.focus_capacity();
        entity.loot = template.loot.clone();
        self.grid.insert(id, position);
        self.entities.insert(id, entity);
        self.advance_death_state(id, DeathState::Alive, GameTick(0))?;
        Ok(())
    }

    /// Spawns a controlled entity bound to its owner; removed with it.
    pub fn spawn_pet(
        &mut self,
        owner: EntityId,
        template_id: u32,
        position: Position,
    ) -> Result<EntityId, WorldError> {
        if !self
            .entities
            .get(&owner)
            .ok_or(WorldError::EntityNotFound(owner))?
            .kind
            .controls_another()
        {
            return Err(WorldError::Invariant(format!(
                "entity {} cannot control another entity",
                owner.0
            )));
        }
        let id = self.spawn_creature(template_id, position)?;
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.kind = EntityKind::Pet;
            entity.owner = Some(owner);
        }
        if let Some(entity) = self.entities.get_mut(&owner) {
            entity.pets.push(id);
        }
        Ok(id)
    }

    pub fn remove_entity(&mut self, id: EntityId) {
        let Some(entity) = self.entities.remove(&id) else {
            return;
        };
        self.broadcast_to_observers(id, &messages::build_entity_disappear(id));
        self.grid.remove(id);
        self.timers.cancel(id);
        for other in self.entities.values_mut() {
            other.visibility.forget(id);
            other.threat.remove(id);
            other.pets.retain(|pet| *pet != id);
            if other.owner == Some(id) {
                other.owner = None;
            }
        }
        for pet in entity.pets {
            self.remove_entity(pet);
        }
    }

    /// Ordered death transition with immediate cascades. Every state
    /// entered produces one edge and one broadcast; a player-controlled
    /// entity reaching the terminal state is a fatal invariant violation.
    pub fn advance_death_state(
        &mut self,
        id: EntityId,
        state: DeathState,
        now: GameTick,
    ) -> Result<Vec<DeathEdge>, WorldError> {
        let mut edges = Vec::new();
        let mut pending = Some(state);
        while let Some(next) = pending.take() {
            let (kind, current) = {
                let entity = self
                    .entities
                    .get(&id)
                    .ok_or(WorldError::EntityNotFound(id))?;
                (entity.kind, entity.death)
            };
            if !current.allows(next) {
                return Err(WorldError::Invariant(format!(
                    "entity {} death transition {:?} -> {:?}",
                    id.0, current, next
                )));
            }
            if next == DeathState::Dead && kind.is_player_controlled() {
                let message = format!(
                    "player entity {} reached terminal dead state on {}",
                    id.0, self.label
                );
                logging::log_error(&message);
                return Err(WorldError::Invariant(message));
            }

            if let Some(entity) = self.entities.get_mut(&id) {
                entity.death = next;
                entity.mark_dirty_for_save();
            }
            edges.push(DeathEdge { entity: id, state: next });
            self.broadcast_to_observers(id, &messages::build_death_state(id, next));

            match next {
                DeathState::JustSpawned => {
                    self.timers.cancel(id);
                    if let Some(entity) = self.entities.get_mut(&id) {
                        entity.threat.clear();
                    }
                }
                DeathState::JustDied => {
                    let events = {
                        let entity = self.entities.get_mut(&id).expect("checked above");
                        entity.threat.clear();
                        entity.spells.cancel_all()
                    };
                    self.apply_spell_events(events, now);
                    if let Some(entity) = self.entities.get_mut(&id) {
                        entity.spells.purge_finished();
                    }
                }
                DeathState::Corpse => {
                    let (loot_empty, decay_ticks) = self.corpse_timing(id)?;
                    if loot_empty {
                        pending = Some(DeathState::CorpseLooted);
                    } else {
                        self.timers
                            .schedule(id, TimedAction::CorpseDecay, decay_ticks, now);
                    }
                }
                DeathState::CorpseLooted => {
                    let (_, removal_ticks) = self.removal_timing(id)?;
                    self.timers
                        .schedule(id, TimedAction::CorpseRemoval, removal_ticks, now);
                }
                DeathState::Dead => {
                    let respawn = self.entities.get(&id).and_then(|entity| {
                        let template_id = entity.template_id?;
                        Some((template_id, entity.position))
                    });
                    self.remove_entity(id);
                    if let Some((template_id, position)) = respawn {
                        let respawn_ticks = self.catalog.creature(template_id)?.respawn_ticks;
                        if respawn_ticks > 0 {
                            let guid = self.allocate_guid();
                            self.respawn_info.insert(
                                guid,
                                RespawnInfo {
                                    template_id,
                                    position,
                                },
                            );
                            self.timers
                                .schedule(guid, TimedAction::Respawn, respawn_ticks, now);
                        }
                    }
                    break;
                }
                DeathState::Alive => {}
            }

            if pending.is_none() {
                pending = next.cascade();
            }
        }
        Ok(edges)
    }

    fn corpse_timing(&self, id: EntityId) -> Result<(bool, u64), WorldError> {
        let entity = self
            .entities
            .get(&id)
            .ok_or(WorldError::EntityNotFound(id))?;
        let loot_empty = entity.loot.is_empty();
        let decay = match entity.template_id {
            Some(template_id) => self.catalog.creature(template_id)?.corpse_decay_ticks,
            None => 600,
        };
        Ok((loot_empty, decay))
    }

    fn removal_timing(&self, id: EntityId) -> Result<(bool, u64), WorldError> {
        let entity = self
            .entities
            .get(&id)
            .ok_or(WorldError::EntityNotFound(id))?;
        let removal = match entity.template_id {
            Some(template_id) => self.catalog.creature(template_id)?.removal_ticks,
            None => 100,
        };
        Ok((entity.loot.is_empty(), removal))
    }

    /// Applies a health delta, clamped to [0, capacity]. Crossing zero
    /// while alive runs the death cascade inside this same call; turning
    /// positive in a corpse state resurrects a player-controlled entity.
    pub fn modify_health(
        &mut self,
        id: EntityId,
        delta: f32,
        now: GameTick,
    ) -> Result<Vec<DeathEdge>, WorldError> {
        let (new_health, was_alive, was_corpse_like, player_controlled) = {
            let entity = self
                .entities
                .get_mut(&id)
                .ok_or(WorldError::EntityNotFound(id))?;
            let capacity = entity.health_capacity().max(0.0);
            let was_alive = entity.death.is_alive();
            let was_corpse_like = entity.death.is_corpse_like();
            let new_health = (entity.health + delta).clamp(0.0, capacity);
            entity.health = new_health;
            entity.mark_dirty_for_save();
            (
                new_health,
                was_alive,
                was_corpse_like,
                entity.kind.is_player_controlled(),
            )
        };
        self.broadcast_to_observers(
            id,
            &messages::build_vital_update(id, VitalKind::Health, new_health),
        );
        if new_health <= 0.0 && was_alive {
            self.advance_death_state(id, DeathState::JustDied, now)
        } else if new_health > 0.0 && was_corpse_like && player_controlled {
            self.advance_death_state(id, DeathState::JustSpawned, now)
        } else {
            Ok(Vec::new())
        }
    }

    fn resurrect(&mut self, id: EntityId, now: GameTick) -> Result<Vec<DeathEdge>, WorldError> {
        let half = {
            let entity = self
                .entities
                .get(&id)
                .ok_or(WorldError::EntityNotFound(id))?;
            (entity.health_capacity() / 2.0).max(1.0)
        };
        self.modify_health(id, half, now)
    }

    /// Accumulates threat and engages the holder's combat machine the
    /// moment its list becomes non-empty.
    pub fn add_threat(
        &mut self,
        id: EntityId,
        hostile: EntityId,
        amount: f32,
    ) -> Result<(), WorldError> {
        let edge = {
            let entity = self
                .entities
                .get_mut(&id)
                .ok_or(WorldError::EntityNotFound(id))?;
            entity.threat.add(hostile, amount);
            entity.combat.engage()
        };
        if edge.is_some() {
            self.broadcast_to_observers(id, &messages::build_combat_flag(id, true));
        }
        Ok(())
    }

    /// Relocates the entity and interrupts any movement-interruptible
    /// casts still in their cast phase.
    pub fn move_entity(
        &mut self,
        id: EntityId,
        position: Position,
        now: GameTick,
    ) -> Result<(), WorldError> {
        let events = {
            let entity = self
                .entities
                .get_mut(&id)
                .ok_or(WorldError::EntityNotFound(id))?;
            entity.position = position;
            entity.mark_dirty_for_save();
            entity.spells.cancel_interruptible_casts()
        };
        self.grid.relocate(id, position);
        self.apply_spell_events(events, now);
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.spells.purge_finished();
        }
        Ok(())
    }

    pub fn cast_spell(
        &mut self,
        caster: EntityId,
        spell_id: u32,
        target: Option<EntityId>,
    ) -> Result<CastingId, CastError> {
        let template = self.catalog.spell(spell_id).map_err(WorldError::from)?;
        let (caster_alive, caster_position, caster_focus, already_casting) = {
            let entity = self
                .entities
                .get(&caster)
                .ok_or(WorldError::EntityNotFound(caster))?;
            (
                entity.is_alive(),
                entity.position,
                entity.focus,
                entity.spells.is_casting_spell(spell_id),
            )
        };
        if !caster_alive {
            return Err(ActionError::NotAlive.into());
        }
        if already_casting {
            return Err(ActionError::OnCooldown.into());
        }

        let target_id = target.unwrap_or(caster);
        let (target_attackable, target_alive, target_position) = {
            let entity = self
                .entities
                .get(&target_id)
                .ok_or(CastError::Action(ActionError::InvalidTarget))?;
            (entity.kind.can_be_attacked(), entity.is_alive(), entity.position)
        };
        if template.damage > 0.0 && (!target_attackable || !target_alive) {
            return Err(ActionError::InvalidTarget.into());
        }
        if !caster_position.within_radius(target_position, self.settings.vision_range) {
            return Err(ActionError::OutOfRange.into());
        }
        if caster_focus < template.focus_cost {
            return Err(ActionError::InsufficientFocus.into());
        }

        let casting = self.allocate_casting();
        let new_focus = {
            let entity = self.entities.get_mut(&caster).expect("checked above");
            entity.focus -= template.focus_cost;
            entity.mark_dirty_for_save();
            entity.spells.cast(SpellExecution::new(
                casting,
                spell_id,
                caster,
                target_id,
                Arc::clone(&template),
            ));
            entity.focus
        };
        if template.focus_cost > 0.0 {
            self.broadcast_to_observers(
                caster,
                &messages::build_vital_update(caster, VitalKind::Focus, new_focus),
            );
        }
        Ok(casting)
    }

    /// Auto-attack swing: flat damage from attack power, melee range only.
    pub fn basic_attack(
        &mut self,
        attacker: EntityId,
        target: EntityId,
        now: GameTick,
    ) -> Result<(), CastError> {
        let (alive, position, power) = {
            let entity = self
                .entities
                .get(&attacker)
                .ok_or(WorldError::EntityNotFound(attacker))?;
            (
                entity.is_alive(),
                entity.position,
                entity.properties.value(PropertyKind::AttackPower),
            )
        };
        if !alive {
            return Err(ActionError::NotAlive.into());
        }
        let (target_attackable, target_alive, target_position) = {
            let entity = self
                .entities
                .get(&target)
                .ok_or(CastError::Action(ActionError::InvalidTarget))?;
            (entity.kind.can_be_attacked(), entity.is_alive(), entity.position)
        };
        if !target_attackable || !target_alive || target == attacker {
            return Err(ActionError::InvalidTarget.into());
        }
        if !position.within_radius(target_position, MELEE_RANGE) {
            return Err(ActionError::OutOfRange.into());
        }

        let damage = power.max(1.0);
        let _ = self.add_threat(target, attacker, damage);
        let _ = self.add_threat(attacker, target, 0.0);
        self.fire_procs(attacker, ProcKind::OnHit, now);
        self.fire_procs(target, ProcKind::OnDamaged, now);
        let edges = self.modify_health(target, -damage, now)?;
        if edges.iter().any(|edge| edge.state == DeathState::JustDied) {
            self.fire_procs(attacker, ProcKind::OnKill, now);
        }
        Ok(())
    }

    pub fn cancel_casting(&mut self, id: EntityId, casting: CastingId, now: GameTick) {
        let events = match self.entities.get_mut(&id) {
            Some(entity) => entity.spells.cancel_casting(casting),
            None => return,
        };
        self.apply_spell_events(events, now);
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.spells.purge_finished();
        }
    }

    /// Ends every non-casting execution of this spell on the entity, the
    /// removal path for expiring buffs.
    pub fn finish_spell(&mut self, id: EntityId, spell_id: u32, now: GameTick) {
        let events = match self.entities.get_mut(&id) {
            Some(entity) => entity.spells.finish_spell(spell_id),
            None => return,
        };
        self.apply_spell_events(events, now);
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.spells.purge_finished();
        }
    }

    /// Applies spell lifecycle events: begun casts land damage, modifiers,
    /// and proc grants; ended casts take their modifiers and watchers back
    /// off. Follow-on events (proc-triggered casts ending, deaths) are
    /// worked off the same queue.
    fn apply_spell_events(&mut self, events: Vec<SpellEvent>, now: GameTick) {
        let mut queue: VecDeque<SpellEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            match event.kind {
                SpellEventKind::Begun => self.apply_begun(&event, now),
                SpellEventKind::Ended => {
                    let followup = self.apply_ended(&event);
                    queue.extend(followup);
                }
            }
        }
    }

    fn apply_begun(&mut self, event: &SpellEvent, now: GameTick) {
        let template = &event.template;

        if !template.modifiers.is_empty() {
            if let Some(target) = self.entities.get_mut(&event.target) {
                for def in &template.modifiers {
                    target.properties.add_spell_modifier(
                        def.property,
                        event.casting,
                        SpellModifier {
                            priority: def.priority,
                            factor: def.factor,
                            term: def.term,
                        },
                    );
                }
                target.mark_dirty_for_save();
            }
        }

        if let Some(grant) = &template.proc {
            if let Some(target) = self.entities.get_mut(&event.target) {
                match target.procs.apply(
                    grant.category,
                    event.spell_id,
                    grant.linked_spell,
                    grant.period_ticks,
                    now,
                ) {
                    Ok(_) | Err(ProcApplyError::DuplicateSource { .. }) => {}
                    Err(err @ ProcApplyError::UnknownCategory(_)) => {
                        logging::log_error(&format!(
                            "{}: spell {}: {}",
                            self.label, event.spell_id, err
                        ));
                    }
                }
            }
        }

        if template.damage > 0.0 && self.entities.contains_key(&event.target) {
            let threat = template.damage + template.threat;
            let _ = self.add_threat(event.target, event.caster, threat);
            let _ = self.add_threat(event.caster, event.target, 0.0);

            self.fire_procs(event.caster, ProcKind::OnHit, now);
            self.fire_procs(event.target, ProcKind::OnDamaged, now);

            match self.modify_health(event.target, -template.damage, now) {
                Ok(edges) => {
                    if edges
                        .iter()
                        .any(|edge| edge.state == DeathState::JustDied)
                    {
                        self.fire_procs(event.caster, ProcKind::OnKill, now);
                    }
                }
                Err(err) => logging::log_error(&format!("{}: {}", self.label, err)),
            }
        }
    }

    fn apply_ended(&mut self, event: &SpellEvent) -> Vec<SpellEvent> {
        if !event.effects_applied {
            return Vec::new();
        }
        if let Some(target) = self.entities.get_mut(&event.target) {
            target.properties.remove_casting_modifiers(event.casting);
            target.mark_dirty_for_save();
        }
        let Some(grant) = &event.template.proc else {
            return Vec::new();
        };
        let Some(kind) = ProcKind::from_raw(grant.category) else {
            return Vec::new();
        };
        let triggered = self
            .entities
            .get_mut(&event.target)
            .and_then(|target| target.procs.remove(kind, event.spell_id))
            .flatten();
        match triggered {
            Some(casting) => match self.entities.get_mut(&event.target) {
                Some(target) => target.spells.cancel_casting(casting),
                None => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// A proc condition fired for this entity; every armed watcher casts
    /// its linked spell at the owner.
    fn fire_procs(&mut self, owner: EntityId, kind: ProcKind, now: GameTick) {
        let fires = match self.entities.get_mut(&owner) {
            Some(entity) => entity.procs.fire(kind, now),
            None => return,
        };
        for fire in fires {
            let template = match self.catalog.spell(fire.linked_spell) {
                Ok(template) => template,
                Err(err) => {
                    logging::log_error(&format!("{}: proc effect: {}", self.label, err));
                    continue;
                }
            };
            let casting = self.allocate_casting();
            if let Some(entity) = self.entities.get_mut(&owner) {
                entity.spells.cast(SpellExecution::new(
                    casting,
                    fire.linked_spell,
                    owner,
                    owner,
                    template,
                ));
                entity
                    .procs
                    .record_triggered(kind, fire.source_spell, casting);
            }
        }
    }

    /// One partition tick: timers, per-entity state machines and spell
    /// passes, property flush with vital clamps, then visibility refresh.
    pub fn update(&mut self, clock: &GameClock) {
        let now = clock.now();

        while let Some((entity, action)) = self.timers.pop_due(now) {
            let result = match action {
                TimedAction::CorpseDecay => self
                    .advance_death_state(entity, DeathState::CorpseLooted, now)
                    .map(|_| ()),
                TimedAction::CorpseRemoval => {
                    let player = self
                        .entities
                        .get(&entity)
                        .map(|found| found.kind.is_player_controlled())
                        .unwrap_or(false);
                    if player {
                        self.resurrect(entity, now).map(|_| ())
                    } else {
                        self.advance_death_state(entity, DeathState::Dead, now)
                            .map(|_| ())
                    }
                }
                TimedAction::Respawn => match self.respawn_info.remove(&entity) {
                    Some(info) => {
                        self.spawn_creature_with_guid(entity, info.template_id, info.position)
                    }
                    None => Ok(()),
                },
            };
            if let Err(err) = result {
                logging::log_error(&format!("{}: timer {:?}: {}", self.label, action, err));
            }
        }

        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();

        for id in ids.iter().copied() {
            if !self.entities.contains_key(&id) {
                continue;
            }
            self.tick_combat_state(id);
            self.tick_spells(id, now);
            self.tick_regen(id, now);
        }

        self.flush_properties(&ids);
        self.refresh_visibility(&ids);

        if self.player_count() > 0 {
            self.last_player_activity = Instant::now();
        }
    }

    fn tick_combat_state(&mut self, id: EntityId) {
        let targets: Vec<EntityId> = match self.entities.get(&id) {
            Some(entity) => entity.threat.targets(),
            None => return,
        };
        let valid: HashSet<EntityId> = targets
            .into_iter()
            .filter(|target| {
                self.entities
                    .get(target)
                    .map(|entity| entity.is_alive())
                    .unwrap_or(false)
            })
            .collect();
        let edge = {
            let entity = self.entities.get_mut(&id).expect("probed above");
            entity.threat.retain_known(|target| valid.contains(&target));
            entity.combat.tick(!entity.threat.is_empty())
        };
        if let Some(edge) = edge {
            let flag = edge == crate::combat::engagement::CombatEdge::Entered;
            self.broadcast_to_observers(id, &messages::build_combat_flag(id, flag));
        }
    }

    fn tick_spells(&mut self, id: EntityId, now: GameTick) {
        let events = match self.entities.get_mut(&id) {
            Some(entity) => entity.spells.update_all(),
            None => return,
        };
        self.apply_spell_events(events, now);

        // Late pass sees post-update state: targets that died above are
        // gone from this set.
        let alive: HashSet<EntityId> = self
            .entities
            .iter()
            .filter(|(_, entity)| entity.is_alive())
            .map(|(entity_id, _)| *entity_id)
            .collect();
        let events = match self.entities.get_mut(&id) {
            Some(entity) => entity
                .spells
                .late_update_all(|target| !alive.contains(&target)),
            None => return,
        };
        self.apply_spell_events(events, now);

        if let Some(entity) = self.entities.get_mut(&id) {
            entity.spells.purge_finished();
        }
    }

    fn tick_regen(&mut self, id: EntityId, now: GameTick) {
        let regen = match self.entities.get(&id) {
            Some(entity) if entity.is_alive() => {
                let regen = entity.properties.value(PropertyKind::HealthRegen);
                let missing = entity.health_capacity() - entity.health;
                if regen > 0.0 && missing > 0.0 {
                    regen
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        if regen > 0.0 {
            if let Err(err) = self.modify_health(id, regen, now) {
                logging::log_error(&format!("{}: regen: {}", self.label, err));
            }
        }
    }

    fn flush_properties(&mut self, ids: &[EntityId]) {
        let mut batches = Vec::new();
        {
            let Self {
                entities, vitals, ..
            } = self;
            for id in ids.iter().copied() {
                let Some(entity) = entities.get_mut(&id) else {
                    continue;
                };
                let updates = entity.properties.flush();
                if updates.is_empty() {
                    continue;
                }
                let clamped = vitals.clamp_to_capacities(entity, &updates);
                batches.push((id, updates, clamped));
            }
        }
        for (id, updates, clamped) in batches {
            self.broadcast_to_observers(id, &messages::build_property_batch(id, &updates));
            for (vital, value) in clamped {
                self.broadcast_to_observers(id, &messages::build_vital_update(id, vital, value));
            }
        }
    }

    fn refresh_visibility(&mut self, ids: &[EntityId]) {
        for id in ids.iter().copied() {
            let Some(position) = self.entities.get(&id).map(|entity| entity.position) else {
                continue;
            };
            let session = self.entities.get(&id).and_then(|entity| entity.session);

            let nearby: HashSet<EntityId> = self
                .grid
                .query_range(position, self.settings.vision_range)
                .into_iter()
                .filter(|other| *other != id)
                .collect();
            let in_trigger: HashSet<EntityId> = self
                .grid
                .query_range(position, self.settings.trigger_radius)
                .into_iter()
                .filter(|other| *other != id)
                .collect();

            let known: Vec<EntityId> = match self.entities.get(&id) {
                Some(entity) => entity
                    .visibility
                    .visible()
                    .chain(nearby.iter().copied())
                    .collect(),
                None => continue,
            };
            let in_range_before: Vec<EntityId> = match self.entities.get(&id) {
                Some(entity) => known
                    .iter()
                    .copied()
                    .filter(|other| entity.visibility.is_in_range(*other))
                    .collect(),
                None => continue,
            };

            let mut appears = Vec::new();
            let mut disappears = Vec::new();
            let mut entered = Vec::new();
            {
                let entity = self.entities.get_mut(&id).expect("probed above");
                for other in &known {
                    match entity.visibility.set_visible(*other, nearby.contains(other)) {
                        Some(crate::world::visibility::VisibilityEdge::Appear) => {
                            appears.push(*other)
                        }
                        Some(crate::world::visibility::VisibilityEdge::Disappear) => {
                            disappears.push(*other)
                        }
                        None => {}
                    }
                }
                for other in known.iter().chain(in_range_before.iter()) {
                    if let Some(crate::world::visibility::RangeEdge::Enter) = entity
                        .visibility
                        .apply_range_triggers(*other, in_trigger.contains(other))
                    {
                        entered.push(*other);
                    }
                }
            }

            if let Some(session) = session {
                for other in disappears {
                    self.hub
                        .send(session, messages::build_entity_disappear(other));
                }
                for other in &appears {
                    if let Some(found) = self.entities.get(other) {
                        self.hub.send(
                            session,
                            messages::build_entity_appear(
                                found.id,
                                found.kind,
                                &found.name,
                                found.position,
                            ),
                        );
                    }
                }
            }

            // Gameplay hook on trigger entry: hostile AI picks up anything
            // attackable stepping into range.
            for other in entered {
                let aggro = {
                    let holder = self.entities.get(&id);
                    let victim = self.entities.get(&other);
                    match (holder, victim) {
                        (Some(holder), Some(victim)) => {
                            holder.kind.has_threat_ai()
                                && holder.is_alive()
                                && victim.kind.can_be_attacked()
                                && victim.is_alive()
                                && !victim.kind.has_threat_ai()
                        }
                        _ => false,
                    }
                };
                if aggro {
                    let _ = self.add_threat(id, other, 1.0);
                }
            }
        }
    }

    fn broadcast_to_observers(&self, subject: EntityId, message: &[u8]) {
        for entity in self.entities.values() {
            if !entity.is_player() {
                continue;
            }
            let Some(session) = entity.session else {
                continue;
            };
            if entity.id == subject || entity.visibility.can_see(subject) {
                self.hub.send(session, message.to_vec());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CreatureTemplate, MemoryCatalog, SpellTemplate};
    use crate::net::session::Outbox;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn settings() -> Arc<WorldSettings> {
        let mut settings = WorldSettings::default();
        settings.vision_range = 50.0;
        settings.trigger_radius = 10.0;
        Arc::new(settings)
    }

    fn catalog() -> Arc<MemoryCatalog> {
        let mut catalog = MemoryCatalog::new();
        let mut base = BTreeMap::new();
        base.insert(PropertyKind::HealthCapacity, 100.0);
        catalog.insert_creature(
            1,
            CreatureTemplate {
                name: "Mire Stalker".to_string(),
                base_properties: base.clone(),
                loot: vec![5],
                corpse_decay_ticks: 5,
                removal_ticks: 5,
                respawn_ticks: 10,
            },
        );
        catalog.insert_creature(
            2,
            CreatureTemplate {
                name: "Bog Wisp".to_string(),
                base_properties: base,
                loot: Vec::new(),
                corpse_decay_ticks: 5,
                removal_ticks: 5,
                respawn_ticks: 0,
            },
        );
        catalog.insert_spell(
            10,
            SpellTemplate {
                name: "Spark".to_string(),
                cast_ticks: 1,
                duration_ticks: 0,
                interruptible: true,
                damage: 30.0,
                focus_cost: 5.0,
                threat: 0.0,
                modifiers: Vec::new(),
                proc: None,
            },
        );
        catalog.insert_spell(
            11,
            SpellTemplate {
                name: "Ironhide".to_string(),
                cast_ticks: 0,
                duration_ticks: 20,
                interruptible: false,
                damage: 0.0,
                focus_cost: 0.0,
                threat: 0.0,
                modifiers: vec![crate::catalog::SpellModifierDef {
                    property: PropertyKind::HealthCapacity,
                    priority: 0,
                    factor: 1.1,
                    term: 0.0,
                }],
                proc: None,
            },
        );
        Arc::new(catalog)
    }

    fn map() -> (MapInstance, Arc<SessionHub>) {
        let hub = Arc::new(SessionHub::new());
        let map = MapInstance::new(
            "world 1".to_string(),
            settings(),
            catalog(),
            Arc::clone(&hub),
        );
        (map, hub)
    }

    fn opcodes(outbox: &Outbox) -> Vec<u16> {
        outbox
            .drain()
            .iter()
            .map(|framed| u16::from_le_bytes([framed[2], framed[3]]))
            .collect()
    }

    fn ticked(clock: &mut GameClock) -> GameClock {
        clock.advance(1);
        clock.clone()
    }

    #[test]
    fn lethal_damage_cascades_within_one_call() {
        let (mut map, _hub) = map();
        let npc = map.spawn_creature(1, Position::default()).expect("spawn");
        map.modify_health(npc, -50.0, GameTick(1)).expect("damage");
        assert_eq!(map.entity(npc).unwrap().health, 50.0);

        let edges = map.modify_health(npc, -50.0, GameTick(2)).expect("kill");
        let states: Vec<DeathState> = edges.iter().map(|edge| edge.state).collect();
        assert_eq!(states, vec![DeathState::JustDied, DeathState::Corpse]);
        assert_eq!(
            edges
                .iter()
                .filter(|edge| edge.state == DeathState::JustDied)
                .count(),
            1
        );
        assert_eq!(map.entity(npc).unwrap().death, DeathState::Corpse);
    }

    #[test]
    fn lootless_corpse_skips_to_looted() {
        let (mut map, _hub) = map();
        let npc = map.spawn_creature(2, Position::default()).expect("spawn");
        let edges = map.modify_health(npc, -100.0, GameTick(1)).expect("kill");
        let states: Vec<DeathState> = edges.iter().map(|edge| edge.state).collect();
        assert_eq!(
            states,
            vec![
                DeathState::JustDied,
                DeathState::Corpse,
                DeathState::CorpseLooted
            ]
        );
    }

    #[test]
    fn player_never_reaches_terminal_dead() {
        let (mut map, _hub) = map();
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        map.modify_health(player, -100.0, GameTick(1)).expect("kill");
        assert_eq!(map.entity(player).unwrap().death, DeathState::CorpseLooted);

        let err = map
            .advance_death_state(player, DeathState::Dead, GameTick(2))
            .unwrap_err();
        assert!(matches!(err, WorldError::Invariant(_)));
        // The entity is still there, still a corpse.
        assert_eq!(map.entity(player).unwrap().death, DeathState::CorpseLooted);
    }

    #[test]
    fn player_corpse_resurrects_on_positive_health() {
        let (mut map, _hub) = map();
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        map.modify_health(player, -100.0, GameTick(1)).expect("kill");

        let edges = map.modify_health(player, 40.0, GameTick(5)).expect("raise");
        let states: Vec<DeathState> = edges.iter().map(|edge| edge.state).collect();
        assert_eq!(states, vec![DeathState::JustSpawned, DeathState::Alive]);
        assert!(map.entity(player).unwrap().is_alive());
        assert_eq!(map.entity(player).unwrap().health, 40.0);
    }

    #[test]
    fn corpse_decays_then_respawns_through_timers() {
        let (mut map, _hub) = map();
        let mut clock = GameClock::new(Duration::from_millis(100));
        let npc = map
            .spawn_creature(1, Position::new(5.0, 5.0, 0.0))
            .expect("spawn");
        map.modify_health(npc, -100.0, clock.now()).expect("kill");
        assert_eq!(map.entity(npc).unwrap().death, DeathState::Corpse);

        // Decay timer at +5 ticks moves the corpse to looted.
        clock.advance(5);
        map.update(&clock);
        assert_eq!(map.entity(npc).unwrap().death, DeathState::CorpseLooted);

        // Removal timer at +5 more takes it out of the partition.
        clock.advance(5);
        map.update(&clock);
        assert!(map.entity(npc).is_none());

        // Respawn timer brings a fresh entity back on a new guid.
        clock.advance(10);
        map.update(&clock);
        assert_eq!(map.len(), 1);
        let respawned = map
            .entities
            .values()
            .next()
            .expect("respawned entity");
        assert_ne!(respawned.id, npc);
        assert_eq!(respawned.name, "Mire Stalker");
        assert!(respawned.is_alive());
        assert_eq!(respawned.position, Position::new(5.0, 5.0, 0.0));
    }

    #[test]
    fn shrinking_capacity_clamps_health_on_flush() {
        let (mut map, _hub) = map();
        let mut clock = GameClock::new(Duration::from_millis(100));
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");

        {
            let entity = map.entity_mut(player).unwrap();
            entity.properties.add_item_contribution(
                PropertyKind::HealthCapacity,
                crate::entities::properties::EquipSlot::Chest,
                20.0,
            );
        }
        map.update(&ticked(&mut clock));
        map.modify_health(player, 1000.0, clock.now()).expect("heal");
        assert_eq!(map.entity(player).unwrap().health, 120.0);

        {
            let entity = map.entity_mut(player).unwrap();
            entity.properties.remove_item_contribution(
                PropertyKind::HealthCapacity,
                crate::entities::properties::EquipSlot::Chest,
            );
        }
        map.update(&ticked(&mut clock));
        assert_eq!(map.entity(player).unwrap().health_capacity(), 100.0);
        assert_eq!(map.entity(player).unwrap().health, 100.0);
    }

    #[test]
    fn damage_cast_engages_both_sides() {
        let (mut map, _hub) = map();
        let mut clock = GameClock::new(Duration::from_millis(100));
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        let npc = map
            .spawn_creature(1, Position::new(5.0, 0.0, 0.0))
            .expect("spawn");

        map.cast_spell(player, 10, Some(npc)).expect("cast");
        map.update(&ticked(&mut clock));

        assert_eq!(map.entity(npc).unwrap().health, 70.0);
        assert_eq!(map.entity(npc).unwrap().threat.top(), Some(player));
        assert!(map.entity(npc).unwrap().combat.in_combat());
        assert!(map.entity(player).unwrap().combat.in_combat());
        // Focus was deducted once.
        assert_eq!(map.entity(player).unwrap().focus, 45.0);
    }

    #[test]
    fn buff_modifier_applies_and_expires() {
        let (mut map, _hub) = map();
        let mut clock = GameClock::new(Duration::from_millis(100));
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");

        map.cast_spell(player, 11, None).expect("cast");
        map.update(&ticked(&mut clock));
        assert_eq!(map.entity(player).unwrap().health_capacity(), 110.0);

        for _ in 0..20 {
            map.update(&ticked(&mut clock));
        }
        assert_eq!(map.entity(player).unwrap().health_capacity(), 100.0);
    }

    #[test]
    fn cast_rejections_are_typed() {
        let (mut map, _hub) = map();
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        let far_npc = map
            .spawn_creature(1, Position::new(500.0, 0.0, 0.0))
            .expect("spawn");

        match map.cast_spell(player, 10, Some(far_npc)) {
            Err(CastError::Action(ActionError::OutOfRange)) => {}
            other => panic!("expected OutOfRange, got {:?}", other.err()),
        }
        match map.cast_spell(player, 10, Some(EntityId(999))) {
            Err(CastError::Action(ActionError::InvalidTarget)) => {}
            other => panic!("expected InvalidTarget, got {:?}", other.err()),
        }

        map.entity_mut(player).unwrap().focus = 1.0;
        let near_npc = map
            .spawn_creature(1, Position::new(5.0, 0.0, 0.0))
            .expect("spawn");
        match map.cast_spell(player, 10, Some(near_npc)) {
            Err(CastError::Action(ActionError::InsufficientFocus)) => {}
            other => panic!("expected InsufficientFocus, got {:?}", other.err()),
        }

        match map.cast_spell(player, 999, None) {
            Err(CastError::World(WorldError::Content(_))) => {}
            other => panic!("expected content fault, got {:?}", other.err()),
        }
    }

    #[test]
    fn movement_interrupts_interruptible_cast() {
        let (mut map, _hub) = map();
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        let npc = map
            .spawn_creature(1, Position::new(5.0, 0.0, 0.0))
            .expect("spawn");
        map.cast_spell(player, 10, Some(npc)).expect("cast");

        map.move_entity(player, Position::new(1.0, 0.0, 0.0), GameTick(1))
            .expect("move");
        assert!(map.entity(player).unwrap().spells.is_empty());
        // Nothing landed.
        assert_eq!(map.entity(npc).unwrap().health, 100.0);
    }

    #[test]
    fn visibility_edges_reach_the_session() {
        let (mut map, hub) = map();
        let mut clock = GameClock::new(Duration::from_millis(100));
        let outbox = Arc::new(Outbox::new());
        hub.register(SessionId(1), Arc::clone(&outbox));

        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        let npc = map
            .spawn_creature(1, Position::new(20.0, 0.0, 0.0))
            .expect("spawn");
        outbox.drain();

        map.update(&ticked(&mut clock));
        let sent = opcodes(&outbox);
        assert!(sent.contains(&messages::SMSG_ENTITY_APPEAR));

        // Repolling an unchanged world produces no new appear edges.
        map.update(&ticked(&mut clock));
        let sent = opcodes(&outbox);
        assert!(!sent.contains(&messages::SMSG_ENTITY_APPEAR));

        map.move_entity(npc, Position::new(500.0, 0.0, 0.0), clock.now())
            .expect("move");
        map.update(&ticked(&mut clock));
        let sent = opcodes(&outbox);
        assert!(sent.contains(&messages::SMSG_ENTITY_DISAPPEAR));
        assert!(!map.entity(player).unwrap().visibility.can_see(npc));
    }

    #[test]
    fn npc_aggro_on_trigger_range_entry() {
        let (mut map, _hub) = map();
        let mut clock = GameClock::new(Duration::from_millis(100));
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        let npc = map
            .spawn_creature(1, Position::new(5.0, 0.0, 0.0))
            .expect("spawn");

        map.update(&ticked(&mut clock));
        assert_eq!(map.entity(npc).unwrap().threat.top(), Some(player));
        assert!(map.entity(npc).unwrap().combat.in_combat());
    }

    #[test]
    fn pet_is_removed_with_its_owner() {
        let (mut map, _hub) = map();
        let player = map
            .spawn_player("Tamsin".to_string(), SessionId(1), Position::default())
            .expect("spawn");
        let pet = map
            .spawn_pet(player, 2, Position::new(1.0, 0.0, 0.0))
            .expect("pet");
        assert_eq!(map.entity(pet).unwrap().owner, Some(player));
        assert_eq!(map.entity(pet).unwrap().kind, EntityKind::Pet);

        map.remove_entity(player);
        assert!(map.entity(pet).is_none());
        assert!(map.is_empty());
    }
}
