use crate::entities::entity::EntityId;
use crate::world::time::GameTick;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedAction {
    CorpseDecay,
    CorpseRemoval,
    Respawn,
}

#[derive(Clone, Copy, Debug)]
struct TimerEntry {
    entity: EntityId,
    action: TimedAction,
    due: GameTick,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for earliest-first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.entity.0.cmp(&self.entity.0))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.due == other.due
    }
}

impl Eq for TimerEntry {}

/// Per-map timer wheel driving corpse decay, removal, and respawn. One
/// pending action per entity; rescheduling replaces, and stale heap
/// entries are skipped on pop.
#[derive(Debug, Default)]
pub struct TimerWheel {
    heap: BinaryHeap<TimerEntry>,
    index: HashMap<EntityId, TimerEntry>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn schedule(&mut self, entity: EntityId, action: TimedAction, delay: u64, now: GameTick) {
        let entry = TimerEntry {
            entity,
            action,
            due: GameTick(now.0.saturating_add(delay)),
        };
        self.index.insert(entity, entry);
        self.heap.push(entry);
    }

    pub fn cancel(&mut self, entity: EntityId) {
        self.index.remove(&entity);
    }

    pub fn pending(&self, entity: EntityId) -> Option<TimedAction> {
        self.index.get(&entity).map(|entry| entry.action)
    }

    /// Next due (entity, action), earliest first; stale entries left
    /// behind by cancel/reschedule are discarded as encountered.
    pub fn pop_due(&mut self, now: GameTick) -> Option<(EntityId, TimedAction)> {
        loop {
            let entry = self.heap.peek()?;
            match self.index.get(&entry.entity) {
                Some(active) if active.due == entry.due && active.action == entry.action => {
                    if entry.due <= now {
                        let entry = self.heap.pop()?;
                        self.index.remove(&entry.entity);
                        return Some((entry.entity, entry.action));
                    }
                    return None;
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_due_order() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(EntityId(1), TimedAction::Respawn, 10, GameTick(100));
        wheel.schedule(EntityId(2), TimedAction::CorpseDecay, 5, GameTick(100));

        assert_eq!(wheel.pop_due(GameTick(104)), None);
        assert_eq!(
            wheel.pop_due(GameTick(105)),
            Some((EntityId(2), TimedAction::CorpseDecay))
        );
        assert_eq!(wheel.pop_due(GameTick(105)), None);
        assert_eq!(
            wheel.pop_due(GameTick(120)),
            Some((EntityId(1), TimedAction::Respawn))
        );
        assert!(wheel.is_empty());
    }

    #[test]
    fn reschedule_replaces_pending_action() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(EntityId(1), TimedAction::CorpseDecay, 5, GameTick(0));
        wheel.schedule(EntityId(1), TimedAction::CorpseRemoval, 20, GameTick(0));

        assert_eq!(wheel.pop_due(GameTick(5)), None);
        assert_eq!(
            wheel.pop_due(GameTick(20)),
            Some((EntityId(1), TimedAction::CorpseRemoval))
        );
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_discards_entry() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(EntityId(1), TimedAction::Respawn, 5, GameTick(0));
        wheel.cancel(EntityId(1));
        assert_eq!(wheel.pop_due(GameTick(100)), None);
        assert!(wheel.is_empty());
    }
}
