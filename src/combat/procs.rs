use crate::entities::properties::CastingId;
use crate::world::time::GameTick;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcKind {
    OnHit,
    OnDamaged,
    OnKill,
}

impl ProcKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ProcKind::OnHit),
            1 => Some(ProcKind::OnDamaged),
            2 => Some(ProcKind::OnKill),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProcApplyError {
    UnknownCategory(u32),
    DuplicateSource { kind: ProcKind, source_spell: u32 },
}

impl std::fmt::Display for ProcApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProcApplyError::UnknownCategory(raw) => {
                write!(f, "unknown proc category {}", raw)
            }
            ProcApplyError::DuplicateSource { kind, source_spell } => write!(
                f,
                "spell {} already has a {:?} proc watcher",
                source_spell, kind
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcWatcher {
    pub source_spell: u32,
    pub linked_spell: u32,
    period: u64,
    ready_at: GameTick,
    /// Casting the watcher last started; ended when the watcher is removed.
    pub triggered: Option<CastingId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcFire {
    pub kind: ProcKind,
    pub source_spell: u32,
    pub linked_spell: u32,
}

/// Passive trigger watchers, one list per category.
#[derive(Debug, Default)]
pub struct ProcTracker {
    watchers: HashMap<ProcKind, Vec<ProcWatcher>>,
}

impl ProcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.values().all(|list| list.is_empty())
    }

    pub fn watcher_count(&self, kind: ProcKind) -> usize {
        self.watchers.get(&kind).map(|list| list.len()).unwrap_or(0)
    }

    /// Registers a watcher. Fails without side effects when the raw
    /// category id is unrecognized or the source spell already watches
    /// this category.
    pub fn apply(
        &mut self,
        category: u32,
        source_spell: u32,
        linked_spell: u32,
        period: u64,
        now: GameTick,
    ) -> Result<ProcKind, ProcApplyError> {
        let kind =
            ProcKind::from_raw(category).ok_or(ProcApplyError::UnknownCategory(category))?;
        let list = self.watchers.entry(kind).or_default();
        if list
            .iter()
            .any(|watcher| watcher.source_spell == source_spell)
        {
            return Err(ProcApplyError::DuplicateSource { kind, source_spell });
        }
        list.push(ProcWatcher {
            source_spell,
            linked_spell,
            period: period.max(1),
            ready_at: now,
            triggered: None,
        });
        Ok(kind)
    }

    /// The owning condition fired; every watcher whose period has elapsed
    /// triggers its linked effect and rearms. At most one fire per watcher
    /// per period regardless of how often the condition fires.
    pub fn fire(&mut self, kind: ProcKind, now: GameTick) -> Vec<ProcFire> {
        let mut fired = Vec::new();
        let Some(list) = self.watchers.get_mut(&kind) else {
            return fired;
        };
        for watcher in list {
            if now >= watcher.ready_at {
                watcher.ready_at = GameTick(now.0.saturating_add(watcher.period));
                fired.push(ProcFire {
                    kind,
                    source_spell: watcher.source_spell,
                    linked_spell: watcher.linked_spell,
                });
            }
        }
        fired
    }

    pub fn record_triggered(&mut self, kind: ProcKind, source_spell: u32, casting: CastingId) {
        if let Some(list) = self.watchers.get_mut(&kind) {
            if let Some(watcher) = list
                .iter_mut()
                .find(|watcher| watcher.source_spell == source_spell)
            {
                watcher.triggered = Some(casting);
            }
        }
    }

    /// Removes the watcher and hands back the casting it had started, if
    /// any, so the caller can end that spell too.
    pub fn remove(&mut self, kind: ProcKind, source_spell: u32) -> Option<Option<CastingId>> {
        let list = self.watchers.get_mut(&kind)?;
        let index = list
            .iter()
            .position(|watcher| watcher.source_spell == source_spell)?;
        let watcher = list.remove(index);
        Some(watcher.triggered)
    }

    /// Clears every watcher, returning castings they had in flight.
    pub fn remove_all(&mut self) -> Vec<CastingId> {
        let mut castings = Vec::new();
        for list in self.watchers.values_mut() {
            for watcher in list.drain(..) {
                if let Some(casting) = watcher.triggered {
                    castings.push(casting);
                }
            }
        }
        castings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_category_is_rejected() {
        let mut procs = ProcTracker::new();
        assert_eq!(
            procs.apply(99, 1, 2, 10, GameTick(0)),
            Err(ProcApplyError::UnknownCategory(99))
        );
        assert!(procs.is_empty());
    }

    #[test]
    fn duplicate_source_in_category_is_rejected() {
        let mut procs = ProcTracker::new();
        assert_eq!(procs.apply(0, 7, 2, 10, GameTick(0)), Ok(ProcKind::OnHit));
        assert_eq!(
            procs.apply(0, 7, 3, 10, GameTick(0)),
            Err(ProcApplyError::DuplicateSource {
                kind: ProcKind::OnHit,
                source_spell: 7
            })
        );
        // Same source may watch a different category.
        assert_eq!(
            procs.apply(1, 7, 3, 10, GameTick(0)),
            Ok(ProcKind::OnDamaged)
        );
        assert_eq!(procs.watcher_count(ProcKind::OnHit), 1);
        assert_eq!(procs.watcher_count(ProcKind::OnDamaged), 1);
    }

    #[test]
    fn fires_at_most_once_per_period() {
        let mut procs = ProcTracker::new();
        procs.apply(0, 7, 42, 10, GameTick(0)).expect("apply");

        let fired = procs.fire(ProcKind::OnHit, GameTick(0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].linked_spell, 42);

        // Repeated hits inside the period stay quiet.
        assert!(procs.fire(ProcKind::OnHit, GameTick(3)).is_empty());
        assert!(procs.fire(ProcKind::OnHit, GameTick(9)).is_empty());

        let fired = procs.fire(ProcKind::OnHit, GameTick(10));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn remove_returns_triggered_casting() {
        let mut procs = ProcTracker::new();
        procs.apply(2, 7, 42, 10, GameTick(0)).expect("apply");
        procs.record_triggered(ProcKind::OnKill, 7, CastingId(99));
        assert_eq!(
            procs.remove(ProcKind::OnKill, 7),
            Some(Some(CastingId(99)))
        );
        assert_eq!(procs.remove(ProcKind::OnKill, 7), None);
        assert!(procs.is_empty());
    }
}
