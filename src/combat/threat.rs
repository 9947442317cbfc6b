use crate::entities::entity::EntityId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreatEntry {
    pub target: EntityId,
    pub score: f32,
}

/// Accumulated hostility, highest first. Entries hold bare handles; the
/// owning map drops stale ones with `retain_known` before selection.
#[derive(Debug, Default)]
pub struct ThreatList {
    entries: Vec<ThreatEntry>,
}

impl ThreatList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(&mut self, target: EntityId, amount: f32) {
        match self.entries.iter_mut().find(|entry| entry.target == target) {
            Some(entry) => entry.score += amount,
            None => self.entries.push(ThreatEntry {
                target,
                score: amount,
            }),
        }
        self.resort();
    }

    pub fn remove(&mut self, target: EntityId) {
        self.entries.retain(|entry| entry.target != target);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn retain_known(&mut self, mut known: impl FnMut(EntityId) -> bool) {
        self.entries.retain(|entry| known(entry.target));
    }

    pub fn top(&self) -> Option<EntityId> {
        self.entries.first().map(|entry| entry.target)
    }

    pub fn targets(&self) -> Vec<EntityId> {
        self.entries.iter().map(|entry| entry.target).collect()
    }

    pub fn score(&self, target: EntityId) -> Option<f32> {
        self.entries
            .iter()
            .find(|entry| entry.target == target)
            .map(|entry| entry.score)
    }

    fn resort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.target.0.cmp(&b.target.0))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_score_selected() {
        let mut threat = ThreatList::new();
        threat.add(EntityId(1), 10.0);
        threat.add(EntityId(2), 25.0);
        threat.add(EntityId(1), 5.0);
        assert_eq!(threat.top(), Some(EntityId(2)));

        threat.add(EntityId(1), 20.0);
        assert_eq!(threat.top(), Some(EntityId(1)));
        assert_eq!(threat.score(EntityId(1)), Some(35.0));
    }

    #[test]
    fn ties_break_by_handle() {
        let mut threat = ThreatList::new();
        threat.add(EntityId(9), 10.0);
        threat.add(EntityId(3), 10.0);
        assert_eq!(threat.top(), Some(EntityId(3)));
    }

    #[test]
    fn stale_handles_drop_out() {
        let mut threat = ThreatList::new();
        threat.add(EntityId(1), 50.0);
        threat.add(EntityId(2), 10.0);
        threat.retain_known(|id| id != EntityId(1));
        assert_eq!(threat.top(), Some(EntityId(2)));
        threat.clear();
        assert!(threat.is_empty());
    }
}
