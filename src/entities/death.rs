/// Death progression. `JustSpawned` and `JustDied` are transient edge
/// states that cascade immediately; `Dead` is terminal and only ever
/// reached by non-player entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathState {
    JustSpawned,
    Alive,
    JustDied,
    Corpse,
    CorpseLooted,
    Dead,
}

impl DeathState {
    pub fn raw(self) -> u8 {
        match self {
            DeathState::JustSpawned => 0,
            DeathState::Alive => 1,
            DeathState::JustDied => 2,
            DeathState::Corpse => 3,
            DeathState::CorpseLooted => 4,
            DeathState::Dead => 5,
        }
    }

    pub fn is_alive(self) -> bool {
        matches!(self, DeathState::JustSpawned | DeathState::Alive)
    }

    pub fn is_corpse_like(self) -> bool {
        matches!(
            self,
            DeathState::JustDied | DeathState::Corpse | DeathState::CorpseLooted | DeathState::Dead
        )
    }

    /// The state this one falls through to without waiting for a timer.
    pub fn cascade(self) -> Option<DeathState> {
        match self {
            DeathState::JustSpawned => Some(DeathState::Alive),
            DeathState::JustDied => Some(DeathState::Corpse),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor. Resurrection back to
    /// `JustSpawned` is legal from the corpse-like states; everything else
    /// moves strictly forward.
    pub fn allows(self, next: DeathState) -> bool {
        match (self, next) {
            (DeathState::JustSpawned, DeathState::Alive) => true,
            (DeathState::Alive, DeathState::JustDied) => true,
            (DeathState::JustDied, DeathState::Corpse) => true,
            (DeathState::Corpse, DeathState::CorpseLooted) => true,
            (DeathState::CorpseLooted, DeathState::Dead) => true,
            (DeathState::Corpse, DeathState::JustSpawned) => true,
            (DeathState::CorpseLooted, DeathState::JustSpawned) => true,
            (DeathState::Dead, DeathState::JustSpawned) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_chain_is_legal() {
        let chain = [
            DeathState::JustSpawned,
            DeathState::Alive,
            DeathState::JustDied,
            DeathState::Corpse,
            DeathState::CorpseLooted,
            DeathState::Dead,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].allows(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!DeathState::Alive.allows(DeathState::Corpse));
        assert!(!DeathState::JustDied.allows(DeathState::Dead));
        assert!(!DeathState::Alive.allows(DeathState::Alive));
    }

    #[test]
    fn resurrection_paths() {
        assert!(DeathState::Corpse.allows(DeathState::JustSpawned));
        assert!(DeathState::CorpseLooted.allows(DeathState::JustSpawned));
        assert!(DeathState::Dead.allows(DeathState::JustSpawned));
        assert!(!DeathState::Alive.allows(DeathState::JustSpawned));
    }

    #[test]
    fn cascades_are_immediate_edges_only() {
        assert_eq!(DeathState::JustSpawned.cascade(), Some(DeathState::Alive));
        assert_eq!(DeathState::JustDied.cascade(), Some(DeathState::Corpse));
        assert_eq!(DeathState::Corpse.cascade(), None);
        assert_eq!(DeathState::Dead.cascade(), None);
    }
}
