/// Hidden combat cycle. The observed `in_combat` boolean flips true at the
/// `Free -> Engaged` edge and false only at `Exited -> Free`, one phase per
/// tick on the way out, so same-tick checks during the tick combat ends
/// still read "in combat".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombatPhase {
    Free,
    Engaged,
    Exiting,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombatEdge {
    Entered,
    Left,
}

#[derive(Debug, Clone, Copy)]
pub struct CombatState {
    phase: CombatPhase,
    in_combat: bool,
}

impl Default for CombatState {
    fn default() -> Self {
        Self::new()
    }
}

impl CombatState {
    pub fn new() -> Self {
        Self {
            phase: CombatPhase::Free,
            in_combat: false,
        }
    }

    pub fn in_combat(&self) -> bool {
        self.in_combat
    }

    pub fn phase(&self) -> CombatPhase {
        self.phase
    }

    /// Immediate entry when the threat list becomes non-empty. Re-engaging
    /// while winding down returns to `Engaged` without a new edge, since
    /// the observed boolean never flipped.
    pub fn engage(&mut self) -> Option<CombatEdge> {
        match self.phase {
            CombatPhase::Free => {
                self.phase = CombatPhase::Engaged;
                self.in_combat = true;
                Some(CombatEdge::Entered)
            }
            CombatPhase::Exiting | CombatPhase::Exited => {
                self.phase = CombatPhase::Engaged;
                None
            }
            CombatPhase::Engaged => None,
        }
    }

    /// One phase step per tick. At most one edge per call.
    pub fn tick(&mut self, threat_nonempty: bool) -> Option<CombatEdge> {
        match self.phase {
            CombatPhase::Free => {
                if threat_nonempty {
                    self.engage()
                } else {
                    None
                }
            }
            CombatPhase::Engaged => {
                if !threat_nonempty {
                    self.phase = CombatPhase::Exiting;
                }
                None
            }
            CombatPhase::Exiting => {
                if threat_nonempty {
                    self.phase = CombatPhase::Engaged;
                } else {
                    self.phase = CombatPhase::Exited;
                }
                None
            }
            CombatPhase::Exited => {
                if threat_nonempty {
                    self.phase = CombatPhase::Engaged;
                    None
                } else {
                    self.phase = CombatPhase::Free;
                    self.in_combat = false;
                    Some(CombatEdge::Left)
                }
            }
        }
    }
}
