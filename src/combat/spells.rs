use crate::catalog::SpellTemplate;
use crate::entities::entity::EntityId;
use crate::entities::properties::CastingId;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpellPhase {
    Casting { remaining: u64 },
    Active { remaining: Option<u64> },
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpellEventKind {
    /// Cast completed; damage, modifiers, and proc grants apply now.
    Begun,
    /// Execution over; applied modifiers come off the target.
    Ended,
}

#[derive(Debug, Clone)]
pub struct SpellEvent {
    pub kind: SpellEventKind,
    pub casting: CastingId,
    pub caster: EntityId,
    pub target: EntityId,
    pub spell_id: u32,
    pub template: Arc<SpellTemplate>,
    /// False when the execution ended before its cast finished, so there
    /// is nothing to unapply.
    pub effects_applied: bool,
}

#[derive(Debug, Clone)]
pub struct SpellExecution {
    pub casting: CastingId,
    pub spell_id: u32,
    pub caster: EntityId,
    pub target: EntityId,
    template: Arc<SpellTemplate>,
    phase: SpellPhase,
    effects_applied: bool,
}

impl SpellExecution {
    pub fn new(
        casting: CastingId,
        spell_id: u32,
        caster: EntityId,
        target: EntityId,
        template: Arc<SpellTemplate>,
    ) -> Self {
        let phase = SpellPhase::Casting {
            remaining: template.cast_ticks,
        };
        Self {
            casting,
            spell_id,
            caster,
            target,
            template,
            phase,
            effects_applied: false,
        }
    }

    pub fn template(&self) -> &Arc<SpellTemplate> {
        &self.template
    }

    pub fn phase(&self) -> SpellPhase {
        self.phase
    }

    pub fn is_casting(&self) -> bool {
        matches!(self.phase, SpellPhase::Casting { .. })
    }

    pub fn is_finished(&self) -> bool {
        self.phase == SpellPhase::Finished
    }

    fn event(&self, kind: SpellEventKind) -> SpellEvent {
        SpellEvent {
            kind,
            casting: self.casting,
            caster: self.caster,
            target: self.target,
            spell_id: self.spell_id,
            template: Arc::clone(&self.template),
            effects_applied: self.effects_applied,
        }
    }

    fn begin(&mut self, events: &mut Vec<SpellEvent>) {
        self.effects_applied = true;
        events.push(self.event(SpellEventKind::Begun));
        let lingering = self.template.duration_ticks > 0
            || !self.template.modifiers.is_empty()
            || self.template.proc.is_some();
        if !lingering {
            self.phase = SpellPhase::Finished;
            events.push(self.event(SpellEventKind::Ended));
            return;
        }
        let remaining = if self.template.duration_ticks > 0 {
            Some(self.template.duration_ticks)
        } else {
            None
        };
        self.phase = SpellPhase::Active { remaining };
    }

    fn end(&mut self, events: &mut Vec<SpellEvent>) {
        if self.phase == SpellPhase::Finished {
            return;
        }
        self.phase = SpellPhase::Finished;
        events.push(self.event(SpellEventKind::Ended));
    }

    fn update(&mut self, events: &mut Vec<SpellEvent>) {
        match self.phase {
            SpellPhase::Casting { remaining } => {
                if remaining <= 1 {
                    self.begin(events);
                } else {
                    self.phase = SpellPhase::Casting {
                        remaining: remaining - 1,
                    };
                }
            }
            SpellPhase::Active {
                remaining: Some(remaining),
            } => {
                if remaining <= 1 {
                    self.end(events);
                } else {
                    self.phase = SpellPhase::Active {
                        remaining: Some(remaining - 1),
                    };
                }
            }
            SpellPhase::Active { remaining: None } | SpellPhase::Finished => {}
        }
    }
}

/// The unordered set of in-flight executions one entity owns.
#[derive(Debug, Default)]
pub struct SpellBook {
    executions: Vec<SpellExecution>,
}

impl SpellBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn cast(&mut self, execution: SpellExecution) {
        self.executions.push(execution);
    }

    pub fn contains(&self, casting: CastingId) -> bool {
        self.executions
            .iter()
            .any(|execution| execution.casting == casting)
    }

    pub fn is_casting_spell(&self, spell_id: u32) -> bool {
        self.executions
            .iter()
            .any(|execution| execution.spell_id == spell_id && execution.is_casting())
    }

    /// First pass of the tick: advance every execution's phase timer.
    pub fn update_all(&mut self) -> Vec<SpellEvent> {
        let mut events = Vec::new();
        for execution in &mut self.executions {
            execution.update(&mut events);
        }
        events
    }

    /// Second pass, after the first pass's effects have been applied, so
    /// target-death outcomes produced this tick are observed.
    pub fn late_update_all(
        &mut self,
        mut target_gone: impl FnMut(EntityId) -> bool,
    ) -> Vec<SpellEvent> {
        let mut events = Vec::new();
        for execution in &mut self.executions {
            if matches!(execution.phase, SpellPhase::Active { .. })
                && target_gone(execution.target)
            {
                execution.end(&mut events);
            }
        }
        events
    }

    pub fn purge_finished(&mut self) {
        self.executions.retain(|execution| !execution.is_finished());
    }

    /// Movement interrupts executions still in their cast phase, and only
    /// those flagged interruptible.
    pub fn cancel_interruptible_casts(&mut self) -> Vec<SpellEvent> {
        let mut events = Vec::new();
        for execution in &mut self.executions {
            if execution.is_casting() && execution.template.interruptible {
                execution.end(&mut events);
            }
        }
        events
    }

    /// Ends exactly the one execution with this casting id, whatever its
    /// phase.
    pub fn cancel_casting(&mut self, casting: CastingId) -> Vec<SpellEvent> {
        let mut events = Vec::new();
        for execution in &mut self.executions {
            if execution.casting == casting {
                execution.end(&mut events);
                break;
            }
        }
        events
    }

    /// Ends every non-casting execution of the given spell id, the path a
    /// buff takes when its effect must come off.
    pub fn finish_spell(&mut self, spell_id: u32) -> Vec<SpellEvent> {
        let mut events = Vec::new();
        for execution in &mut self.executions {
            if execution.spell_id == spell_id && !execution.is_casting() {
                execution.end(&mut events);
            }
        }
        events
    }

    /// Death path: everything in flight cancels or finishes.
    pub fn cancel_all(&mut self) -> Vec<SpellEvent> {
        let mut events = Vec::new();
        for execution in &mut self.executions {
            execution.end(&mut events);
        }
        events
    }
}
