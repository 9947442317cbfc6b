use crate::persistence::snapshot::{take_snapshot, SaveStore};
use crate::world::registry::MapRegistry;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub interval_seconds: u64,
}

impl AutosaveConfig {
    pub fn interval(self) -> Option<Duration> {
        if self.interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.interval_seconds.max(1)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutosaveState {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl AutosaveState {
    pub fn new(config: AutosaveConfig, now: Instant) -> Self {
        let interval = config.interval();
        let next_due = interval.map(|interval| now + interval);
        Self { interval, next_due }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.next_due.map_or(false, |next| now >= next)
    }

    pub fn mark_saved(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.next_due = Some(now + interval);
        }
    }
}

#[derive(Debug, Default)]
pub struct AutosaveReport {
    pub saved_players: usize,
    pub errors: Vec<String>,
}

/// One autosave pass: snapshot every dirty player on every live map. Each
/// map is locked only long enough to take its snapshots; writes happen
/// outside the lock.
pub fn autosave_players(registry: &MapRegistry, store: &SaveStore) -> AutosaveReport {
    let mut report = AutosaveReport::default();
    for (key, map) in registry.maps_snapshot() {
        let snapshots = match map.lock() {
            Ok(mut map) => map
                .dirty_players_mut()
                .into_iter()
                .map(|entity| take_snapshot(entity))
                .collect::<Vec<_>>(),
            Err(_) => {
                report.errors.push(format!("{} lock poisoned", key));
                continue;
            }
        };
        for snapshot in snapshots {
            match store.save_player(&snapshot) {
                Ok(()) => report.saved_players += 1,
                Err(err) => report.errors.push(err),
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_disables_autosave() {
        let config = AutosaveConfig {
            interval_seconds: 0,
        };
        let state = AutosaveState::new(config, Instant::now());
        assert!(!state.due(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn due_after_interval_then_rearmed() {
        let config = AutosaveConfig {
            interval_seconds: 60,
        };
        let start = Instant::now();
        let mut state = AutosaveState::new(config, start);
        assert!(!state.due(start + Duration::from_secs(59)));
        assert!(state.due(start + Duration::from_secs(60)));

        state.mark_saved(start + Duration::from_secs(60));
        assert!(!state.due(start + Duration::from_secs(90)));
        assert!(state.due(start + Duration::from_secs(120)));
    }
}
