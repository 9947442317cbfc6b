use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GameTick(pub u64);

#[derive(Debug, Clone)]
pub struct GameClock {
    tick_length: Duration,
    tick: GameTick,
}

impl GameClock {
    pub fn new(tick_length: Duration) -> Self {
        let tick_length = if tick_length.is_zero() {
            Duration::from_millis(1)
        } else {
            tick_length
        };
        Self {
            tick_length,
            tick: GameTick(0),
        }
    }

    pub fn tick_length(&self) -> Duration {
        self.tick_length
    }

    pub fn now(&self) -> GameTick {
        self.tick
    }

    pub fn advance(&mut self, ticks: u64) -> GameTick {
        self.tick.0 = self.tick.0.saturating_add(ticks);
        self.tick
    }

    pub fn ticks_from_duration_round_up(&self, duration: Duration) -> u64 {
        if duration.is_zero() {
            return 0;
        }
        let tick_nanos = self.tick_length.as_nanos().max(1);
        let duration_nanos = duration.as_nanos();
        let ticks = (duration_nanos + tick_nanos - 1) / tick_nanos;
        ticks.min(u64::MAX as u128) as u64
    }

    pub fn duration_for_ticks(&self, ticks: u64) -> Duration {
        let nanos = self
            .tick_length
            .as_nanos()
            .saturating_mul(ticks as u128)
            .min(u64::MAX as u128) as u64;
        Duration::from_nanos(nanos)
    }
}

/// Tracks real time against the fixed tick grid for the global driver.
#[derive(Debug)]
pub struct TickTimer {
    clock: GameClock,
    last_tick: Instant,
}

impl TickTimer {
    pub fn new(clock: GameClock) -> Self {
        Self {
            clock,
            last_tick: Instant::now(),
        }
    }

    pub fn tick_length(&self) -> Duration {
        self.clock.tick_length()
    }

    /// Current clock snapshot without advancing.
    pub fn clock(&self) -> GameClock {
        self.clock.clone()
    }

    /// Advances the clock by however many whole ticks of real time have
    /// elapsed and returns a snapshot of it.
    pub fn advance_elapsed(&mut self) -> GameClock {
        let tick_nanos = self.clock.tick_length().as_nanos().max(1);
        let elapsed = self.last_tick.elapsed();
        let ticks = (elapsed.as_nanos() / tick_nanos) as u64;
        if ticks > 0 {
            self.clock.advance(ticks);
            self.last_tick += self.clock.duration_for_ticks(ticks);
        }
        self.clock.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    ready_at: GameTick,
}

impl Cooldown {
    pub fn new(ready_at: GameTick) -> Self {
        Self { ready_at }
    }

    pub fn from_ticks_from_now(clock: &GameClock, ticks: u64) -> Self {
        let ready_at = GameTick(clock.now().0.saturating_add(ticks));
        Self { ready_at }
    }

    pub fn ready_at(&self) -> GameTick {
        self.ready_at
    }

    pub fn is_ready(&self, clock: &GameClock) -> bool {
        clock.now() >= self.ready_at
    }

    pub fn remaining_ticks(&self, clock: &GameClock) -> u64 {
        self.ready_at.0.saturating_sub(clock.now().0)
    }

    pub fn reset_from_now_ticks(&mut self, clock: &GameClock, ticks: u64) {
        self.ready_at = GameTick(clock.now().0.saturating_add(ticks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_rejects_zero_tick_length() {
        let clock = GameClock::new(Duration::ZERO);
        assert_eq!(clock.tick_length(), Duration::from_millis(1));
    }

    #[test]
    fn ticks_from_duration_rounds_up() {
        let clock = GameClock::new(Duration::from_millis(100));
        assert_eq!(clock.ticks_from_duration_round_up(Duration::ZERO), 0);
        assert_eq!(
            clock.ticks_from_duration_round_up(Duration::from_millis(1)),
            1
        );
        assert_eq!(
            clock.ticks_from_duration_round_up(Duration::from_millis(100)),
            1
        );
        assert_eq!(
            clock.ticks_from_duration_round_up(Duration::from_millis(101)),
            2
        );
    }

    #[test]
    fn cooldown_tracks_clock() {
        let mut clock = GameClock::new(Duration::from_millis(100));
        let cooldown = Cooldown::from_ticks_from_now(&clock, 5);
        assert!(!cooldown.is_ready(&clock));
        assert_eq!(cooldown.remaining_ticks(&clock), 5);
        clock.advance(5);
        assert!(cooldown.is_ready(&clock));
        assert_eq!(cooldown.remaining_ticks(&clock), 0);
    }
}
