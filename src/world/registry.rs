use crate::catalog::ContentCatalog;
use crate::config::WorldSettings;
use crate::net::session::SessionHub;
use crate::telemetry::logging;
use crate::world::map::MapInstance;
use crate::world::time::GameClock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Partition address. Open-world maps are singletons per world id;
/// instances key off their instance id, residences off the owning
/// resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKey {
    World(u32),
    Instance(u32, u64),
    Residence(u64),
}

impl MapKey {
    /// Open-world maps live for the server lifetime; everything else is
    /// torn down when empty and idle.
    pub fn is_persistent(self) -> bool {
        matches!(self, MapKey::World(_))
    }
}

impl std::fmt::Display for MapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MapKey::World(world) => write!(f, "world {}", world),
            MapKey::Instance(world, instance) => write!(f, "instance {}:{}", world, instance),
            MapKey::Residence(owner) => write!(f, "residence {}", owner),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub maps: usize,
    pub elapsed: Duration,
    pub over_budget: bool,
}

/// Owns every live partition and drives the global tick: one concurrent
/// task per map, joined before the tick returns. Maps never see each
/// other; a failing task is logged and swallowed at the join barrier.
pub struct MapRegistry {
    settings: Arc<WorldSettings>,
    catalog: Arc<dyn ContentCatalog>,
    hub: Arc<SessionHub>,
    maps: Mutex<HashMap<MapKey, Arc<Mutex<MapInstance>>>>,
    pending: Mutex<Vec<MapKey>>,
}

impl MapRegistry {
    pub fn new(
        settings: Arc<WorldSettings>,
        catalog: Arc<dyn ContentCatalog>,
        hub: Arc<SessionHub>,
    ) -> Self {
        Self {
            settings,
            catalog,
            hub,
            maps: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn build_map(&self, key: MapKey) -> Arc<Mutex<MapInstance>> {
        Arc::new(Mutex::new(MapInstance::new(
            key.to_string(),
            Arc::clone(&self.settings),
            Arc::clone(&self.catalog),
            Arc::clone(&self.hub),
        )))
    }

    /// Open-world partitions are created on first reference.
    pub fn open_world(&self, world_id: u32) -> Arc<Mutex<MapInstance>> {
        let mut maps = match self.maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = MapKey::World(world_id);
        Arc::clone(
            maps.entry(key)
                .or_insert_with(|| self.build_map(key)),
        )
    }

    pub fn get(&self, key: MapKey) -> Option<Arc<Mutex<MapInstance>>> {
        self.maps
            .lock()
            .ok()
            .and_then(|maps| maps.get(&key).cloned())
    }

    /// Requests a private instance. Creation is deferred to the start of
    /// the registry's next update so the live map collection is never
    /// mutated while a tick iterates it; the instance is addressable one
    /// tick later.
    pub fn request_instance(&self, key: MapKey) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(key);
        }
    }

    pub fn map_count(&self) -> usize {
        self.maps.lock().map(|maps| maps.len()).unwrap_or(0)
    }

    pub fn maps_snapshot(&self) -> Vec<(MapKey, Arc<Mutex<MapInstance>>)> {
        self.maps
            .lock()
            .map(|maps| {
                maps.iter()
                    .map(|(key, map)| (*key, Arc::clone(map)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn drain_pending(&self) {
        let pending: Vec<MapKey> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return,
        };
        if pending.is_empty() {
            return;
        }
        let mut maps = match self.maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in pending {
            if maps.contains_key(&key) {
                continue;
            }
            maps.insert(key, self.build_map(key));
            logging::log_world(&format!("{} created", key));
        }
    }

    fn teardown_idle(&self) {
        let idle_after = self.settings.instance_idle();
        let mut expired = Vec::new();
        if let Ok(maps) = self.maps.lock() {
            for (key, map) in maps.iter() {
                if key.is_persistent() {
                    continue;
                }
                let Ok(map) = map.lock() else {
                    continue;
                };
                if map.player_count() == 0 && map.idle_since().elapsed() >= idle_after {
                    expired.push(*key);
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        if let Ok(mut maps) = self.maps.lock() {
            for key in expired {
                maps.remove(&key);
                logging::log_world(&format!("{} torn down", key));
            }
        }
    }

    /// Global tick. With no live maps this is a no-op returning
    /// immediately with no task dispatch and no log output. Otherwise one
    /// task per map, joined here; overrunning the budget is a warning,
    /// never a delay for the next tick.
    pub fn update(&self, clock: &GameClock) -> TickReport {
        self.teardown_idle();
        self.drain_pending();

        let maps: Vec<(MapKey, Arc<Mutex<MapInstance>>)> = match self.maps.lock() {
            Ok(maps) => maps
                .iter()
                .map(|(key, map)| (*key, Arc::clone(map)))
                .collect(),
            Err(_) => Vec::new(),
        };
        if maps.is_empty() {
            return TickReport {
                maps: 0,
                elapsed: Duration::ZERO,
                over_budget: false,
            };
        }

        let started = Instant::now();
        std::thread::scope(|scope| {
            for (key, map) in &maps {
                let key = *key;
                let map = Arc::clone(map);
                scope.spawn(move || {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        match map.lock() {
                            Ok(mut map) => map.update(clock),
                            Err(_) => {
                                logging::log_error(&format!("{} lock poisoned", key));
                            }
                        }
                    }));
                    if outcome.is_err() {
                        logging::log_error(&format!("{} update panicked", key));
                    }
                });
            }
        });
        let elapsed = started.elapsed();
        let over_budget = elapsed > self.settings.tick_budget();
        if over_budget {
            logging::log_lag(&format!(
                "tick over budget: {} maps in {}ms (budget {}ms)",
                maps.len(),
                elapsed.as_millis(),
                self.settings.tick_budget_millis
            ));
        }
        TickReport {
            maps: maps.len(),
            elapsed,
            over_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CreatureTemplate, MemoryCatalog};
    use crate::entities::properties::PropertyKind;
    use crate::world::position::Position;
    use std::collections::BTreeMap;

    fn registry(instance_idle_seconds: u64) -> MapRegistry {
        let mut settings = WorldSettings::default();
        settings.instance_idle_seconds = instance_idle_seconds;
        let mut catalog = MemoryCatalog::new();
        let mut base = BTreeMap::new();
        base.insert(PropertyKind::HealthCapacity, 60.0);
        catalog.insert_creature(
            1,
            CreatureTemplate {
                name: "Bog Wisp".to_string(),
                base_properties: base,
                loot: Vec::new(),
                corpse_decay_ticks: 2,
                removal_ticks: 2,
                respawn_ticks: 0,
            },
        );
        MapRegistry::new(
            Arc::new(settings),
            Arc::new(catalog),
            Arc::new(SessionHub::new()),
        )
    }

    fn clock() -> GameClock {
        GameClock::new(Duration::from_millis(100))
    }

    #[test]
    fn empty_registry_tick_is_a_no_op() {
        let registry = registry(300);
        let report = registry.update(&clock());
        assert_eq!(report.maps, 0);
        assert_eq!(report.elapsed, Duration::ZERO);
        assert!(!report.over_budget);
    }

    #[test]
    fn open_world_created_on_first_reference() {
        let registry = registry(300);
        let first = registry.open_world(3);
        let second = registry.open_world(3);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.map_count(), 1);
    }

    #[test]
    fn requested_instance_exists_after_next_update() {
        let registry = registry(300);
        let key = MapKey::Instance(3, 17);
        registry.request_instance(key);
        registry.request_instance(key);
        assert!(registry.get(key).is_none());

        registry.update(&clock());
        assert!(registry.get(key).is_some());
        assert_eq!(registry.map_count(), 1);
    }

    #[test]
    fn tick_advances_every_map() {
        let registry = registry(300);
        let mut clock = clock();
        let mut spawned = Vec::new();
        for world in 1..=3u32 {
            let map = registry.open_world(world);
            let npc = map
                .lock()
                .unwrap()
                .spawn_creature(1, Position::default())
                .expect("spawn");
            map.lock()
                .unwrap()
                .modify_health(npc, -60.0, clock.now())
                .expect("kill");
            spawned.push((map, npc));
        }

        // Corpses sit through decay (2) and removal (2) timers.
        clock.advance(2);
        let report = registry.update(&clock);
        assert_eq!(report.maps, 3);
        clock.advance(2);
        registry.update(&clock);

        for (map, npc) in spawned {
            assert!(map.lock().unwrap().entity(npc).is_none());
            assert!(map.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn idle_private_instances_are_torn_down() {
        let registry = registry(0);
        let key = MapKey::Residence(9);
        registry.request_instance(key);
        registry.update(&clock());
        assert!(registry.get(key).is_some());

        // Never had a player and the idle window is zero.
        registry.update(&clock());
        assert!(registry.get(key).is_none());

        // Open worlds survive idleness.
        registry.open_world(1);
        registry.update(&clock());
        registry.update(&clock());
        assert_eq!(registry.map_count(), 1);
    }
}
