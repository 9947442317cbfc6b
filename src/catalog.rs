use crate::entities::properties::PropertyKind;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatureTemplate {
    pub name: String,
    #[serde(default)]
    pub base_properties: BTreeMap<PropertyKind, f32>,
    /// Item ids dropped on death; an empty list lets the corpse skip
    /// straight to the looted state.
    #[serde(default)]
    pub loot: Vec<u32>,
    #[serde(default = "default_corpse_decay_ticks")]
    pub corpse_decay_ticks: u64,
    #[serde(default = "default_removal_ticks")]
    pub removal_ticks: u64,
    #[serde(default)]
    pub respawn_ticks: u64,
}

fn default_corpse_decay_ticks() -> u64 {
    600
}

fn default_removal_ticks() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpellModifierDef {
    pub property: PropertyKind,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub factor: f32,
    #[serde(default)]
    pub term: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcGrantDef {
    /// Raw category id as authored; unrecognized ids are logged and the
    /// grant is skipped.
    pub category: u32,
    pub period_ticks: u64,
    pub linked_spell: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpellTemplate {
    pub name: String,
    #[serde(default)]
    pub cast_ticks: u64,
    /// 0 with modifiers present means "until cancelled"; 0 without
    /// modifiers is a one-shot.
    #[serde(default)]
    pub duration_ticks: u64,
    #[serde(default)]
    pub interruptible: bool,
    #[serde(default)]
    pub damage: f32,
    #[serde(default)]
    pub focus_cost: f32,
    #[serde(default)]
    pub threat: f32,
    #[serde(default)]
    pub modifiers: Vec<SpellModifierDef>,
    #[serde(default)]
    pub proc: Option<ProcGrantDef>,
}

#[derive(Debug)]
pub enum CatalogError {
    MissingCreature(u32),
    MissingSpell(u32),
    Io(String),
    Parse(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CatalogError::MissingCreature(id) => write!(f, "creature template {} not found", id),
            CatalogError::MissingSpell(id) => write!(f, "spell template {} not found", id),
            CatalogError::Io(err) => write!(f, "catalog read failed: {}", err),
            CatalogError::Parse(err) => write!(f, "catalog parse failed: {}", err),
        }
    }
}

/// Read-only content lookup. A missing id is a data-integrity failure for
/// the operation that needed it, not a recoverable condition.
pub trait ContentCatalog: Send + Sync {
    fn creature(&self, id: u32) -> Result<Arc<CreatureTemplate>, CatalogError>;
    fn spell(&self, id: u32) -> Result<Arc<SpellTemplate>, CatalogError>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    creatures: HashMap<u32, Arc<CreatureTemplate>>,
    spells: HashMap<u32, Arc<SpellTemplate>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_creature(&mut self, id: u32, template: CreatureTemplate) {
        self.creatures.insert(id, Arc::new(template));
    }

    pub fn insert_spell(&mut self, id: u32, template: SpellTemplate) {
        self.spells.insert(id, Arc::new(template));
    }
}

impl ContentCatalog for MemoryCatalog {
    fn creature(&self, id: u32) -> Result<Arc<CreatureTemplate>, CatalogError> {
        self.creatures
            .get(&id)
            .cloned()
            .ok_or(CatalogError::MissingCreature(id))
    }

    fn spell(&self, id: u32) -> Result<Arc<SpellTemplate>, CatalogError> {
        self.spells
            .get(&id)
            .cloned()
            .ok_or(CatalogError::MissingSpell(id))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64)
        }
    }
}

/// Disk-backed catalog: one YAML file per template id under
/// `content/creatures/` and `content/spells/`, fronted by an LRU so large
/// catalogs stay partially resident.
pub struct YamlCatalog {
    root: PathBuf,
    creatures: Mutex<LruCache<u32, Arc<CreatureTemplate>>>,
    spells: Mutex<LruCache<u32, Arc<SpellTemplate>>>,
    stats: Mutex<CacheStats>,
}

impl YamlCatalog {
    pub fn new(root: &Path, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.to_path_buf(),
            creatures: Mutex::new(LruCache::new(capacity)),
            spells: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().map(|stats| *stats).unwrap_or_default()
    }

    pub fn creature_dir(root: &Path) -> PathBuf {
        root.join("content").join("creatures")
    }

    pub fn spell_dir(root: &Path) -> PathBuf {
        root.join("content").join("spells")
    }

    fn record(&self, hit: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
                stats.loads += 1;
            }
        }
    }

    fn load_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CatalogError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| CatalogError::Io(format!("{}: {}", path.display(), err)))?;
        serde_yaml::from_str(&contents)
            .map_err(|err| CatalogError::Parse(format!("{}: {}", path.display(), err)))
    }
}

impl ContentCatalog for YamlCatalog {
    fn creature(&self, id: u32) -> Result<Arc<CreatureTemplate>, CatalogError> {
        if let Ok(mut cache) = self.creatures.lock() {
            if let Some(found) = cache.get(&id) {
                let found = Arc::clone(found);
                self.record(true);
                return Ok(found);
            }
        }
        let path = Self::creature_dir(&self.root).join(format!("{id}.yaml"));
        if !path.is_file() {
            return Err(CatalogError::MissingCreature(id));
        }
        let template: CreatureTemplate = Self::load_file(&path)?;
        let template = Arc::new(template);
        self.record(false);
        if let Ok(mut cache) = self.creatures.lock() {
            cache.put(id, Arc::clone(&template));
        }
        Ok(template)
    }

    fn spell(&self, id: u32) -> Result<Arc<SpellTemplate>, CatalogError> {
        if let Ok(mut cache) = self.spells.lock() {
            if let Some(found) = cache.get(&id) {
                let found = Arc::clone(found);
                self.record(true);
                return Ok(found);
            }
        }
        let path = Self::spell_dir(&self.root).join(format!("{id}.yaml"));
        if !path.is_file() {
            return Err(CatalogError::MissingSpell(id));
        }
        let template: SpellTemplate = Self::load_file(&path)?;
        let template = Arc::new(template);
        self.record(false);
        if let Ok(mut cache) = self.spells.lock() {
            cache.put(id, Arc::clone(&template));
        }
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_catalog_reports_missing_ids() {
        let catalog = MemoryCatalog::new();
        let err = catalog.creature(42).unwrap_err();
        assert_eq!(err.to_string(), "creature template 42 not found");
        let err = catalog.spell(7).unwrap_err();
        assert_eq!(err.to_string(), "spell template 7 not found");
    }

    #[test]
    fn spell_template_parses_with_defaults() {
        let yaml = "
name: Ironhide
duration_ticks: 50
modifiers:
  - property: Armor
    priority: 1
    factor: 1.25
";
        let template: SpellTemplate = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(template.name, "Ironhide");
        assert_eq!(template.cast_ticks, 0);
        assert!(!template.interruptible);
        assert_eq!(template.modifiers.len(), 1);
        assert_eq!(template.modifiers[0].property, PropertyKind::Armor);
        assert_eq!(template.modifiers[0].term, 0.0);
        assert!(template.proc.is_none());
    }

    #[test]
    fn creature_template_parses_with_defaults() {
        let yaml = "
name: Mire Stalker
base_properties:
  HealthCapacity: 180.0
  AttackPower: 12.0
loot: [101, 102]
respawn_ticks: 300
";
        let template: CreatureTemplate = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(template.name, "Mire Stalker");
        assert_eq!(
            template.base_properties.get(&PropertyKind::HealthCapacity),
            Some(&180.0)
        );
        assert_eq!(template.loot, vec![101, 102]);
        assert_eq!(template.corpse_decay_ticks, 600);
        assert_eq!(template.removal_ticks, 100);
    }

    #[test]
    fn yaml_catalog_caches_loaded_templates() {
        let dir = std::env::temp_dir().join(format!(
            "everfall-catalog-test-{}",
            std::process::id()
        ));
        let spells = YamlCatalog::spell_dir(&dir);
        std::fs::create_dir_all(&spells).expect("create content dir");
        std::fs::write(
            spells.join("5.yaml"),
            "name: Spark\ndamage: 12.0\ncast_ticks: 3\ninterruptible: true\n",
        )
        .expect("write template");

        let catalog = YamlCatalog::new(&dir, 16);
        let first = catalog.spell(5).expect("first load");
        let second = catalog.spell(5).expect("cached load");
        assert_eq!(first.name, "Spark");
        assert!(Arc::ptr_eq(&first, &second));
        let stats = catalog.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits, 1);

        assert!(matches!(
            catalog.spell(6),
            Err(CatalogError::MissingSpell(6))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
