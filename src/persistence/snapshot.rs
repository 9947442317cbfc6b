use crate::entities::entity::{Entity, EntityKind};
use crate::entities::properties::PropertyKind;
use crate::entities::vitals::VitalKind;
use crate::world::position::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What persistence sees of an entity: identity, placement, vitals, and
/// base property values. Effective values are never saved; they are
/// recomputed from bases on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    pub name: String,
    pub kind: EntityKind,
    pub position: Position,
    pub vitals: BTreeMap<VitalKind, f32>,
    pub base_properties: BTreeMap<PropertyKind, f32>,
}

/// Synchronous snapshot; clears the dirty-since-save marker.
pub fn take_snapshot(entity: &mut Entity) -> EntitySnapshot {
    entity.dirty_since_save = false;
    let mut vitals = BTreeMap::new();
    vitals.insert(VitalKind::Health, entity.health);
    vitals.insert(VitalKind::Focus, entity.focus);
    EntitySnapshot {
        name: entity.name.clone(),
        kind: entity.kind,
        position: entity.position,
        vitals,
        base_properties: entity.properties.bases(),
    }
}

/// Restores the saved collections onto a live entity and recomputes.
pub fn restore_snapshot(entity: &mut Entity, snapshot: &EntitySnapshot) {
    entity.name = snapshot.name.clone();
    entity.position = snapshot.position;
    for (kind, value) in &snapshot.base_properties {
        entity.properties.set_base(*kind, *value);
    }
    entity.properties.flush();
    entity.health = snapshot
        .vitals
        .get(&VitalKind::Health)
        .copied()
        .unwrap_or(0.0);
    entity.focus = snapshot
        .vitals
        .get(&VitalKind::Focus)
        .copied()
        .unwrap_or(0.0);
    entity.dirty_since_save = false;
}

#[derive(Debug, Default)]
pub struct SaveReport {
    pub files: usize,
    pub parsed: usize,
    pub errors: Vec<String>,
}

/// YAML player saves under `<root>/save/players/`, one file per
/// character, keyed by lowercased name.
#[derive(Debug, Clone)]
pub struct SaveStore {
    players_dir: PathBuf,
}

impl SaveStore {
    pub fn from_root(root: &Path) -> Self {
        Self {
            players_dir: root.join("save").join("players"),
        }
    }

    fn player_path(&self, name: &str) -> PathBuf {
        let key: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        self.players_dir.join(format!("{key}.yaml"))
    }

    pub fn save_player(&self, snapshot: &EntitySnapshot) -> Result<(), String> {
        std::fs::create_dir_all(&self.players_dir)
            .map_err(|err| format!("save directory create failed: {}", err))?;
        let contents = serde_yaml::to_string(snapshot)
            .map_err(|err| format!("snapshot encode failed: {}", err))?;
        let path = self.player_path(&snapshot.name);
        std::fs::write(&path, contents)
            .map_err(|err| format!("write {} failed: {}", path.display(), err))
    }

    pub fn load_player(&self, name: &str) -> Result<Option<EntitySnapshot>, String> {
        let path = self.player_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| format!("read {} failed: {}", path.display(), err))?;
        let snapshot = serde_yaml::from_str(&contents)
            .map_err(|err| format!("parse {} failed: {}", path.display(), err))?;
        Ok(Some(snapshot))
    }

    pub fn validate_saves(&self) -> SaveReport {
        let mut report = SaveReport::default();
        let Ok(entries) = std::fs::read_dir(&self.players_dir) else {
            return report;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|ext| ext != "yaml").unwrap_or(true) {
                continue;
            }
            report.files += 1;
            match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_yaml::from_str::<EntitySnapshot>(&contents) {
                    Ok(_) => report.parsed += 1,
                    Err(err) => report.errors.push(format!("{}: {}", path.display(), err)),
                },
                Err(err) => report.errors.push(format!("{}: {}", path.display(), err)),
            }
        }
        report
    }
}
