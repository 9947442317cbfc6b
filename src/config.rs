use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub game_bind_addr: String,
    pub ws_bind_addr: Option<String>,
    pub ws_allowed_origins: Option<Vec<String>>,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 2 {
            return Err(
                "usage: everfall <data-root> [game_bind_addr] [ws_bind_addr]".to_string(),
            );
        }

        let root = Path::new(&args[1]).to_path_buf();
        let game_bind_addr = if args.len() > 2 {
            args[2].clone()
        } else {
            "0.0.0.0:7272".to_string()
        };
        let ws_bind_addr = if args.len() > 3 {
            Some(args[3].clone())
        } else {
            env_addr("EVERFALL_WS_ADDR")
        };
        let ws_allowed_origins = std::env::var("EVERFALL_WS_ORIGINS").ok().and_then(|value| {
            let entries: Vec<String> = value
                .split(',')
                .map(|entry| entry.trim())
                .filter(|entry| !entry.is_empty())
                .map(|entry| entry.to_string())
                .collect();
            if entries.is_empty() {
                None
            } else {
                Some(entries)
            }
        });
        Ok(Self {
            root,
            game_bind_addr,
            ws_bind_addr,
            ws_allowed_origins,
        })
    }
}

fn env_addr(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// World tuning loaded from `<root>/config.yaml`; every field falls back
/// to the reference default when the file or field is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub tick_millis: u64,
    pub tick_budget_millis: u64,
    pub heartbeat_timeout_seconds: u64,
    pub vision_range: f32,
    pub trigger_radius: f32,
    pub grid_cell_size: f32,
    pub instance_idle_seconds: u64,
    pub max_packet: usize,
    pub catalog_cache_capacity: usize,
    pub autosave_interval_seconds: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            tick_millis: 100,
            tick_budget_millis: 10,
            heartbeat_timeout_seconds: 60,
            vision_range: 96.0,
            trigger_radius: 24.0,
            grid_cell_size: 16.0,
            instance_idle_seconds: 300,
            max_packet: 4096,
            catalog_cache_capacity: 256,
            autosave_interval_seconds: 0,
        }
    }
}

impl WorldSettings {
    pub fn load(root: &Path) -> Result<Self, String> {
        let path = root.join("config.yaml");
        if !path.is_file() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| format!("read {} failed: {}", path.display(), err))?;
        let mut settings: WorldSettings = serde_yaml::from_str(&contents)
            .map_err(|err| format!("parse {} failed: {}", path.display(), err))?;
        if let Ok(value) = std::env::var("EVERFALL_AUTOSAVE_SECS") {
            match value.trim().parse::<u64>() {
                Ok(parsed) => settings.autosave_interval_seconds = parsed,
                Err(_) => {
                    eprintln!(
                        "everfall: invalid EVERFALL_AUTOSAVE_SECS '{}', keeping {}",
                        value, settings.autosave_interval_seconds
                    );
                }
            }
        }
        Ok(settings)
    }

    pub fn tick_length(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }

    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_millis)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds.max(1))
    }

    pub fn instance_idle(&self) -> Duration {
        Duration::from_secs(self.instance_idle_seconds)
    }

    /// Heartbeat window expressed in ticks of the configured clock.
    pub fn heartbeat_ticks(&self) -> u64 {
        let tick = self.tick_millis.max(1);
        (self.heartbeat_timeout_seconds.max(1) * 1000).div_ceil(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_args_requires_root() {
        let args = vec!["everfall".to_string()];
        assert!(AppConfig::from_args(&args).is_err());
    }

    #[test]
    fn from_args_defaults_bind_addr() {
        let args = vec!["everfall".to_string(), "/tmp/data".to_string()];
        let config = AppConfig::from_args(&args).expect("config");
        assert_eq!(config.game_bind_addr, "0.0.0.0:7272");
        assert_eq!(config.root, PathBuf::from("/tmp/data"));
    }

    #[test]
    fn settings_yaml_overrides_defaults() {
        let settings: WorldSettings =
            serde_yaml::from_str("tick_millis: 50\ntrigger_radius: 10.0\n").expect("parse");
        assert_eq!(settings.tick_millis, 50);
        assert_eq!(settings.trigger_radius, 10.0);
        // Untouched fields keep their defaults.
        assert_eq!(settings.tick_budget_millis, 10);
        assert_eq!(settings.max_packet, 4096);
    }

    #[test]
    fn heartbeat_ticks_rounds_up() {
        let mut settings = WorldSettings::default();
        settings.tick_millis = 100;
        settings.heartbeat_timeout_seconds = 1;
        assert_eq!(settings.heartbeat_ticks(), 10);
        settings.tick_millis = 30;
        assert_eq!(settings.heartbeat_ticks(), 34);
    }
}
