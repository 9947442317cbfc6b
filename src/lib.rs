pub mod admin;
pub mod catalog;
mod config;
pub mod combat;
pub mod entities;
mod net;
pub mod persistence;
pub mod telemetry;
pub mod world;

pub use config::{AppConfig, WorldSettings};
pub use net::dispatch::{dispatch_message, DispatchContext, SessionBinding};
pub use net::messages;
pub use net::packet::{PacketReader, PacketWriter};
pub use net::server::{
    run_game_server, run_game_ws_server, spawn_autosave_loop, spawn_world_tick_loop,
    GameServerConfig, GameServerState, ServerControl, ServerExit,
};
pub use net::session::{
    encode_message, DisconnectState, FrameBuffer, Message, Outbox, Session, SessionHub, SessionId,
};

use catalog::{ContentCatalog, YamlCatalog};
use persistence::snapshot::SaveStore;
use std::path::Path;
use std::sync::Arc;
use world::registry::MapRegistry;

pub fn run(args: &[String]) -> Result<(), String> {
    loop {
        let config = AppConfig::from_args(args)?;
        telemetry::logging::init(&config.root)?;
        let settings = Arc::new(WorldSettings::load(&config.root)?);
        let catalog: Arc<dyn ContentCatalog> = Arc::new(YamlCatalog::new(
            &config.root,
            settings.catalog_cache_capacity,
        ));
        let store = SaveStore::from_root(&config.root);

        let creature_files = count_yaml_files(&YamlCatalog::creature_dir(&config.root));
        let spell_files = count_yaml_files(&YamlCatalog::spell_dir(&config.root));
        let save_report = store.validate_saves();
        telemetry::logging::log_world(&format!(
            "content scan: creatures={}, spells={}, saves={} ({} errors)",
            creature_files,
            spell_files,
            save_report.files,
            save_report.errors.len()
        ));
        println!("everfall: content scan");
        println!("- root: {}", config.root.display());
        println!("- creature templates: {}", creature_files);
        println!("- spell templates: {}", spell_files);
        println!(
            "- player saves: files={}, parsed={}, errors={}",
            save_report.files,
            save_report.parsed,
            save_report.errors.len()
        );
        for err in &save_report.errors {
            eprintln!("everfall: save validate {}", err);
        }

        let hub = Arc::new(SessionHub::new());
        let registry = Arc::new(MapRegistry::new(
            Arc::clone(&settings),
            catalog,
            Arc::clone(&hub),
        ));
        let control = Arc::new(ServerControl::new());
        let state = Arc::new(GameServerState::new(Arc::clone(&settings)));

        let tick_handle = spawn_world_tick_loop(
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&control),
        );
        let autosave_handle = if settings.autosave_interval_seconds > 0 {
            Some(spawn_autosave_loop(
                Arc::clone(&registry),
                store.clone(),
                settings.autosave_interval_seconds,
                Arc::clone(&control),
            ))
        } else {
            None
        };

        let game_config = GameServerConfig {
            bind_addr: config.game_bind_addr.clone(),
            ws_bind_addr: config.ws_bind_addr.clone(),
            ws_allowed_origins: config.ws_allowed_origins.clone(),
            root: Some(config.root.clone()),
            ..GameServerConfig::default()
        };
        let ws_handle = if config.ws_bind_addr.is_some() {
            let ws_config = game_config.clone();
            let ws_state = Arc::clone(&state);
            let ws_registry = Arc::clone(&registry);
            let ws_hub = Arc::clone(&hub);
            let ws_control = Arc::clone(&control);
            Some(std::thread::spawn(move || {
                run_game_ws_server(ws_config, ws_state, ws_registry, ws_hub, ws_control)
            }))
        } else {
            None
        };

        let result = run_game_server(game_config, state, registry, hub, Arc::clone(&control));
        if let Err(err) = result {
            control.request_shutdown();
            eprintln!("game server error: {}", err);
        }

        if tick_handle.join().is_err() {
            eprintln!("world tick thread panicked");
        }
        if let Some(handle) = autosave_handle {
            if handle.join().is_err() {
                eprintln!("autosave thread panicked");
            }
        }
        if let Some(handle) = ws_handle {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => eprintln!("websocket server error: {}", err),
                Err(_) => eprintln!("websocket server thread panicked"),
            }
        }

        match control.exit_kind() {
            ServerExit::Shutdown => return Ok(()),
            ServerExit::Restart => {
                println!("everfall: restart requested, relaunching");
            }
        }
    }
}

fn count_yaml_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| {
                    entry
                        .path()
                        .extension()
                        .map(|ext| ext == "yaml")
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}
