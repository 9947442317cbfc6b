use crate::admin::commands::{parse_admin_command, AdminCommand};
use crate::entities::entity::EntityId;
use crate::entities::properties::CastingId;
use crate::net::messages;
use crate::net::packet::PacketReader;
use crate::net::server::ServerControl;
use crate::net::session::{Message, Session, SessionAction, SessionActionKind};
use crate::persistence::snapshot::SaveStore;
use crate::telemetry::logging;
use crate::world::map::{CastError, MapInstance};
use crate::world::position::Position;
use crate::world::registry::{MapKey, MapRegistry};
use crate::world::time::GameTick;

/// Where this session's player lives, if anywhere. Handles are
/// re-resolved through the registry and map on every message.
#[derive(Debug, Default)]
pub struct SessionBinding {
    pub map: Option<MapKey>,
    pub entity: Option<EntityId>,
    pub privileged: bool,
}

pub struct DispatchContext<'a> {
    pub registry: &'a MapRegistry,
    pub control: &'a ServerControl,
    pub store: Option<&'a SaveStore>,
    pub now: GameTick,
}

/// Routes one decoded message into the core. A returned error is a
/// protocol fault: reported to the sender and logged, never fatal to the
/// session loop. Transient gameplay rejections go back as typed reject
/// codes and are not errors here.
pub fn dispatch_message(
    ctx: &DispatchContext,
    session: &mut Session,
    binding: &mut SessionBinding,
    message: &Message,
) -> Result<(), String> {
    let mut reader = PacketReader::new(&message.payload);
    match message.opcode {
        messages::CMSG_PING => {
            session.send(messages::build_pong());
            Ok(())
        }
        messages::CMSG_ENTER_WORLD => handle_enter_world(ctx, session, binding, &mut reader),
        messages::CMSG_MOVE => {
            let x = reader.read_f32_le().ok_or("move: missing x")?;
            let y = reader.read_f32_le().ok_or("move: missing y")?;
            let z = reader.read_f32_le().ok_or("move: missing z")?;
            with_player(ctx, binding, |map, entity| {
                map.move_entity(entity, Position::new(x, y, z), ctx.now)
                    .map_err(|err| err.to_string())
            })
        }
        messages::CMSG_CAST => {
            let spell_id = reader.read_u32_le().ok_or("cast: missing spell id")?;
            let target = reader.read_u32_le().ok_or("cast: missing target")?;
            let target = if target == 0 {
                None
            } else {
                Some(EntityId(target))
            };
            with_player(ctx, binding, |map, entity| {
                if let Err(err) = map.cast_spell(entity, spell_id, target) {
                    if let Some(code) = rejection_code(map.label(), err) {
                        session.send(messages::build_reject(code));
                    }
                }
                Ok(())
            })
        }
        messages::CMSG_CANCEL_CAST => {
            let casting = reader.read_u32_le().ok_or("cancel: missing casting id")?;
            with_player(ctx, binding, |map, entity| {
                map.cancel_casting(entity, CastingId(casting), ctx.now);
                Ok(())
            })
        }
        messages::CMSG_ATTACK => {
            let target = reader.read_u32_le().ok_or("attack: missing target")?;
            with_player(ctx, binding, |map, entity| {
                if let Err(err) = map.basic_attack(entity, EntityId(target), ctx.now) {
                    if let Some(code) = rejection_code(map.label(), err) {
                        session.send(messages::build_reject(code));
                    }
                }
                Ok(())
            })
        }
        messages::CMSG_LOGOUT => {
            session.defer(SessionAction {
                kind: SessionActionKind::Logout,
                due: ctx.now,
            });
            Ok(())
        }
        messages::CMSG_CHAT => {
            let text = reader.read_string(512).ok_or("chat: bad text")?;
            handle_chat(ctx, session, binding, &text)
        }
        opcode => Err(format!("unknown opcode {:#06x}", opcode)),
    }
}

/// Transient gameplay faults become reject codes; data-integrity faults
/// are logged loudly and produce no reply.
fn rejection_code(place: &str, err: CastError) -> Option<u8> {
    match err {
        CastError::Action(action) => Some(action.code()),
        CastError::World(world) => {
            logging::log_error(&format!("{}: {}", place, world));
            None
        }
    }
}

fn with_player(
    ctx: &DispatchContext,
    binding: &SessionBinding,
    operate: impl FnOnce(&mut MapInstance, EntityId) -> Result<(), String>,
) -> Result<(), String> {
    let key = binding.map.ok_or("not in world")?;
    let entity = binding.entity.ok_or("not in world")?;
    let map = ctx.registry.get(key).ok_or("map gone")?;
    let mut map = map.lock().map_err(|_| "map lock poisoned".to_string())?;
    if map.entity(entity).is_none() {
        return Err("player entity gone".to_string());
    }
    operate(&mut map, entity)
}

fn handle_enter_world(
    ctx: &DispatchContext,
    session: &mut Session,
    binding: &mut SessionBinding,
    reader: &mut PacketReader,
) -> Result<(), String> {
    if binding.entity.is_some() {
        return Err("already in world".to_string());
    }
    let world_id = reader.read_u32_le().ok_or("enter: missing world id")?;
    let name = reader.read_string(32).ok_or("enter: bad name")?;
    if name.trim().is_empty() {
        return Err("enter: empty name".to_string());
    }

    session.promote_identity(account_id_for(&name));
    binding.privileged = is_admin_name(&name);

    let saved = match ctx.store {
        Some(store) => store.load_player(&name)?,
        None => None,
    };

    let map = ctx.registry.open_world(world_id);
    let mut map = map.lock().map_err(|_| "map lock poisoned".to_string())?;
    let entity = map
        .spawn_player(name.clone(), session.id(), Position::default())
        .map_err(|err| err.to_string())?;
    if let Some(snapshot) = saved {
        map.restore_player(entity, &snapshot);
    }
    binding.map = Some(MapKey::World(world_id));
    binding.entity = Some(entity);
    logging::log_world(&format!("{} entered world {}", name, world_id));
    Ok(())
}

/// Durable identity derived from the character name; replaces the
/// accept-time session id for logging and save addressing.
fn account_id_for(name: &str) -> u64 {
    use sha1::{Digest, Sha1};
    let mut sha1 = Sha1::new();
    sha1.update(name.trim().to_ascii_lowercase().as_bytes());
    let digest = sha1.finalize();
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

fn is_admin_name(name: &str) -> bool {
    std::env::var("EVERFALL_ADMINS")
        .map(|list| {
            list.split(',')
                .any(|entry| entry.trim().eq_ignore_ascii_case(name.trim()))
        })
        .unwrap_or(false)
}

fn handle_chat(
    ctx: &DispatchContext,
    session: &mut Session,
    binding: &mut SessionBinding,
    text: &str,
) -> Result<(), String> {
    let command = match parse_admin_command(text) {
        Ok(Some(command)) => command,
        // Plain chat is another subsystem's concern; drop it here.
        Ok(None) => return Ok(()),
        Err(err) => {
            session.send(messages::build_notice(&err));
            return Ok(());
        }
    };
    if !binding.privileged {
        session.send(messages::build_notice("you are not allowed to do that"));
        return Ok(());
    }
    match command {
        AdminCommand::Online => {
            let count: usize = ctx
                .registry
                .maps_snapshot()
                .iter()
                .filter_map(|(_, map)| map.lock().ok().map(|map| map.player_count()))
                .sum();
            session.send(messages::build_notice(&format!("{} players online", count)));
            Ok(())
        }
        AdminCommand::Where => {
            let mut reply = None;
            with_player(ctx, binding, |map, entity| {
                reply = map.entity(entity).map(|found| found.position);
                Ok(())
            })?;
            match reply {
                Some(position) => session.send(messages::build_notice(&format!("at {}", position))),
                None => session.send(messages::build_notice("nowhere")),
            }
            Ok(())
        }
        AdminCommand::Teleport { position } => with_player(ctx, binding, |map, entity| {
            map.move_entity(entity, position, ctx.now)
                .map_err(|err| err.to_string())
        }),
        AdminCommand::Heal { amount } => with_player(ctx, binding, |map, entity| {
            map.modify_health(entity, amount, ctx.now)
                .map(|_| ())
                .map_err(|err| err.to_string())
        }),
        AdminCommand::Kick { target: None } => {
            session.send(messages::build_notice("usage: !kick <name>"));
            Ok(())
        }
        AdminCommand::Kick {
            target: Some(target),
        } => {
            let mut kicked = false;
            with_player(ctx, binding, |map, _| {
                if let Some(victim) = find_player_by_name(map, &target) {
                    map.remove_entity(victim);
                    kicked = true;
                }
                Ok(())
            })?;
            let reply = if kicked {
                format!("{} kicked", target)
            } else {
                format!("{} not found", target)
            };
            session.send(messages::build_notice(&reply));
            Ok(())
        }
        AdminCommand::Shutdown => {
            ctx.control.request_shutdown();
            Ok(())
        }
        AdminCommand::Restart => {
            ctx.control.request_restart();
            Ok(())
        }
        AdminCommand::Unknown(name) => {
            session.send(messages::build_notice(&format!(
                "unknown command '{}'",
                name
            )));
            Ok(())
        }
    }
}

fn find_player_by_name(map: &MapInstance, name: &str) -> Option<EntityId> {
    map.player_ids().into_iter().find(|id| {
        map.entity(*id)
            .map(|entity| entity.name.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    })
}

/// Logout is cooperative: while the player is still in combat the action
/// stays queued and polls again on the next pass.
pub fn logout_can_proceed(ctx: &DispatchContext, binding: &SessionBinding) -> bool {
    let (Some(key), Some(entity)) = (binding.map, binding.entity) else {
        return true;
    };
    let Some(map) = ctx.registry.get(key) else {
        return true;
    };
    let Ok(map) = map.lock() else {
        return true;
    };
    match map.entity(entity) {
        Some(found) => !found.combat.in_combat(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_is_stable_and_case_insensitive() {
        assert_eq!(account_id_for("Tamsin"), account_id_for("tamsin"));
        assert_ne!(account_id_for("Tamsin"), account_id_for("Borin"));
    }
}
