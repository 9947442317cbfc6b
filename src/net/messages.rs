use crate::entities::death::DeathState;
use crate::entities::entity::{EntityId, EntityKind};
use crate::entities::properties::PropertyUpdate;
use crate::entities::vitals::VitalKind;
use crate::net::packet::PacketWriter;
use crate::net::session::encode_message;
use crate::world::position::Position;

// Client -> server.
pub const CMSG_PING: u16 = 0x01;
pub const CMSG_ENTER_WORLD: u16 = 0x02;
pub const CMSG_MOVE: u16 = 0x03;
pub const CMSG_CAST: u16 = 0x04;
pub const CMSG_CANCEL_CAST: u16 = 0x05;
pub const CMSG_ATTACK: u16 = 0x06;
pub const CMSG_LOGOUT: u16 = 0x07;
pub const CMSG_CHAT: u16 = 0x08;

// Server -> client.
pub const SMSG_PONG: u16 = 0x81;
pub const SMSG_WORLD_JOINED: u16 = 0x82;
pub const SMSG_ENTITY_APPEAR: u16 = 0x83;
pub const SMSG_ENTITY_DISAPPEAR: u16 = 0x84;
pub const SMSG_PROPERTY_BATCH: u16 = 0x85;
pub const SMSG_VITAL_UPDATE: u16 = 0x86;
pub const SMSG_DEATH_STATE: u16 = 0x87;
pub const SMSG_COMBAT_FLAG: u16 = 0x88;
pub const SMSG_REJECT: u16 = 0x89;
pub const SMSG_NOTICE: u16 = 0x8a;

pub fn build_pong() -> Vec<u8> {
    encode_message(SMSG_PONG, &[])
}

pub fn build_world_joined(id: EntityId, position: Position) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(16);
    writer.write_u32_le(id.0);
    write_position(&mut writer, position);
    encode_message(SMSG_WORLD_JOINED, writer.as_slice())
}

pub fn build_entity_appear(
    id: EntityId,
    kind: EntityKind,
    name: &str,
    position: Position,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(24 + name.len());
    writer.write_u32_le(id.0);
    writer.write_u8(kind.raw());
    writer.write_string(name);
    write_position(&mut writer, position);
    encode_message(SMSG_ENTITY_APPEAR, writer.as_slice())
}

pub fn build_entity_disappear(id: EntityId) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(4);
    writer.write_u32_le(id.0);
    encode_message(SMSG_ENTITY_DISAPPEAR, writer.as_slice())
}

/// One batched update per entity per tick, only the kinds that changed.
pub fn build_property_batch(id: EntityId, updates: &[PropertyUpdate]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(6 + updates.len() * 5);
    writer.write_u32_le(id.0);
    writer.write_u16_le(updates.len() as u16);
    for update in updates {
        writer.write_u8(update.kind.raw());
        writer.write_f32_le(update.value);
    }
    encode_message(SMSG_PROPERTY_BATCH, writer.as_slice())
}

pub fn build_vital_update(id: EntityId, vital: VitalKind, value: f32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(9);
    writer.write_u32_le(id.0);
    writer.write_u8(vital.raw());
    writer.write_f32_le(value);
    encode_message(SMSG_VITAL_UPDATE, writer.as_slice())
}

pub fn build_death_state(id: EntityId, state: DeathState) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u32_le(id.0);
    writer.write_u8(state.raw());
    encode_message(SMSG_DEATH_STATE, writer.as_slice())
}

pub fn build_combat_flag(id: EntityId, in_combat: bool) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u32_le(id.0);
    writer.write_u8(u8::from(in_combat));
    encode_message(SMSG_COMBAT_FLAG, writer.as_slice())
}

pub fn build_reject(code: u8) -> Vec<u8> {
    encode_message(SMSG_REJECT, &[code])
}

pub fn build_notice(text: &str) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(2 + text.len());
    writer.write_string(text);
    encode_message(SMSG_NOTICE, writer.as_slice())
}

fn write_position(writer: &mut PacketWriter, position: Position) {
    writer.write_f32_le(position.x);
    writer.write_f32_le(position.y);
    writer.write_f32_le(position.z);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::properties::PropertyKind;
    use crate::net::packet::PacketReader;

    fn body_of(framed: &[u8]) -> (u16, Vec<u8>) {
        let length = u16::from_le_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(framed.len(), 2 + length);
        let opcode = u16::from_le_bytes([framed[2], framed[3]]);
        (opcode, framed[4..].to_vec())
    }

    #[test]
    fn property_batch_layout() {
        let updates = [
            PropertyUpdate {
                kind: PropertyKind::HealthCapacity,
                value: 132.0,
            },
            PropertyUpdate {
                kind: PropertyKind::Armor,
                value: 55.5,
            },
        ];
        let framed = build_property_batch(EntityId(9), &updates);
        let (opcode, body) = body_of(&framed);
        assert_eq!(opcode, SMSG_PROPERTY_BATCH);

        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_u32_le(), Some(9));
        assert_eq!(reader.read_u16_le(), Some(2));
        assert_eq!(reader.read_u8(), Some(PropertyKind::HealthCapacity.raw()));
        assert_eq!(reader.read_f32_le(), Some(132.0));
        assert_eq!(reader.read_u8(), Some(PropertyKind::Armor.raw()));
        assert_eq!(reader.read_f32_le(), Some(55.5));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn appear_carries_name_and_position() {
        let framed = build_entity_appear(
            EntityId(3),
            EntityKind::Npc,
            "Mire Stalker",
            Position::new(1.0, 2.0, 3.0),
        );
        let (opcode, body) = body_of(&framed);
        assert_eq!(opcode, SMSG_ENTITY_APPEAR);
        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_u32_le(), Some(3));
        assert_eq!(reader.read_u8(), Some(EntityKind::Npc.raw()));
        assert_eq!(reader.read_string(64).as_deref(), Some("Mire Stalker"));
        assert_eq!(reader.read_f32_le(), Some(1.0));
        assert_eq!(reader.read_f32_le(), Some(2.0));
        assert_eq!(reader.read_f32_le(), Some(3.0));
    }
}
