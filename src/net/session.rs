use crate::world::time::GameTick;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectState {
    None,
    Pending,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: u16,
    pub payload: Vec<u8>,
}

/// Fixed receive buffer. Incoming bytes land after any carried-over prefix
/// from an incomplete message; `decode` consumes whole messages and moves
/// the trailing partial back to the front.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Box<[u8]>,
    carry: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity.max(64)].into_boxed_slice(),
            carry: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn carried(&self) -> usize {
        self.carry
    }

    /// Where the next read lands: everything after the carried prefix.
    pub fn read_window(&mut self) -> &mut [u8] {
        let carry = self.carry;
        &mut self.buffer[carry..]
    }

    /// `received` fresh bytes were appended after the carry-over. Decodes
    /// every complete message present; the remainder stays buffered for
    /// the next read.
    pub fn on_bytes_received(&mut self, received: usize) -> Result<Vec<Message>, String> {
        if received == 0 {
            return Err("zero-length read".to_string());
        }
        let filled = self
            .carry
            .checked_add(received)
            .filter(|total| *total <= self.buffer.len())
            .ok_or_else(|| "receive buffer overrun".to_string())?;

        let mut messages = Vec::new();
        let mut cursor = 0usize;
        while filled - cursor >= 2 {
            let length =
                u16::from_le_bytes([self.buffer[cursor], self.buffer[cursor + 1]]) as usize;
            if length < 2 {
                return Err(format!("message length {} below opcode size", length));
            }
            if 2 + length > self.buffer.len() {
                return Err(format!(
                    "message length {} exceeds buffer capacity {}",
                    length,
                    self.buffer.len()
                ));
            }
            if filled - cursor < 2 + length {
                break;
            }
            let body = &self.buffer[cursor + 2..cursor + 2 + length];
            let opcode = u16::from_le_bytes([body[0], body[1]]);
            messages.push(Message {
                opcode,
                payload: body[2..].to_vec(),
            });
            cursor += 2 + length;
        }

        let trailing = filled - cursor;
        self.buffer.copy_within(cursor..filled, 0);
        self.carry = trailing;
        Ok(messages)
    }
}

/// Encodes one message the way the frame decoder expects it.
pub fn encode_message(opcode: u16, payload: &[u8]) -> Vec<u8> {
    let body_len = payload.len() + 2;
    let mut framed = Vec::with_capacity(2 + body_len);
    framed.extend_from_slice(&(body_len as u16).to_le_bytes());
    framed.extend_from_slice(&opcode.to_le_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Queue of already-encoded outgoing messages, shared with the map layer.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<Vec<u8>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Vec<u8>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(message);
        }
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared session id -> outbox lookup. Maps address outgoing traffic
/// through this instead of touching sessions directly.
#[derive(Debug, Default)]
pub struct SessionHub {
    outboxes: Mutex<std::collections::HashMap<SessionId, Arc<Outbox>>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SessionId, outbox: Arc<Outbox>) {
        if let Ok(mut outboxes) = self.outboxes.lock() {
            outboxes.insert(id, outbox);
        }
    }

    pub fn unregister(&self, id: SessionId) {
        if let Ok(mut outboxes) = self.outboxes.lock() {
            outboxes.remove(&id);
        }
    }

    pub fn send(&self, id: SessionId, message: Vec<u8>) {
        if let Ok(outboxes) = self.outboxes.lock() {
            if let Some(outbox) = outboxes.get(&id) {
                outbox.push(message);
            }
        }
    }

    pub fn connected(&self, id: SessionId) -> bool {
        self.outboxes
            .lock()
            .map(|outboxes| outboxes.contains_key(&id))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionActionKind {
    Logout,
    Save,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionAction {
    pub kind: SessionActionKind,
    pub due: GameTick,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    /// Durable identity once known; replaces the accept-time id for
    /// logging and save addressing.
    account: Option<u64>,
    frames: FrameBuffer,
    heartbeat_window: u64,
    heartbeat_remaining: u64,
    disconnect: DisconnectState,
    deferred: VecDeque<SessionAction>,
    outbox: Arc<Outbox>,
    saving: bool,
}

impl Session {
    pub fn new(id: SessionId, buffer_capacity: usize, heartbeat_window: u64) -> Self {
        let heartbeat_window = heartbeat_window.max(1);
        Self {
            id,
            account: None,
            frames: FrameBuffer::new(buffer_capacity),
            heartbeat_window,
            heartbeat_remaining: heartbeat_window,
            disconnect: DisconnectState::None,
            deferred: VecDeque::new(),
            outbox: Arc::new(Outbox::new()),
            saving: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn account(&self) -> Option<u64> {
        self.account
    }

    pub fn promote_identity(&mut self, account: u64) {
        self.account = Some(account);
    }

    pub fn frames(&mut self) -> &mut FrameBuffer {
        &mut self.frames
    }

    pub fn outbox(&self) -> Arc<Outbox> {
        Arc::clone(&self.outbox)
    }

    pub fn send(&self, message: Vec<u8>) {
        if self.disconnect != DisconnectState::Complete {
            self.outbox.push(message);
        }
    }

    /// Received-traffic evidence arrived; the liveness window restarts.
    pub fn refresh_heartbeat(&mut self) {
        self.heartbeat_remaining = self.heartbeat_window;
    }

    /// One tick without traffic. Returns true on flatline, at which point
    /// the caller force-disconnects.
    pub fn tick_heartbeat(&mut self) -> bool {
        self.heartbeat_remaining = self.heartbeat_remaining.saturating_sub(1);
        self.heartbeat_remaining == 0
    }

    pub fn disconnect_state(&self) -> DisconnectState {
        self.disconnect
    }

    /// Idempotent: once a disconnect is pending or complete, repeated
    /// calls change nothing.
    pub fn force_disconnect(&mut self) -> bool {
        if self.disconnect == DisconnectState::None {
            self.disconnect = DisconnectState::Pending;
            true
        } else {
            false
        }
    }

    pub fn complete_disconnect(&mut self) {
        if self.disconnect == DisconnectState::Pending {
            self.disconnect = DisconnectState::Complete;
        }
    }

    /// Disposal requires both a completed disconnect and an empty
    /// deferred queue, so in-flight callbacks referencing the session
    /// finish first.
    pub fn can_dispose(&self) -> bool {
        self.disconnect == DisconnectState::Complete && self.deferred.is_empty()
    }

    pub fn defer(&mut self, action: SessionAction) {
        self.deferred.push_back(action);
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Due actions, drained in order. Blocked while a save is running; a
    /// pending action polls again on the owner's next update rather than
    /// being preempted.
    pub fn drain_due_actions(&mut self, now: GameTick) -> Vec<SessionAction> {
        if self.saving {
            return Vec::new();
        }
        let mut due = Vec::new();
        while let Some(action) = self.deferred.front() {
            if action.due <= now {
                due.push(self.deferred.pop_front().expect("front checked"));
            } else {
                break;
            }
        }
        due
    }

    pub fn begin_save(&mut self) {
        self.saving = true;
    }

    pub fn end_save(&mut self) {
        self.saving = false;
    }

    /// Message processing pauses for this session while its save runs.
    pub fn is_saving(&self) -> bool {
        self.saving
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_next(state: &mut u64) -> u32 {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (*state >> 32) as u32
    }

    fn feed_all(buffer: &mut FrameBuffer, bytes: &[u8]) -> Vec<Message> {
        let window = buffer.read_window();
        window[..bytes.len()].copy_from_slice(bytes);
        buffer.on_bytes_received(bytes.len()).expect("decode")
    }

    fn sample_stream() -> (Vec<u8>, Vec<Message>) {
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for opcode in 1u16..=8 {
            let payload: Vec<u8> = (0..(opcode as u8 * 3)).collect();
            stream.extend_from_slice(&encode_message(opcode, &payload));
            expected.push(Message { opcode, payload });
        }
        (stream, expected)
    }

    #[test]
    fn single_feed_decodes_all_messages() {
        let (stream, expected) = sample_stream();
        let mut buffer = FrameBuffer::new(4096);
        let messages = feed_all(&mut buffer, &stream);
        assert_eq!(messages, expected);
        assert_eq!(buffer.carried(), 0);
    }

    #[test]
    fn arbitrary_partial_feeds_decode_identically() {
        let (stream, expected) = sample_stream();
        let mut state = 0x00c0_ffee_0000_0001u64;
        for _ in 0..64 {
            let mut buffer = FrameBuffer::new(4096);
            let mut decoded = Vec::new();
            let mut offset = 0usize;
            while offset < stream.len() {
                let chunk = 1 + (lcg_next(&mut state) as usize) % 17;
                let chunk = chunk.min(stream.len() - offset);
                decoded.extend(feed_all(&mut buffer, &stream[offset..offset + chunk]));
                offset += chunk;
            }
            assert_eq!(decoded, expected);
            assert_eq!(buffer.carried(), 0);
        }
    }

    #[test]
    fn zero_length_read_is_an_error() {
        let mut buffer = FrameBuffer::new(256);
        assert!(buffer.on_bytes_received(0).is_err());
    }

    #[test]
    fn oversized_message_is_an_error() {
        let mut buffer = FrameBuffer::new(64);
        let frame = encode_message(1, &[0u8; 16]);
        let window = buffer.read_window();
        window[0] = 0xff;
        window[1] = 0x7f;
        window[2..frame.len()].copy_from_slice(&frame[2..]);
        assert!(buffer.on_bytes_received(frame.len()).is_err());
    }

    #[test]
    fn force_disconnect_is_idempotent() {
        let mut session = Session::new(SessionId(1), 256, 10);
        assert_eq!(session.disconnect_state(), DisconnectState::None);
        assert!(session.force_disconnect());
        assert!(!session.force_disconnect());
        assert_eq!(session.disconnect_state(), DisconnectState::Pending);
        session.complete_disconnect();
        assert!(!session.force_disconnect());
        assert_eq!(session.disconnect_state(), DisconnectState::Complete);
    }

    #[test]
    fn disposal_waits_for_deferred_actions() {
        let mut session = Session::new(SessionId(1), 256, 10);
        session.defer(SessionAction {
            kind: SessionActionKind::Logout,
            due: GameTick(5),
        });
        session.force_disconnect();
        session.complete_disconnect();
        assert!(!session.can_dispose());

        assert!(session.drain_due_actions(GameTick(4)).is_empty());
        let due = session.drain_due_actions(GameTick(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, SessionActionKind::Logout);
        assert!(session.can_dispose());
    }

    #[test]
    fn saving_blocks_deferred_actions() {
        let mut session = Session::new(SessionId(1), 256, 10);
        session.defer(SessionAction {
            kind: SessionActionKind::Save,
            due: GameTick(0),
        });
        session.begin_save();
        assert!(session.drain_due_actions(GameTick(10)).is_empty());
        session.end_save();
        assert_eq!(session.drain_due_actions(GameTick(10)).len(), 1);
    }

    #[test]
    fn heartbeat_flatlines_without_traffic() {
        let mut session = Session::new(SessionId(1), 256, 3);
        assert!(!session.tick_heartbeat());
        assert!(!session.tick_heartbeat());
        assert!(session.tick_heartbeat());

        session.refresh_heartbeat();
        assert!(!session.tick_heartbeat());
    }
}
