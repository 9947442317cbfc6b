use crate::config::WorldSettings;
use crate::net::dispatch::{dispatch_message, logout_can_proceed, DispatchContext, SessionBinding};
use crate::net::session::{
    DisconnectState, Session, SessionAction, SessionActionKind, SessionHub, SessionId,
};
use crate::net::ws;
use crate::persistence::autosave::{autosave_players, AutosaveConfig, AutosaveState};
use crate::persistence::snapshot::{take_snapshot, SaveStore};
use crate::telemetry::logging;
use crate::world::registry::MapRegistry;
use crate::world::time::{GameClock, GameTick, TickTimer};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    Shutdown,
    Restart,
}

#[derive(Debug, Default)]
pub struct ServerControl {
    stopped: AtomicBool,
    restart: AtomicBool,
}

impl ServerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
    }

    pub fn exit_kind(&self) -> ServerExit {
        if self.restart.load(Ordering::Acquire) {
            ServerExit::Restart
        } else {
            ServerExit::Shutdown
        }
    }
}

#[derive(Debug, Clone)]
pub struct GameServerConfig {
    pub bind_addr: String,
    pub ws_bind_addr: Option<String>,
    pub ws_allowed_origins: Option<Vec<String>>,
    pub root: Option<PathBuf>,
    pub write_timeout: Duration,
}

impl Default for GameServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7272".to_string(),
            ws_bind_addr: None,
            ws_allowed_origins: None,
            root: None,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared per-process server state: session id allocation and the global
/// tick timer the driver thread advances.
#[derive(Debug)]
pub struct GameServerState {
    next_session_id: AtomicU64,
    timer: Mutex<TickTimer>,
    settings: Arc<WorldSettings>,
}

impl GameServerState {
    pub fn new(settings: Arc<WorldSettings>) -> Self {
        let clock = GameClock::new(settings.tick_length());
        Self {
            next_session_id: AtomicU64::new(1),
            timer: Mutex::new(TickTimer::new(clock)),
            settings,
        }
    }

    pub fn settings(&self) -> &Arc<WorldSettings> {
        &self.settings
    }

    fn next_session(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst))
    }

    fn tick_clock(&self) -> GameClock {
        match self.timer.lock() {
            Ok(mut timer) => timer.advance_elapsed(),
            Err(_) => GameClock::new(self.settings.tick_length()),
        }
    }

    fn current_tick(&self) -> GameTick {
        self.timer
            .lock()
            .map(|timer| timer.clock().now())
            .unwrap_or(GameTick(0))
    }
}

/// The global tick driver. Decides tick boundaries and hands each one to
/// the registry; the registry fans out and joins per tick.
pub fn spawn_world_tick_loop(
    state: Arc<GameServerState>,
    registry: Arc<MapRegistry>,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let tick_length = state.settings.tick_length();
        let mut last_tick = u64::MAX;
        while control.is_running() {
            let clock = state.tick_clock();
            let tick = clock.now().0;
            if tick != last_tick {
                last_tick = tick;
                registry.update(&clock);
            }
            thread::sleep(tick_length / 2);
        }
    })
}

pub fn spawn_autosave_loop(
    registry: Arc<MapRegistry>,
    store: SaveStore,
    interval_seconds: u64,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let config = AutosaveConfig { interval_seconds };
        let mut state = AutosaveState::new(config, Instant::now());
        while control.is_running() {
            thread::sleep(Duration::from_secs(1));
            let now = Instant::now();
            if !state.due(now) {
                continue;
            }
            let report = autosave_players(&registry, &store);
            if report.saved_players > 0 || !report.errors.is_empty() {
                logging::log_world(&format!(
                    "autosave: {} players saved, {} errors",
                    report.saved_players,
                    report.errors.len()
                ));
            }
            for err in &report.errors {
                logging::log_error(&format!("autosave: {}", err));
            }
            state.mark_saved(now);
        }
    })
}

enum ReadOutcome {
    Data(usize),
    Timeout,
    Closed,
}

/// One byte-stream transport per connection. Both implementations feed
/// raw bytes into the session's frame buffer so message reassembly is
/// identical over TCP and websocket.
trait PacketTransport {
    fn peer_label(&self) -> String;
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), String>;
    fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), String>;
    fn read_into(&mut self, window: &mut [u8]) -> Result<ReadOutcome, String>;
    fn write_message(&mut self, bytes: &[u8]) -> Result<(), String>;
}

struct TcpPacketTransport {
    stream: TcpStream,
}

impl TcpPacketTransport {
    fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl PacketTransport for TcpPacketTransport {
    fn peer_label(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), String> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|err| format!("read timeout set failed: {err}"))
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), String> {
        self.stream
            .set_write_timeout(Some(timeout))
            .map_err(|err| format!("write timeout set failed: {err}"))
    }

    fn read_into(&mut self, window: &mut [u8]) -> Result<ReadOutcome, String> {
        match self.stream.read(window) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(read) => Ok(ReadOutcome::Data(read)),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(ReadOutcome::Timeout)
            }
            Err(err) => Err(format!("read failed: {err}")),
        }
    }

    fn write_message(&mut self, bytes: &[u8]) -> Result<(), String> {
        self.stream
            .write_all(bytes)
            .map_err(|err| format!("write failed: {err}"))
    }
}

const WS_RATE_LIMIT_FRAMES: usize = 400;
const WS_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5);

struct WsRateLimiter {
    window_start: Instant,
    window: Duration,
    max_frames: usize,
    frames: usize,
}

impl WsRateLimiter {
    fn new(max_frames: usize, window: Duration) -> Self {
        Self {
            window_start: Instant::now(),
            window,
            max_frames,
            frames: 0,
        }
    }

    fn check(&mut self) -> Result<(), String> {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.frames = 0;
        }
        if self.frames >= self.max_frames {
            return Err(format!(
                "websocket rate limit exceeded ({} frames per {:?})",
                self.max_frames, self.window
            ));
        }
        self.frames += 1;
        Ok(())
    }
}

struct WsPacketTransport {
    stream: TcpStream,
    pending: Vec<u8>,
    rate_limiter: WsRateLimiter,
}

impl WsPacketTransport {
    fn accept(mut stream: TcpStream, config: &ws::WsHandshakeConfig) -> Result<Self, String> {
        ws::accept_handshake(&mut stream, config)?;
        Ok(Self {
            stream,
            pending: Vec::new(),
            rate_limiter: WsRateLimiter::new(WS_RATE_LIMIT_FRAMES, WS_RATE_LIMIT_WINDOW),
        })
    }
}

impl PacketTransport for WsPacketTransport {
    fn peer_label(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| format!("{addr} (ws)"))
            .unwrap_or_else(|_| "unknown (ws)".to_string())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), String> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|err| format!("read timeout set failed: {err}"))
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), String> {
        self.stream
            .set_write_timeout(Some(timeout))
            .map_err(|err| format!("write timeout set failed: {err}"))
    }

    fn read_into(&mut self, window: &mut [u8]) -> Result<ReadOutcome, String> {
        if self.pending.is_empty() {
            match ws::read_frame(&mut self.stream, window.len().max(1024)) {
                Ok(frame) => match frame.opcode {
                    0x1 | 0x2 => {
                        self.rate_limiter.check()?;
                        self.pending = frame.payload;
                    }
                    0x8 => return Ok(ReadOutcome::Closed),
                    0x9 => {
                        ws::write_frame(&mut self.stream, 0xA, &frame.payload)?;
                        return Ok(ReadOutcome::Timeout);
                    }
                    _ => return Ok(ReadOutcome::Timeout),
                },
                Err(ws::WsFrameError::Timeout) => return Ok(ReadOutcome::Timeout),
                Err(ws::WsFrameError::Closed) => return Ok(ReadOutcome::Closed),
                Err(ws::WsFrameError::Io(err)) => {
                    return Err(format!("websocket read failed: {err}"));
                }
                Err(ws::WsFrameError::Protocol(err)) => {
                    return Err(format!("websocket protocol error: {err}"));
                }
            }
        }
        if self.pending.is_empty() {
            return Ok(ReadOutcome::Timeout);
        }
        let take = self.pending.len().min(window.len());
        window[..take].copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);
        Ok(ReadOutcome::Data(take))
    }

    fn write_message(&mut self, bytes: &[u8]) -> Result<(), String> {
        ws::write_frame(&mut self.stream, 0x2, bytes)
    }
}

/// Optional per-session wire trace, enabled with EVERFALL_TRACE=1.
struct PacketTrace {
    peer: String,
}

impl PacketTrace {
    fn new(peer: String) -> Option<Self> {
        match std::env::var("EVERFALL_TRACE") {
            Ok(value) if value.trim() == "1" => Some(Self { peer }),
            _ => None,
        }
    }

    fn record(&self, direction: &str, bytes: &[u8]) {
        logging::log_net(&format!("{} {} {}B", self.peer, direction, bytes.len()));
    }
}

pub fn run_game_server(
    config: GameServerConfig,
    state: Arc<GameServerState>,
    registry: Arc<MapRegistry>,
    hub: Arc<SessionHub>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    logging::log_net(&format!("game server listening on {}", config.bind_addr));
    accept_loop(listener, &control, |stream| {
        let config = config.clone();
        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        let hub = Arc::clone(&hub);
        let control = Arc::clone(&control);
        thread::spawn(move || {
            handle_game_connection(stream, config, state, registry, hub, control)
        });
    })
}

pub fn run_game_ws_server(
    config: GameServerConfig,
    state: Arc<GameServerState>,
    registry: Arc<MapRegistry>,
    hub: Arc<SessionHub>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let Some(bind_addr) = config.ws_bind_addr.clone() else {
        return Ok(());
    };
    let listener = TcpListener::bind(&bind_addr)
        .map_err(|err| format!("bind {} failed: {}", bind_addr, err))?;
    logging::log_net(&format!("websocket server listening on {}", bind_addr));
    accept_loop(listener, &control, |stream| {
        let config = config.clone();
        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        let hub = Arc::clone(&hub);
        let control = Arc::clone(&control);
        thread::spawn(move || {
            handle_game_ws_connection(stream, config, state, registry, hub, control)
        });
    })
}

fn accept_loop(
    listener: TcpListener,
    control: &Arc<ServerControl>,
    mut on_accept: impl FnMut(TcpStream),
) -> Result<(), String> {
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("listener nonblocking failed: {}", err))?;
    while control.is_running() {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    logging::log_net(&format!("stream blocking reset failed: {}", err));
                    continue;
                }
                on_accept(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                logging::log_net(&format!("accept failed: {}", err));
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
    Ok(())
}

fn handle_game_connection(
    stream: TcpStream,
    config: GameServerConfig,
    state: Arc<GameServerState>,
    registry: Arc<MapRegistry>,
    hub: Arc<SessionHub>,
    control: Arc<ServerControl>,
) {
    let mut transport = TcpPacketTransport::new(stream);
    handle_game_session(&mut transport, &config, &state, &registry, &hub, &control);
}

fn handle_game_ws_connection(
    stream: TcpStream,
    config: GameServerConfig,
    state: Arc<GameServerState>,
    registry: Arc<MapRegistry>,
    hub: Arc<SessionHub>,
    control: Arc<ServerControl>,
) {
    let handshake = ws::WsHandshakeConfig {
        allowed_origins: config.ws_allowed_origins.clone(),
        ..ws::WsHandshakeConfig::default()
    };
    match WsPacketTransport::accept(stream, &handshake) {
        Ok(mut transport) => {
            handle_game_session(&mut transport, &config, &state, &registry, &hub, &control)
        }
        Err(err) => logging::log_net(&format!("websocket handshake rejected: {}", err)),
    }
}

fn handle_game_session<T: PacketTransport>(
    transport: &mut T,
    config: &GameServerConfig,
    state: &GameServerState,
    registry: &MapRegistry,
    hub: &SessionHub,
    control: &ServerControl,
) {
    let settings = state.settings();
    let session_id = state.next_session();
    let mut session = Session::new(
        session_id,
        settings.max_packet * 4,
        settings.heartbeat_ticks(),
    );
    let mut binding = SessionBinding::default();
    let store = config.root.as_deref().map(SaveStore::from_root);
    let trace = PacketTrace::new(transport.peer_label());
    hub.register(session_id, session.outbox());
    logging::log_net(&format!(
        "session {} accepted from {}",
        session_id.0,
        transport.peer_label()
    ));

    if let Err(err) = transport.set_read_timeout(settings.tick_length()) {
        logging::log_net(&err);
        session.force_disconnect();
    }
    if let Err(err) = transport.set_write_timeout(config.write_timeout) {
        logging::log_net(&err);
        session.force_disconnect();
    }

    while session.disconnect_state() == DisconnectState::None {
        if !control.is_running() {
            session.force_disconnect();
            break;
        }

        for outgoing in session.outbox().drain() {
            if let Some(trace) = &trace {
                trace.record("out", &outgoing);
            }
            if let Err(err) = transport.write_message(&outgoing) {
                logging::log_net(&format!("session {}: {}", session_id.0, err));
                session.force_disconnect();
                break;
            }
        }
        if session.disconnect_state() != DisconnectState::None {
            break;
        }

        match transport.read_into(session.frames().read_window()) {
            Ok(ReadOutcome::Data(received)) => {
                match session.frames().on_bytes_received(received) {
                    Ok(decoded) => {
                        session.refresh_heartbeat();
                        let ctx = DispatchContext {
                            registry,
                            control,
                            store: store.as_ref(),
                            now: state.current_tick(),
                        };
                        for message in decoded {
                            if let Some(trace) = &trace {
                                trace.record("in", &message.payload);
                            }
                            if session.is_saving() {
                                // Save in progress: this session's message
                                // processing is paused; drop to the next
                                // poll without dispatching.
                                break;
                            }
                            if let Err(fault) =
                                dispatch_message(&ctx, &mut session, &mut binding, &message)
                            {
                                logging::log_net(&format!(
                                    "session {}: protocol fault: {}",
                                    session_id.0, fault
                                ));
                                session.send(crate::net::messages::build_notice(&fault));
                            }
                        }
                    }
                    Err(err) => {
                        logging::log_net(&format!("session {}: {}", session_id.0, err));
                        session.force_disconnect();
                    }
                }
            }
            Ok(ReadOutcome::Timeout) => {
                if session.tick_heartbeat() {
                    logging::log_net(&format!("session {}: heartbeat flatline", session_id.0));
                    session.force_disconnect();
                }
            }
            Ok(ReadOutcome::Closed) => {
                session.force_disconnect();
            }
            Err(err) => {
                logging::log_net(&format!("session {}: {}", session_id.0, err));
                session.force_disconnect();
            }
        }

        drain_session_actions(state, registry, store.as_ref(), control, &mut session, &mut binding);

        // Kicked or otherwise removed from the world by someone else.
        if let (Some(key), Some(entity)) = (binding.map, binding.entity) {
            let gone = registry
                .get(key)
                .and_then(|map| map.lock().ok().map(|map| map.entity(entity).is_none()))
                .unwrap_or(true);
            if gone {
                binding.map = None;
                binding.entity = None;
                session.force_disconnect();
            }
        }
    }

    leave_world(registry, store.as_ref(), &mut binding);
    for outgoing in session.outbox().drain() {
        let _ = transport.write_message(&outgoing);
    }
    hub.unregister(session_id);
    session.complete_disconnect();
    // Final drain so disposal never races an in-flight deferred action.
    drain_session_actions(state, registry, store.as_ref(), control, &mut session, &mut binding);
    while !session.can_dispose() {
        let _ = session.drain_due_actions(GameTick(u64::MAX));
    }
    logging::log_net(&format!("session {} closed", session_id.0));
}

fn drain_session_actions(
    state: &GameServerState,
    registry: &MapRegistry,
    store: Option<&SaveStore>,
    control: &ServerControl,
    session: &mut Session,
    binding: &mut SessionBinding,
) {
    let now = state.current_tick();
    for action in session.drain_due_actions(now) {
        match action.kind {
            SessionActionKind::Logout => {
                let ctx = DispatchContext {
                    registry,
                    control,
                    store,
                    now,
                };
                if logout_can_proceed(&ctx, binding) {
                    leave_world(registry, store, binding);
                    session.force_disconnect();
                } else {
                    // Still in combat; poll again shortly.
                    session.defer(SessionAction {
                        kind: SessionActionKind::Logout,
                        due: GameTick(now.0.saturating_add(10)),
                    });
                }
            }
            SessionActionKind::Save => {
                session.begin_save();
                save_player(registry, store, binding);
                session.end_save();
            }
        }
    }
}

fn save_player(registry: &MapRegistry, store: Option<&SaveStore>, binding: &SessionBinding) {
    let (Some(store), Some(key), Some(entity)) = (store, binding.map, binding.entity) else {
        return;
    };
    let Some(map) = registry.get(key) else {
        return;
    };
    let snapshot = map
        .lock()
        .ok()
        .and_then(|mut map| map.entity_mut(entity).map(|found| take_snapshot(found)));
    if let Some(snapshot) = snapshot {
        if let Err(err) = store.save_player(&snapshot) {
            logging::log_error(&format!("save failed: {}", err));
        }
    }
}

/// Saves and removes the bound player entity, if any.
fn leave_world(registry: &MapRegistry, store: Option<&SaveStore>, binding: &mut SessionBinding) {
    save_player(registry, store, binding);
    if let (Some(key), Some(entity)) = (binding.map, binding.entity) {
        if let Some(map) = registry.get(key) {
            if let Ok(mut map) = map.lock() {
                map.remove_entity(entity);
            }
        }
    }
    binding.map = None;
    binding.entity = None;
}
