//! Pulse Session -- remote logging state machine.
//!
//! Pure and synchronous: every input returns the ordered actions the runtime
//! must perform (start/cancel browsing, open/cancel connections, send
//! packets, arm/cancel timers, persist preferences).
//! Manages Idle → Connecting → Connected with fixed-interval retry.
//!
//! Stale callbacks are discarded by id: every connection gets a fresh
//! `ConnectionId` and every armed timer a fresh `TimerToken`.

use pulse_protocol::{ClientHello, LogEvent, Packet, PacketCode, ServerHello, SessionTiming};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

pub type ConnectionId = u64;
pub type TimerToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// A viewer found on the local network. Compared by name for selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerDescriptor {
    pub name: String,
    pub endpoint: SocketAddr,
}

impl PeerDescriptor {
    pub fn new(name: impl Into<String>, endpoint: SocketAddr) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Drops the startup buffer. Armed once, on initialize.
    StartupBuffer,
    BrowserRetry,
    ConnectionRetry,
    HandshakeTimeout,
    /// Periodic outbound ping while connected.
    Ping,
    /// Fires when the viewer has not pinged for `ping_timeout`.
    PingTimeout,
}

impl TimerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TimerKind::StartupBuffer => "startup-buffer",
            TimerKind::BrowserRetry => "browser-retry",
            TimerKind::ConnectionRetry => "connection-retry",
            TimerKind::HandshakeTimeout => "handshake-timeout",
            TimerKind::Ping => "ping",
            TimerKind::PingTimeout => "ping-timeout",
        }
    }

    /// Timers owned by a connection attempt. None survive a return to idle.
    pub const CONNECTION_TIMERS: [TimerKind; 4] = [
        TimerKind::ConnectionRetry,
        TimerKind::HandshakeTimeout,
        TimerKind::Ping,
        TimerKind::PingTimeout,
    ];
}

/// Side effects requested by the session, in the order they must happen.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    StartBrowser,
    CancelBrowser,
    OpenConnection {
        id: ConnectionId,
        peer: PeerDescriptor,
    },
    CancelConnection {
        id: ConnectionId,
    },
    Send {
        connection: ConnectionId,
        packet: Packet,
    },
    ArmTimer {
        timer: TimerKind,
        token: TimerToken,
        after: Duration,
    },
    CancelTimer(TimerKind),
    PersistEnabled(bool),
    PersistSelectedPeer(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hello: ClientHello,
    pub timing: SessionTiming,
    /// Persisted "remote logging enabled" preference.
    pub enabled: bool,
    /// Persisted name of the last selected viewer.
    pub selected_peer: Option<String>,
}

/// Read-only view of the session for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub connected_peer: Option<PeerDescriptor>,
    pub discovered_peers: Vec<PeerDescriptor>,
    pub is_enabled: bool,
    pub selected_peer: Option<String>,
    pub is_paused: bool,
}

impl SessionSnapshot {
    pub fn is_selected(&self, peer: &PeerDescriptor) -> bool {
        self.selected_peer.as_deref() == Some(peer.name.as_str())
    }
}

/// Remote logging session.
pub struct Session {
    state: ConnectionState,
    hello: ClientHello,
    timing: SessionTiming,
    enabled: bool,
    selected_peer: Option<String>,
    initialized: bool,
    browsing: bool,
    discovered: Vec<PeerDescriptor>,
    connected_peer: Option<PeerDescriptor>,
    connection: Option<ConnectionId>,
    next_connection_id: ConnectionId,
    timers: HashMap<TimerKind, TimerToken>,
    next_timer_token: TimerToken,
    paused: bool,
    /// Covers the gap between launch and the first connection. `None` once
    /// the startup window has passed; never recreated.
    buffer: Option<VecDeque<LogEvent>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            hello: config.hello,
            timing: config.timing,
            enabled: config.enabled,
            selected_peer: config.selected_peer.filter(|name| !name.is_empty()),
            initialized: false,
            browsing: false,
            discovered: Vec::new(),
            connected_peer: None,
            connection: None,
            next_connection_id: 1,
            timers: HashMap::new(),
            next_timer_token: 1,
            paused: true,
            buffer: Some(VecDeque::new()),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected_peer(&self) -> Option<&PeerDescriptor> {
        self.connected_peer.as_ref()
    }

    pub fn discovered_peers(&self) -> &[PeerDescriptor] {
        &self.discovered
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn selected_peer(&self) -> Option<&str> {
        self.selected_peer.as_deref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn is_timer_armed(&self, timer: TimerKind) -> bool {
        self.timers.contains_key(&timer)
    }

    /// Number of buffered events, or `None` once the buffer is gone.
    pub fn timing(&self) -> SessionTiming {
        self.timing
    }

    pub fn buffered(&self) -> Option<usize> {
        self.buffer.as_ref().map(VecDeque::len)
    }

    /// Returns `true` if `peer` is the remembered selection.
    pub fn is_selected(&self, peer: &PeerDescriptor) -> bool {
        self.selected_peer.as_deref() == Some(peer.name.as_str())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            connected_peer: self.connected_peer.clone(),
            discovered_peers: self.discovered.clone(),
            is_enabled: self.enabled,
            selected_peer: self.selected_peer.clone(),
            is_paused: self.paused,
        }
    }

    // ------------------------------------------------------------------
    // Public inputs
    // ------------------------------------------------------------------

    /// Start the session: arm the startup buffer deadline and, if remote
    /// logging was left enabled, start browsing.
    pub fn initialize(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.initialized {
            return actions;
        }
        self.initialized = true;

        self.arm_timer(TimerKind::StartupBuffer, self.timing.startup_buffer, &mut actions);
        if self.enabled {
            self.start_browser(&mut actions);
        }
        actions
    }

    /// Enable remote logging and start searching for viewers.
    pub fn enable(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.enabled {
            self.enabled = true;
            actions.push(SessionAction::PersistEnabled(true));
        }
        self.start_browser(&mut actions);
        actions
    }

    /// Disable remote logging: stop browsing, drop the connection and every
    /// connection timer. Returns the session to idle.
    pub fn disable(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.enabled {
            self.enabled = false;
            actions.push(SessionAction::PersistEnabled(false));
        }
        self.cancel_browser(&mut actions);
        self.cancel_timer(TimerKind::BrowserRetry, &mut actions);
        self.cancel_connection(&mut actions);
        self.discovered.clear();
        actions
    }

    /// Connect to `peer` and remember it as the selection. Replaces any
    /// connection to a different peer.
    pub fn connect(&mut self, peer: PeerDescriptor) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if self.selected_peer.as_deref() != Some(peer.name.as_str()) {
            self.selected_peer = Some(peer.name.clone());
            actions.push(SessionAction::PersistSelectedPeer(peer.name.clone()));
        }

        if !self.enabled {
            tracing::debug!(
                peer = %peer.name,
                "session: remote logging disabled, selection remembered"
            );
            return actions;
        }

        match self.state {
            ConnectionState::Idle => self.open_connection(peer, &mut actions),
            ConnectionState::Connecting | ConnectionState::Connected => {
                if self.connected_peer.as_ref().map(|p| p.name.as_str()) == Some(peer.name.as_str())
                {
                    return actions;
                }
                self.cancel_connection(&mut actions);
                self.open_connection(peer, &mut actions);
            }
        }
        actions
    }

    /// Forward a store event, or buffer it while paused or disconnected.
    pub fn record(&mut self, event: LogEvent) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.paused || self.state != ConnectionState::Connected {
            match self.buffer.as_mut() {
                Some(buffer) => buffer.push_back(event),
                None => tracing::trace!(
                    state = self.state.name(),
                    paused = self.paused,
                    "session: event dropped, not streaming"
                ),
            }
        } else {
            self.send_event(&event, &mut actions);
        }
        actions
    }

    /// Browser reported the current set of viewers.
    pub fn peers_changed(&mut self, peers: Vec<PeerDescriptor>) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.enabled {
            return actions;
        }

        tracing::info!(
            peers = ?peers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "session: discovered peers"
        );
        self.discovered = peers;
        self.connect_automatically_if_needed(&mut actions);
        actions
    }

    /// Browser failed. Retried after `browser_retry` while still enabled.
    pub fn browser_failed(&mut self, reason: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.enabled || !self.browsing {
            return actions;
        }

        tracing::warn!(reason, "session: browser failed, scheduling retry");
        self.cancel_browser(&mut actions);
        self.arm_timer(TimerKind::BrowserRetry, self.timing.browser_retry, &mut actions);
        actions
    }

    /// Transport for connection `id` is ready: say hello.
    pub fn connection_ready(&mut self, id: ConnectionId) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.is_current(id) || self.state != ConnectionState::Connecting {
            return actions;
        }

        tracing::debug!(connection = id, "session: connection ready, sending hello");
        match Packet::encode(PacketCode::ClientHello, &self.hello) {
            Ok(packet) => actions.push(SessionAction::Send {
                connection: id,
                packet,
            }),
            Err(e) => {
                tracing::warn!(connection = id, "session: failed to encode hello: {e}");
                self.schedule_connection_retry(&mut actions);
                return actions;
            }
        }
        self.arm_timer(
            TimerKind::HandshakeTimeout,
            self.timing.handshake_timeout,
            &mut actions,
        );
        actions
    }

    /// Transport for connection `id` failed (I/O, protocol error, EOF).
    pub fn connection_failed(&mut self, id: ConnectionId, reason: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.is_current(id) {
            return actions;
        }

        tracing::warn!(connection = id, reason, "session: connection failed");
        self.schedule_connection_retry(&mut actions);
        actions
    }

    /// A packet arrived on connection `id`.
    pub fn packet_received(&mut self, id: ConnectionId, packet: Packet) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.is_current(id) {
            return actions;
        }

        tracing::debug!(connection = id, code = %packet.code, "session: received packet");
        match packet.code {
            PacketCode::ServerHello => self.handle_server_hello(&packet, &mut actions),
            PacketCode::Pause => {
                self.paused = true;
            }
            PacketCode::Resume => {
                self.paused = false;
                if self.state == ConnectionState::Connected {
                    self.flush_buffer(&mut actions);
                }
            }
            PacketCode::Ping => {
                if self.state == ConnectionState::Connected {
                    self.arm_timer(TimerKind::PingTimeout, self.timing.ping_timeout, &mut actions);
                }
            }
            PacketCode::ClientHello | PacketCode::StoreMessage | PacketCode::StoreRequest => {
                tracing::debug!(code = %packet.code, "session: unexpected packet from viewer");
            }
            PacketCode::Unknown(raw) => {
                tracing::debug!(code = raw, "session: ignoring packet with unknown code");
            }
        }
        actions
    }

    /// A timer fired. Firings with a token that is no longer armed are stale
    /// and ignored.
    pub fn timer_fired(&mut self, timer: TimerKind, token: TimerToken) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.timers.get(&timer) != Some(&token) {
            tracing::trace!(timer = timer.name(), token, "session: stale timer ignored");
            return actions;
        }
        self.timers.remove(&timer);

        match timer {
            TimerKind::StartupBuffer => {
                if let Some(buffer) = self.buffer.take() {
                    if !buffer.is_empty() {
                        tracing::debug!(
                            dropped = buffer.len(),
                            "session: startup window over, dropping buffered events"
                        );
                    }
                }
            }
            TimerKind::BrowserRetry => self.start_browser(&mut actions),
            TimerKind::ConnectionRetry => {
                if self.state == ConnectionState::Connecting {
                    if let Some(peer) = self.connected_peer.clone() {
                        self.open_connection(peer, &mut actions);
                    }
                }
            }
            TimerKind::HandshakeTimeout => {
                if self.state == ConnectionState::Connecting {
                    tracing::warn!("session: handshake with viewer timed out");
                    self.schedule_connection_retry(&mut actions);
                }
            }
            TimerKind::Ping => {
                if self.state == ConnectionState::Connected {
                    self.send_ping(&mut actions);
                }
            }
            TimerKind::PingTimeout => {
                if self.state == ConnectionState::Connected {
                    tracing::warn!("session: no ping from viewer in a while, reconnecting");
                    self.schedule_connection_retry(&mut actions);
                }
            }
        }
        actions
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn is_current(&self, id: ConnectionId) -> bool {
        self.state != ConnectionState::Idle && self.connection == Some(id)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::info!(
                from = self.state.name(),
                to = state.name(),
                "session: connection state changed"
            );
            self.state = state;
        }
    }

    fn start_browser(&mut self, actions: &mut Vec<SessionAction>) {
        if !self.enabled || self.browsing {
            return;
        }
        tracing::info!("session: starting browser");
        self.browsing = true;
        self.cancel_timer(TimerKind::BrowserRetry, actions);
        actions.push(SessionAction::StartBrowser);
    }

    fn cancel_browser(&mut self, actions: &mut Vec<SessionAction>) {
        if self.browsing {
            self.browsing = false;
            actions.push(SessionAction::CancelBrowser);
        }
    }

    fn connect_automatically_if_needed(&mut self, actions: &mut Vec<SessionAction>) {
        if self.state != ConnectionState::Idle {
            return;
        }
        let Some(selected) = self.selected_peer.as_deref() else {
            return;
        };
        let Some(peer) = self.discovered.iter().find(|p| p.name == selected).cloned() else {
            return;
        };

        tracing::info!(peer = %peer.name, endpoint = %peer.endpoint, "session: connecting automatically");
        self.open_connection(peer, actions);
    }

    fn open_connection(&mut self, peer: PeerDescriptor, actions: &mut Vec<SessionAction>) {
        for timer in TimerKind::CONNECTION_TIMERS {
            self.cancel_timer(timer, actions);
        }
        if let Some(old) = self.connection.take() {
            actions.push(SessionAction::CancelConnection { id: old });
        }

        // Prefer the freshest endpoint the browser reported for this name
        let peer = self
            .discovered
            .iter()
            .find(|p| p.name == peer.name)
            .cloned()
            .unwrap_or(peer);

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        tracing::info!(
            connection = id,
            peer = %peer.name,
            endpoint = %peer.endpoint,
            "session: opening connection"
        );

        self.connected_peer = Some(peer.clone());
        self.connection = Some(id);
        self.set_state(ConnectionState::Connecting);
        actions.push(SessionAction::OpenConnection { id, peer });
    }

    fn cancel_connection(&mut self, actions: &mut Vec<SessionAction>) {
        self.set_state(ConnectionState::Idle);
        self.connected_peer = None;
        if let Some(id) = self.connection.take() {
            actions.push(SessionAction::CancelConnection { id });
        }
        for timer in TimerKind::CONNECTION_TIMERS {
            self.cancel_timer(timer, actions);
        }
    }

    fn schedule_connection_retry(&mut self, actions: &mut Vec<SessionAction>) {
        if self.state == ConnectionState::Idle || self.is_timer_armed(TimerKind::ConnectionRetry) {
            return;
        }

        self.cancel_timer(TimerKind::HandshakeTimeout, actions);
        self.cancel_timer(TimerKind::Ping, actions);
        self.cancel_timer(TimerKind::PingTimeout, actions);
        if let Some(id) = self.connection.take() {
            actions.push(SessionAction::CancelConnection { id });
        }

        self.set_state(ConnectionState::Connecting);
        self.arm_timer(
            TimerKind::ConnectionRetry,
            self.timing.connection_retry,
            actions,
        );
    }

    fn handle_server_hello(&mut self, packet: &Packet, actions: &mut Vec<SessionAction>) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        if !packet.payload.is_empty() {
            match packet.decode::<ServerHello>() {
                Ok(hello) => tracing::info!(
                    viewer = hello.name.as_deref().unwrap_or("unknown"),
                    version = hello.version.as_deref().unwrap_or("unknown"),
                    "session: viewer accepted handshake"
                ),
                Err(e) => tracing::debug!("session: unreadable server hello payload: {e}"),
            }
        }

        self.cancel_timer(TimerKind::HandshakeTimeout, actions);
        self.set_state(ConnectionState::Connected);
        self.send_ping(actions);
        self.arm_timer(TimerKind::PingTimeout, self.timing.ping_timeout, actions);
        if !self.paused {
            self.flush_buffer(actions);
        }
    }

    fn send_ping(&mut self, actions: &mut Vec<SessionAction>) {
        if let Some(connection) = self.connection {
            actions.push(SessionAction::Send {
                connection,
                packet: Packet::empty(PacketCode::Ping),
            });
        }
        self.arm_timer(TimerKind::Ping, self.timing.ping_interval, actions);
    }

    fn flush_buffer(&mut self, actions: &mut Vec<SessionAction>) {
        let pending: Vec<LogEvent> = match self.buffer.as_mut() {
            Some(buffer) => buffer.drain(..).collect(),
            None => return,
        };
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "session: flushing buffered events");
        }
        for event in &pending {
            self.send_event(event, actions);
        }
    }

    fn send_event(&self, event: &LogEvent, actions: &mut Vec<SessionAction>) {
        let Some(connection) = self.connection else {
            return;
        };
        match event.to_packet() {
            Ok(packet) => actions.push(SessionAction::Send { connection, packet }),
            Err(e) => {
                tracing::warn!(code = %event.packet_code(), "session: failed to encode event, dropping: {e}");
            }
        }
    }

    fn arm_timer(&mut self, timer: TimerKind, after: Duration, actions: &mut Vec<SessionAction>) {
        self.cancel_timer(timer, actions);
        let token = self.next_timer_token;
        self.next_timer_token += 1;
        self.timers.insert(timer, token);
        actions.push(SessionAction::ArmTimer {
            timer,
            token,
            after,
        });
    }

    fn cancel_timer(&mut self, timer: TimerKind, actions: &mut Vec<SessionAction>) {
        if self.timers.remove(&timer).is_some() {
            actions.push(SessionAction::CancelTimer(timer));
        }
    }
}
