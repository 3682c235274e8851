//! Session background task -- the single execution context of the producer.
//!
//! Owns the `Session`, the browser, the live connection and the timer tasks.
//! Everything (UI commands, store events, browser reports, connection
//! reports, timer firings) arrives as a `SessionInput` on one channel:
//!   1. feed the input to the session -> Vec<SessionAction>
//!   2. apply each action in order
//!   3. publish the new snapshot on the watch channel

use std::collections::HashMap;
use std::time::Duration;

use pulse_protocol::LogEvent;
use pulse_session::{
    ConnectionId, ConnectionState, PeerDescriptor, Session, SessionAction, SessionSnapshot,
    TimerKind, TimerToken,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionEvent};
use crate::discovery::{Browser, BrowserEvent, BrowserSink};
use crate::preferences::Preferences;

/// Requests from the public handle.
#[derive(Debug)]
pub enum SessionCommand {
    Enable,
    Disable,
    Connect(PeerDescriptor),
    Record(LogEvent),
    Shutdown,
}

/// Everything the session loop reacts to.
#[derive(Debug)]
pub enum SessionInput {
    Command(SessionCommand),
    Browser {
        generation: u64,
        event: BrowserEvent,
    },
    Connection {
        id: ConnectionId,
        event: ConnectionEvent,
    },
    TimerFired {
        timer: TimerKind,
        token: TimerToken,
    },
}

/// Cloneable handle to a running session loop. All calls are non-blocking.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    fn command(&self, command: SessionCommand) -> bool {
        self.inputs.send(SessionInput::Command(command)).is_ok()
    }

    pub fn enable(&self) -> bool {
        self.command(SessionCommand::Enable)
    }

    pub fn disable(&self) -> bool {
        self.command(SessionCommand::Disable)
    }

    pub fn connect(&self, peer: PeerDescriptor) -> bool {
        self.command(SessionCommand::Connect(peer))
    }

    /// Hand a store event to the session. Returns `false` once the loop is gone.
    pub fn record(&self, event: LogEvent) -> bool {
        self.command(SessionCommand::Record(event))
    }

    pub fn shutdown(&self) {
        self.command(SessionCommand::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.inputs.is_closed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_selected(&self, peer: &PeerDescriptor) -> bool {
        self.snapshot.borrow().is_selected(peer)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn discovered_peers(&self) -> Vec<PeerDescriptor> {
        self.snapshot.borrow().discovered_peers.clone()
    }

    /// Observe snapshots as they change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

/// Spawn the session loop. The returned handle drives it; the join handle
/// completes after `shutdown`.
pub fn spawn_session(
    session: Session,
    browser: Box<dyn Browser>,
    preferences: Preferences,
) -> (SessionHandle, JoinHandle<()>) {
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

    let handle = SessionHandle {
        inputs: inputs_tx.clone(),
        snapshot: snapshot_rx,
    };
    let task = tokio::spawn(run_session_loop(
        session,
        inputs_tx,
        inputs_rx,
        snapshot_tx,
        browser,
        preferences,
    ));
    (handle, task)
}

/// Side-effect executor for session actions.
struct Runtime {
    inputs: mpsc::UnboundedSender<SessionInput>,
    browser: Box<dyn Browser>,
    browse_generation: u64,
    connection: Option<Connection>,
    /// Upper bound on the TCP connect; the handshake timeout only starts at `Ready`.
    connect_timeout: Duration,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    preferences: Preferences,
}

impl Runtime {
    fn apply(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            self.apply_one(action);
        }
    }

    fn apply_one(&mut self, action: SessionAction) {
        match action {
            SessionAction::StartBrowser => {
                self.browse_generation += 1;
                self.browser
                    .start(BrowserSink::new(self.browse_generation, self.inputs.clone()));
            }
            SessionAction::CancelBrowser => {
                // Bumping the generation orphans anything already queued
                self.browse_generation += 1;
                self.browser.cancel();
            }
            SessionAction::OpenConnection { id, peer } => {
                if let Some(old) = self.connection.take() {
                    old.cancel();
                }
                self.connection = Some(Connection::open(
                    id,
                    peer.endpoint,
                    self.connect_timeout,
                    self.inputs.clone(),
                ));
            }
            SessionAction::CancelConnection { id } => {
                if self.connection.as_ref().map(Connection::id) == Some(id) {
                    if let Some(conn) = self.connection.take() {
                        conn.cancel();
                    }
                }
            }
            SessionAction::Send { connection, packet } => match &self.connection {
                Some(conn) if conn.id() == connection => {
                    tracing::trace!(connection, code = %packet.code, "session-task: send");
                    if !conn.send(packet) {
                        tracing::debug!(connection, "session-task: connection task gone, packet dropped");
                    }
                }
                _ => tracing::debug!(connection, "session-task: send on stale connection dropped"),
            },
            SessionAction::ArmTimer {
                timer,
                token,
                after,
            } => {
                if let Some(old) = self.timers.remove(&timer) {
                    old.abort();
                }
                let inputs = self.inputs.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = inputs.send(SessionInput::TimerFired { timer, token });
                });
                self.timers.insert(timer, task);
            }
            SessionAction::CancelTimer(timer) => {
                if let Some(task) = self.timers.remove(&timer) {
                    task.abort();
                }
            }
            SessionAction::PersistEnabled(enabled) => self.preferences.set_enabled(enabled),
            SessionAction::PersistSelectedPeer(name) => self.preferences.set_selected_peer(&name),
        }
    }

    fn shutdown(&mut self) {
        self.browser.cancel();
        if let Some(conn) = self.connection.take() {
            conn.cancel();
        }
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}

/// Run the session loop until shutdown or until every handle is dropped.
pub async fn run_session_loop(
    mut session: Session,
    inputs_tx: mpsc::UnboundedSender<SessionInput>,
    mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    snapshot: watch::Sender<SessionSnapshot>,
    browser: Box<dyn Browser>,
    preferences: Preferences,
) {
    // The loop holds a sender for its own sinks, so dropped handles show up
    // as closed snapshot receivers rather than a closed input channel
    let mut runtime = Runtime {
        inputs: inputs_tx,
        browser,
        browse_generation: 0,
        connection: None,
        connect_timeout: session.timing().handshake_timeout,
        timers: HashMap::new(),
        preferences,
    };

    tracing::info!(
        enabled = session.is_enabled(),
        selected = session.selected_peer().unwrap_or("(none)"),
        "session-task: started"
    );
    runtime.apply(session.initialize());
    publish(&snapshot, &session);

    loop {
        let input = tokio::select! {
            input = inputs.recv() => input,
            _ = snapshot.closed() => {
                tracing::debug!("session-task: all handles dropped");
                break;
            }
        };
        let Some(input) = input else { break };

        let actions = match input {
            SessionInput::Command(SessionCommand::Shutdown) => break,
            SessionInput::Command(SessionCommand::Enable) => session.enable(),
            SessionInput::Command(SessionCommand::Disable) => session.disable(),
            SessionInput::Command(SessionCommand::Connect(peer)) => session.connect(peer),
            SessionInput::Command(SessionCommand::Record(event)) => session.record(event),
            SessionInput::Browser { generation, event } => {
                if generation != runtime.browse_generation {
                    tracing::trace!(generation, "session-task: stale browser report ignored");
                    continue;
                }
                match event {
                    BrowserEvent::PeersChanged(peers) => session.peers_changed(peers),
                    BrowserEvent::Failed(reason) => session.browser_failed(&reason),
                }
            }
            SessionInput::Connection { id, event } => match event {
                ConnectionEvent::Ready => session.connection_ready(id),
                ConnectionEvent::Packet(packet) => session.packet_received(id, packet),
                ConnectionEvent::Failed(reason) => session.connection_failed(id, &reason),
            },
            SessionInput::TimerFired { timer, token } => session.timer_fired(timer, token),
        };

        runtime.apply(actions);
        publish(&snapshot, &session);
    }

    runtime.shutdown();
    tracing::info!("session-task: stopped");
}

fn publish(snapshot: &watch::Sender<SessionSnapshot>, session: &Session) {
    let next = session.snapshot();
    snapshot.send_if_modified(|current| {
        if *current != next {
            *current = next;
            true
        } else {
            false
        }
    });
}
