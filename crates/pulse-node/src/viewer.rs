//! Viewer -- the consuming end of remote logging.
//!
//! Accepts producer connections, answers the handshake, keeps each producer
//! alive with pings and stores whatever it streams. Pause/resume applies to
//! every connected producer at once.
//!
//! Per connection:
//!   1. wait (up to the handshake timeout) for `ClientHello`
//!   2. reply `ServerHello`, then `Resume` (or `Pause` while paused)
//!   3. ping every ping interval; drop the producer after `ping_timeout`
//!      without any packet from it

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use pulse_protocol::{
    ClientHello, LoggerMessage, NetworkMessage, Packet, PacketCode, PacketCodec, ServerHello,
    SessionTiming,
};
use pulse_store::{LogStore, SqliteStore};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::config::validate_timing;

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub listen_addr: String,
    pub name: String,
    pub timing: SessionTiming,
    pub start_paused: bool,
}

/// A connected producer.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub device_id: Uuid,
    pub device_name: String,
    pub app_name: String,
    pub connected_at: DateTime<Utc>,
}

type ClientMap = Arc<Mutex<HashMap<u64, ClientInfo>>>;

/// Control surface of a running viewer.
pub struct ViewerHandle {
    local_addr: SocketAddr,
    paused: watch::Sender<bool>,
    clients: ClientMap,
    shutdown: broadcast::Sender<()>,
}

impl ViewerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask every producer to hold its logs.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        match self.clients.lock() {
            Ok(clients) => {
                let mut list: Vec<ClientInfo> = clients.values().cloned().collect();
                list.sort_by_key(|c| c.id);
                list
            }
            Err(_) => Vec::new(),
        }
    }

    /// Stop accepting and close every producer connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Bind and start accepting producers.
pub async fn run_viewer(
    config: ViewerConfig,
    store: Arc<SqliteStore>,
) -> anyhow::Result<(ViewerHandle, JoinHandle<()>)> {
    validate_timing(&config.timing)?;
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, name = %config.name, "viewer: listening");

    let (paused, _) = watch::channel(config.start_paused);
    let (shutdown, _) = broadcast::channel(1);
    let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));

    let handle = ViewerHandle {
        local_addr,
        paused: paused.clone(),
        clients: clients.clone(),
        shutdown: shutdown.clone(),
    };

    let config = Arc::new(config);
    let mut shutdown_rx = shutdown.subscribe();
    let task = tokio::spawn(async move {
        let mut next_id: u64 = 1;
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, addr)) => {
                            let id = next_id;
                            next_id += 1;
                            tracing::debug!(client = id, %addr, "viewer: accepted");
                            let client = ClientTask {
                                id,
                                addr,
                                config: config.clone(),
                                store: store.clone(),
                                paused: paused.subscribe(),
                                clients: clients.clone(),
                                shutdown: shutdown.subscribe(),
                            };
                            tokio::spawn(client.run(stream));
                        }
                        Err(e) => {
                            tracing::error!("viewer: accept error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("viewer: shutting down");
                    break;
                }
            }
        }
    });

    Ok((handle, task))
}

struct ClientTask {
    id: u64,
    addr: SocketAddr,
    config: Arc<ViewerConfig>,
    store: Arc<SqliteStore>,
    paused: watch::Receiver<bool>,
    clients: ClientMap,
    shutdown: broadcast::Receiver<()>,
}

/// Framed halves of one producer stream.
struct Wire {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    codec: PacketCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Wire {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            codec: PacketCodec,
            read_buf: BytesMut::with_capacity(16 * 1024),
            write_buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: Packet) -> anyhow::Result<()> {
        self.codec.encode(packet, &mut self.write_buf)?;
        let result = self.writer.write_all(&self.write_buf).await;
        self.write_buf.clear();
        Ok(result?)
    }

    /// Next complete packet, or `None` on clean EOF.
    async fn recv(&mut self) -> anyhow::Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.read_buf)? {
                return Ok(Some(packet));
            }
            if self.reader.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}

impl ClientTask {
    async fn run(mut self, stream: TcpStream) {
        let id = self.id;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(client = id, "viewer: set_nodelay failed: {e}");
        }
        let mut wire = Wire::new(stream);

        match self.serve(&mut wire).await {
            Ok(()) => tracing::info!(client = id, "viewer: producer disconnected"),
            Err(e) => tracing::warn!(client = id, "viewer: producer dropped: {e}"),
        }

        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&id);
        }
    }

    async fn serve(&mut self, wire: &mut Wire) -> anyhow::Result<()> {
        let hello = tokio::time::timeout(self.config.timing.handshake_timeout, wire.recv())
            .await
            .map_err(|_| anyhow::anyhow!("no client hello within handshake timeout"))??;
        let Some(hello) = hello else {
            return Ok(());
        };
        let hello: ClientHello = hello.decode_as(PacketCode::ClientHello)?;

        tracing::info!(
            client = self.id,
            addr = %self.addr,
            device = %hello.device_info.name,
            app = %hello.app_info.name,
            device_id = %hello.device_id,
            "viewer: producer connected"
        );
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(
                self.id,
                ClientInfo {
                    id: self.id,
                    addr: self.addr,
                    device_id: hello.device_id,
                    device_name: hello.device_info.name.clone(),
                    app_name: hello.app_info.name.clone(),
                    connected_at: Utc::now(),
                },
            );
        }

        let reply = ServerHello {
            name: Some(self.config.name.clone()),
            version: Some(env!("CARGO_PKG_VERSION").into()),
        };
        wire.send(Packet::encode(PacketCode::ServerHello, &reply)?)
            .await?;

        // Sent either way: a reconnecting producer keeps its last pause state
        let paused = *self.paused.borrow_and_update();
        let code = if paused { PacketCode::Pause } else { PacketCode::Resume };
        wire.send(Packet::empty(code)).await?;

        let timing = self.config.timing;
        let mut ping = tokio::time::interval(timing.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_seen.elapsed() > timing.ping_timeout {
                        anyhow::bail!("no packets from producer within ping timeout");
                    }
                    wire.send(Packet::empty(PacketCode::Ping)).await?;
                }
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let paused = *self.paused.borrow_and_update();
                    let code = if paused { PacketCode::Pause } else { PacketCode::Resume };
                    tracing::debug!(client = self.id, %code, "viewer: streaming toggled");
                    wire.send(Packet::empty(code)).await?;
                }
                packet = wire.recv() => {
                    let Some(packet) = packet? else {
                        return Ok(());
                    };
                    last_seen = Instant::now();
                    self.handle_packet(packet);
                }
                _ = self.shutdown.recv() => {
                    return Ok(());
                }
            }
        }
    }

    fn handle_packet(&self, packet: Packet) {
        match packet.code {
            PacketCode::StoreMessage => match packet.decode::<LoggerMessage>() {
                Ok(message) => {
                    if let Err(e) = self.store.store_message(&message) {
                        tracing::error!(client = self.id, "viewer: failed to store message: {e}");
                    }
                }
                Err(e) => tracing::warn!(client = self.id, "viewer: bad message payload: {e}"),
            },
            PacketCode::StoreRequest => match packet.decode::<NetworkMessage>() {
                Ok(request) => {
                    if let Err(e) = self.store.store_request(&request) {
                        tracing::error!(client = self.id, "viewer: failed to store request: {e}");
                    }
                }
                Err(e) => tracing::warn!(client = self.id, "viewer: bad request payload: {e}"),
            },
            PacketCode::Ping => {}
            other => tracing::debug!(client = self.id, code = %other, "viewer: ignoring packet"),
        }
    }
}
