//! Producer side of one viewer connection: a TCP stream framed with
//! `PacketCodec`.
//!
//! Each connection runs as its own task and reports back to the session loop
//! tagged with its `ConnectionId`, so reports from a replaced connection are
//! recognised as stale.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use pulse_protocol::{Packet, PacketCodec};
use pulse_session::ConnectionId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

use crate::session_task::SessionInput;

/// What a connection tells the session.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Transport established; the handshake can start.
    Ready,
    Packet(Packet),
    /// Connect error, I/O error, framing error or EOF. Terminal.
    Failed(String),
}

/// Handle to a running connection task.
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Packet>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Start connecting to `endpoint`. Progress is reported on `inputs`; a
    /// connect that takes longer than `connect_timeout` fails.
    pub fn open(
        id: ConnectionId,
        endpoint: SocketAddr,
        connect_timeout: Duration,
        inputs: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            id,
            endpoint,
            connect_timeout,
            outbound_rx,
            inputs,
        ));
        Self { id, outbound, task }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a packet. Packets are written in order once the stream is up.
    pub fn send(&self, packet: Packet) -> bool {
        self.outbound.send(packet).is_ok()
    }

    /// Stop the connection. Idempotent.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn report(inputs: &mpsc::UnboundedSender<SessionInput>, id: ConnectionId, event: ConnectionEvent) {
    let _ = inputs.send(SessionInput::Connection { id, event });
}

async fn run_connection(
    id: ConnectionId,
    endpoint: SocketAddr,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    inputs: mpsc::UnboundedSender<SessionInput>,
) {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            report(&inputs, id, ConnectionEvent::Failed(format!("connect {endpoint}: {e}")));
            return;
        }
        Err(_) => {
            report(
                &inputs,
                id,
                ConnectionEvent::Failed(format!("connect {endpoint}: timed out")),
            );
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(connection = id, "conn: set_nodelay failed: {e}");
    }
    tracing::debug!(connection = id, %endpoint, "conn: transport ready");
    report(&inputs, id, ConnectionEvent::Ready);

    let (mut reader, mut writer) = stream.into_split();
    let mut codec = PacketCodec;
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let mut write_buf = BytesMut::new();

    loop {
        tokio::select! {
            read = reader.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        report(&inputs, id, ConnectionEvent::Failed("closed by viewer".into()));
                        return;
                    }
                    Ok(_) => loop {
                        match codec.decode(&mut read_buf) {
                            Ok(Some(packet)) => {
                                tracing::trace!(connection = id, code = %packet.code, len = packet.payload.len(), "conn: packet in");
                                report(&inputs, id, ConnectionEvent::Packet(packet));
                            }
                            Ok(None) => break,
                            Err(e) => {
                                report(&inputs, id, ConnectionEvent::Failed(format!("framing: {e}")));
                                return;
                            }
                        }
                    },
                    Err(e) => {
                        report(&inputs, id, ConnectionEvent::Failed(format!("read: {e}")));
                        return;
                    }
                }
            }
            packet = outbound.recv() => {
                let Some(packet) = packet else {
                    // Handle dropped without cancel
                    return;
                };
                let code = packet.code;
                if let Err(e) = codec.encode(packet, &mut write_buf) {
                    // Oversized packets are refused before they reach the wire
                    tracing::warn!(connection = id, %code, "conn: dropping packet: {e}");
                    write_buf.clear();
                    continue;
                }
                if let Err(e) = writer.write_all(&write_buf).await {
                    report(&inputs, id, ConnectionEvent::Failed(format!("write: {e}")));
                    return;
                }
                write_buf.clear();
            }
        }
    }
}
