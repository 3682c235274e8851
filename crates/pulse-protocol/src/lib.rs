//! Pulse Protocol -- wire types, packet codec, session timing.
//!
//! One TCP stream per producer/viewer pair.
//! Frame: 1-byte packet code + 4-byte big-endian length + serde JSON payload.

pub mod codec;
pub mod messages;
pub mod timing;

pub use codec::{Packet, PacketCodec, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use messages::*;
pub use timing::{SessionTiming, DEFAULT_TIMING};

/// Service type advertised by log viewers on the local network.
pub const SERVICE_TYPE: &str = "_pulse._tcp";

/// Service domain used when browsing for viewers.
pub const SERVICE_DOMAIN: &str = "local";

/// Closed set of packet codes. Anything else decodes as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketCode {
    ClientHello,
    ServerHello,
    Pause,
    Resume,
    Ping,
    StoreMessage,
    StoreRequest,
    Unknown(u8),
}

impl From<u8> for PacketCode {
    fn from(raw: u8) -> Self {
        match raw {
            1 => PacketCode::ClientHello,
            2 => PacketCode::ServerHello,
            3 => PacketCode::Pause,
            4 => PacketCode::Resume,
            5 => PacketCode::Ping,
            6 => PacketCode::StoreMessage,
            7 => PacketCode::StoreRequest,
            other => PacketCode::Unknown(other),
        }
    }
}

impl From<PacketCode> for u8 {
    fn from(code: PacketCode) -> Self {
        match code {
            PacketCode::ClientHello => 1,
            PacketCode::ServerHello => 2,
            PacketCode::Pause => 3,
            PacketCode::Resume => 4,
            PacketCode::Ping => 5,
            PacketCode::StoreMessage => 6,
            PacketCode::StoreRequest => 7,
            PacketCode::Unknown(raw) => raw,
        }
    }
}

impl PacketCode {
    pub fn name(&self) -> &'static str {
        match self {
            PacketCode::ClientHello => "client-hello",
            PacketCode::ServerHello => "server-hello",
            PacketCode::Pause => "pause",
            PacketCode::Resume => "resume",
            PacketCode::Ping => "ping",
            PacketCode::StoreMessage => "store-message",
            PacketCode::StoreRequest => "store-request",
            PacketCode::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for PacketCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketCode::Unknown(raw) => write!(f, "unknown({raw})"),
            known => f.write_str(known.name()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: PacketCode, got: PacketCode },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
