//! Payload types carried by packets.
//!
//! Field names are camelCase on the wire so viewers on any platform can
//! decode them without a schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Handshake
// ============================================================================

/// Sent once per connection by the producer, after the transport is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub device_id: Uuid,
    pub device_info: DeviceInfo,
    pub app_info: AppInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub system_name: String,
    pub system_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    #[serde(default)]
    pub bundle_identifier: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
}

/// Viewer's reply to `ClientHello`. The payload is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

// ============================================================================
// Log messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
        }
    }

    /// Sort key persisted alongside the level name.
    pub fn order(&self) -> i64 {
        *self as i64
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "notice" => Ok(Level::Notice),
            "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" => Ok(Level::Critical),
            other => Err(format!("unknown level: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerMessage {
    pub created_at: DateTime<Utc>,
    pub level: Level,
    pub label: String,
    pub session: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub line: u32,
}

// ============================================================================
// Network messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub url: Option<String>,
    pub http_method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponse {
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkError {
    pub code: i64,
    pub domain: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMessage {
    pub created_at: DateTime<Utc>,
    pub session: String,
    pub request: NetworkRequest,
    pub response: Option<NetworkResponse>,
    pub error: Option<NetworkError>,
    pub metrics: Option<NetworkMetrics>,
    /// Raw body bytes, base64 on the wire.
    #[serde(default, with = "base64_opt_bytes")]
    pub request_body: Option<Vec<u8>>,
    #[serde(default, with = "base64_opt_bytes")]
    pub response_body: Option<Vec<u8>>,
}

impl NetworkMessage {
    pub fn host(&self) -> Option<String> {
        let url = self.request.url.as_deref()?;
        let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
        let authority = rest.split(['/', '?', '#']).next()?;
        let host = authority.rsplit('@').next()?;
        let host = host.split(':').next()?;
        (!host.is_empty()).then(|| host.to_string())
    }
}

// ============================================================================
// Store events
// ============================================================================

/// An entity the store just persisted. The remote logger forwards these
/// without inspecting them beyond the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "camelCase")]
pub enum LogEvent {
    MessageStored(LoggerMessage),
    NetworkMessageStored(NetworkMessage),
}

impl LogEvent {
    /// Packet code used to forward this event to a viewer.
    pub fn packet_code(&self) -> crate::PacketCode {
        match self {
            LogEvent::MessageStored(_) => crate::PacketCode::StoreMessage,
            LogEvent::NetworkMessageStored(_) => crate::PacketCode::StoreRequest,
        }
    }

    /// Encode the inner entity as a packet.
    pub fn to_packet(&self) -> Result<crate::Packet, crate::ProtocolError> {
        match self {
            LogEvent::MessageStored(message) => crate::Packet::encode(self.packet_code(), message),
            LogEvent::NetworkMessageStored(message) => {
                crate::Packet::encode(self.packet_code(), message)
            }
        }
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize/deserialize Option<Vec<u8>> as an optional base64 string.
mod base64_opt_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_network_message() -> NetworkMessage {
        NetworkMessage {
            created_at: Utc::now(),
            session: "s1".into(),
            request: NetworkRequest {
                url: Some("https://user@api.example.com:8443/v1/users?page=2".into()),
                http_method: Some("GET".into()),
                headers: BTreeMap::new(),
            },
            response: Some(NetworkResponse {
                status_code: Some(200),
                headers: BTreeMap::new(),
            }),
            error: None,
            metrics: Some(NetworkMetrics { duration_secs: 0.25 }),
            request_body: None,
            response_body: Some(vec![1, 2, 3, 4]),
        }
    }

    #[test]
    fn test_client_hello_wire_keys() {
        let hello = ClientHello {
            device_id: Uuid::nil(),
            device_info: DeviceInfo {
                name: "device".into(),
                model: None,
                system_name: "iOS".into(),
                system_version: "17.0".into(),
                locale: None,
            },
            app_info: AppInfo {
                bundle_identifier: Some("com.example".into()),
                name: "App".into(),
                version: None,
                build: None,
            },
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["deviceId"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["deviceInfo"]["systemName"], "iOS");
        assert_eq!(json["appInfo"]["bundleIdentifier"], "com.example");
    }

    #[test]
    fn test_body_is_base64_on_wire() {
        let message = sample_network_message();
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("AQIDBA==")); // base64 of [1,2,3,4]

        let decoded: NetworkMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.response_body, Some(vec![1, 2, 3, 4]));
        assert_eq!(decoded.request_body, None);
    }

    #[test]
    fn test_host_extraction() {
        let message = sample_network_message();
        assert_eq!(message.host().as_deref(), Some("api.example.com"));

        let mut bare = sample_network_message();
        bare.request.url = Some("example.org/path".into());
        assert_eq!(bare.host().as_deref(), Some("example.org"));

        bare.request.url = None;
        assert_eq!(bare.host(), None);
    }

    #[test]
    fn test_level_ordering_and_parse() {
        assert!(Level::Trace < Level::Info);
        assert!(Level::Error < Level::Critical);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warning);
        assert!("loud".parse::<Level>().is_err());
        assert_eq!(Level::Notice.order(), 3);
    }

    #[test]
    fn test_empty_server_hello_accepted() {
        let hello: ServerHello = serde_json::from_str("{}").unwrap();
        assert_eq!(hello, ServerHello::default());
    }

    #[test]
    fn test_log_event_routing() {
        let event = LogEvent::NetworkMessageStored(sample_network_message());
        let packet = event.to_packet().unwrap();
        assert_eq!(packet.code, crate::PacketCode::StoreRequest);
        let decoded: NetworkMessage = packet.decode().unwrap();
        assert_eq!(decoded.session, "s1");
    }
}
