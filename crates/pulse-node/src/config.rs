//! Configuration types for pulse-node.
//! Parsed from ~/.pulse/config.toml.

use pulse_protocol::{AppInfo, SessionTiming, DEFAULT_TIMING};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub viewer: ViewerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    #[serde(default = "default_api_token")]
    pub api_token: String,
    /// Label attached to log lines read from stdin.
    #[serde(default = "default_label")]
    pub label: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            database: default_database(),
            api_addr: default_api_addr(),
            api_token: default_api_token(),
            label: default_label(),
        }
    }
}

/// Identifies the producing application to viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    pub bundle_identifier: Option<String>,
    pub version: Option<String>,
    pub build: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            bundle_identifier: None,
            version: Some(env!("CARGO_PKG_VERSION").into()),
            build: None,
        }
    }
}

impl AppSection {
    pub fn app_info(&self) -> AppInfo {
        AppInfo {
            bundle_identifier: self.bundle_identifier.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            build: self.build.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Viewers to browse for, by name. Each is re-resolved every refresh.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            refresh_secs: default_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    /// `host:port`, resolved with the system resolver.
    pub addr: String,
}

/// Protocol timers, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_connection_retry_ms")]
    pub connection_retry_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_browser_retry_ms")]
    pub browser_retry_ms: u64,
    #[serde(default = "default_startup_buffer_ms")]
    pub startup_buffer_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            connection_retry_ms: default_connection_retry_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            browser_retry_ms: default_browser_retry_ms(),
            startup_buffer_ms: default_startup_buffer_ms(),
        }
    }
}

impl SessionSection {
    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            connection_retry: Duration::from_millis(self.connection_retry_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            browser_retry: Duration::from_millis(self.browser_retry_ms),
            startup_buffer: Duration::from_millis(self.startup_buffer_ms),
        }
    }

    /// Reject timings the session and viewer cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_timing(&self.timing())
    }
}

/// Every interval must be non-zero, and a viewer pinging on schedule must
/// never trip the producer's no-ping timeout.
pub fn validate_timing(timing: &SessionTiming) -> anyhow::Result<()> {
    let intervals = [
        ("connection_retry_ms", timing.connection_retry),
        ("handshake_timeout_ms", timing.handshake_timeout),
        ("ping_interval_ms", timing.ping_interval),
        ("ping_timeout_ms", timing.ping_timeout),
        ("browser_retry_ms", timing.browser_retry),
        ("startup_buffer_ms", timing.startup_buffer),
    ];
    for (name, value) in intervals {
        if value.is_zero() {
            anyhow::bail!("[session] {name} must be greater than zero");
        }
    }
    if timing.ping_timeout <= timing.ping_interval {
        anyhow::bail!(
            "[session] ping_timeout_ms ({}) must exceed ping_interval_ms ({})",
            timing.ping_timeout.as_millis(),
            timing.ping_interval.as_millis()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerSection {
    #[serde(default = "default_viewer_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_viewer_name")]
    pub name: String,
    #[serde(default = "default_viewer_database")]
    pub database: String,
    /// Start with streaming paused; producers connect but hold their logs.
    #[serde(default)]
    pub start_paused: bool,
}

impl Default for ViewerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_viewer_listen_addr(),
            name: default_viewer_name(),
            database: default_viewer_database(),
            start_paused: false,
        }
    }
}

// Default value functions
fn default_database() -> String {
    "~/.pulse/logs.db".into()
}
fn default_api_addr() -> String {
    "127.0.0.1:9480".into()
}
fn default_api_token() -> String {
    "~/.pulse/api-token".into()
}
fn default_label() -> String {
    "stdin".into()
}
fn default_app_name() -> String {
    "pulse-node".into()
}
fn default_refresh_secs() -> u64 {
    5
}
fn default_connection_retry_ms() -> u64 {
    DEFAULT_TIMING.connection_retry.as_millis() as u64
}
fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_TIMING.handshake_timeout.as_millis() as u64
}
fn default_ping_interval_ms() -> u64 {
    DEFAULT_TIMING.ping_interval.as_millis() as u64
}
fn default_ping_timeout_ms() -> u64 {
    DEFAULT_TIMING.ping_timeout.as_millis() as u64
}
fn default_browser_retry_ms() -> u64 {
    DEFAULT_TIMING.browser_retry.as_millis() as u64
}
fn default_startup_buffer_ms() -> u64 {
    DEFAULT_TIMING.startup_buffer.as_millis() as u64
}
fn default_viewer_listen_addr() -> String {
    "0.0.0.0:9481".into()
}
fn default_viewer_name() -> String {
    "Pulse Viewer".into()
}
fn default_viewer_database() -> String {
    "~/.pulse/viewer.db".into()
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.session.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
