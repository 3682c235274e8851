//! Test harness for in-process pulse-node integration tests.
//!
//! Provides TestViewer (a real viewer on loopback) and TestProducer (a real
//! producer session browsing for it), running in the same tokio runtime with
//! protocol timers scaled down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pulse_node::config::{NodeConfig, PeerEntry, SessionSection};
use pulse_node::preferences::{MemorySettings, SettingsStore};
use pulse_node::producer::Producer;
use pulse_node::viewer::{run_viewer, ViewerConfig, ViewerHandle};
use pulse_protocol::{Level, SessionTiming, DEFAULT_TIMING};
use pulse_session::{ConnectionState, SessionSnapshot};
use pulse_store::{MessageQuery, SqliteStore};

/// Protocol timers divided by this factor. Large enough to keep tests fast,
/// small enough that loopback handshakes fit in the startup window.
pub const TIME_SCALE: u32 = 4;

pub const VIEWER_NAME: &str = "Test Viewer";

pub fn timing() -> SessionTiming {
    DEFAULT_TIMING.scaled(TIME_SCALE)
}

/// Generous bound for anything that should happen within a few protocol
/// intervals.
pub fn patience() -> Duration {
    timing().handshake_timeout * 2
}

/// Poll `check` until it returns true, or fail after `timeout`.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub struct TestViewer {
    pub handle: ViewerHandle,
    pub store: Arc<SqliteStore>,
    task: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestViewer {
    pub async fn start(start_paused: bool) -> anyhow::Result<Self> {
        Self::start_on("127.0.0.1:0", start_paused).await
    }

    pub async fn start_on(addr: &str, start_paused: bool) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::open_in_memory()?);
        let (handle, task) = run_viewer(
            ViewerConfig {
                listen_addr: addr.into(),
                name: VIEWER_NAME.into(),
                timing: timing(),
                start_paused,
            },
            store.clone(),
        )
        .await?;
        Ok(Self {
            handle,
            store,
            task,
        })
    }

    pub fn texts(&self) -> Vec<String> {
        let mut texts: Vec<String> = self
            .store
            .messages(&MessageQuery {
                limit: 1000,
                ..Default::default()
            })
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.message.text)
            .collect();
        // Query is newest first
        texts.reverse();
        texts
    }

    pub async fn wait_texts(&self, expected: &[&str]) -> anyhow::Result<()> {
        let result = wait_until("viewer messages", patience(), || async move {
            self.texts().len() >= expected.len()
        })
        .await;
        let texts = self.texts();
        if result.is_err() || texts != expected {
            anyhow::bail!("viewer has {texts:?}, expected {expected:?}");
        }
        Ok(())
    }

    pub async fn wait_clients(&self, n: usize) -> anyhow::Result<()> {
        wait_until("viewer clients", patience(), || async move {
            self.handle.clients().len() == n
        })
        .await
    }

    pub async fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.task.await;
        // Give client tasks a moment to close their streams
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub struct TestProducer {
    pub producer: Producer,
    pub settings: Arc<MemorySettings>,
}

#[allow(dead_code)]
impl TestProducer {
    /// Producer with remote logging enabled and `viewer` selected.
    pub fn start(viewer_addr: std::net::SocketAddr) -> Self {
        let settings = Arc::new(MemorySettings::default());
        settings
            .set("remote-logger.is-enabled", "true")
            .expect("settings");
        settings
            .set("remote-logger.selected-peer", VIEWER_NAME)
            .expect("settings");
        Self::start_with(viewer_addr, settings)
    }

    pub fn start_with(viewer_addr: std::net::SocketAddr, settings: Arc<MemorySettings>) -> Self {
        let timing = timing();
        let mut cfg = NodeConfig::default();
        cfg.app.name = "integration".into();
        cfg.discovery.peers = vec![PeerEntry {
            name: VIEWER_NAME.into(),
            addr: viewer_addr.to_string(),
        }];
        cfg.discovery.refresh_secs = 1;
        cfg.session = SessionSection {
            connection_retry_ms: timing.connection_retry.as_millis() as u64,
            handshake_timeout_ms: timing.handshake_timeout.as_millis() as u64,
            ping_interval_ms: timing.ping_interval.as_millis() as u64,
            ping_timeout_ms: timing.ping_timeout.as_millis() as u64,
            browser_retry_ms: timing.browser_retry.as_millis() as u64,
            startup_buffer_ms: timing.startup_buffer.as_millis() as u64,
        };

        let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
        let producer = Producer::start(&cfg, store, settings.clone());
        Self { producer, settings }
    }

    pub fn log(&self, text: &str) {
        self.producer.log(Level::Info, text).expect("store message");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.producer.session.snapshot()
    }

    pub async fn wait_state(&self, state: ConnectionState) -> anyhow::Result<()> {
        wait_until(state.name(), patience(), || async move {
            self.producer.session.connection_state() == state
        })
        .await
    }

    /// Connected and streaming (the viewer's resume has arrived).
    pub async fn wait_streaming(&self) -> anyhow::Result<()> {
        wait_until("streaming", patience(), || async move {
            let s = self.snapshot();
            s.state == ConnectionState::Connected && !s.is_paused
        })
        .await
    }

    pub async fn shutdown(self) {
        self.producer.shutdown().await;
    }
}
