//! Producer wiring: preferences -> session -> browser, plus the store event
//! forwarder.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pulse_api::{AppState, ControlRequest};
use pulse_protocol::{Level, LoggerMessage};
use pulse_session::{Session, SessionConfig};
use pulse_store::{LogStore, SqliteStore};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::device;
use crate::discovery::StaticBrowser;
use crate::event_source::spawn_event_forwarder;
use crate::preferences::{Preferences, SettingsStore};
use crate::session_task::{spawn_session, SessionHandle};

/// A running producer: everything stored in `store` is streamed to the
/// selected viewer.
pub struct Producer {
    pub session: SessionHandle,
    pub store: Arc<SqliteStore>,
    /// Log session id shared by every message this process writes.
    log_session: String,
    label: String,
    session_task: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl Producer {
    /// Start the session loop and the event forwarder. Must be called from
    /// inside a tokio runtime.
    pub fn start(
        cfg: &NodeConfig,
        store: Arc<SqliteStore>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let preferences = Preferences::new(settings);
        let hello = device::client_hello(preferences.device_id(), cfg.app.app_info());
        let session = Session::new(SessionConfig {
            hello,
            timing: cfg.session.timing(),
            enabled: preferences.is_enabled(),
            selected_peer: preferences.selected_peer(),
        });
        let browser = StaticBrowser::new(
            cfg.discovery.peers.clone(),
            Duration::from_secs(cfg.discovery.refresh_secs.max(1)),
        );

        // Subscribe before the session starts so no early event is missed
        let events = store.subscribe();
        let (session, session_task) = spawn_session(session, Box::new(browser), preferences);
        let forwarder = spawn_event_forwarder(events, session.clone());

        Self {
            session,
            store,
            log_session: uuid::Uuid::new_v4().to_string(),
            label: cfg.node.label.clone(),
            session_task,
            forwarder,
        }
    }

    /// Store a log line under the configured label.
    pub fn log(&self, level: Level, text: impl Into<String>) -> pulse_store::Result<i64> {
        self.store.store_message(&LoggerMessage {
            created_at: Utc::now(),
            level,
            label: self.label.clone(),
            session: self.log_session.clone(),
            text: text.into(),
            metadata: Default::default(),
            file: String::new(),
            function: String::new(),
            line: 0,
        })
    }

    /// State for the local API, bound to this producer's session and store.
    pub fn api_state(&self, bearer_token: String) -> AppState {
        let session = self.session.clone();
        AppState {
            snapshot: self.session.subscribe(),
            control: Box::new(move |request| match request {
                ControlRequest::Enable => session.enable(),
                ControlRequest::Disable => session.disable(),
                ControlRequest::Connect(peer) => session.connect(peer),
            }),
            store: Some(self.store.clone()),
            bearer_token,
            start_time: std::time::Instant::now(),
        }
    }

    /// Stop the session (closing any viewer connection) and the forwarder.
    pub async fn shutdown(self) {
        self.session.shutdown();
        let _ = self.session_task.await;
        // The forwarder waits on the store channel, which outlives us
        self.forwarder.abort();
        let _ = self.forwarder.await;
    }
}
