//! Persisted remote-logging preferences.
//!
//! The session reads these once at startup and writes them back through
//! `PersistEnabled` / `PersistSelectedPeer` actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pulse_store::SqliteStore;
use uuid::Uuid;

const KEY_ENABLED: &str = "remote-logger.is-enabled";
const KEY_SELECTED_PEER: &str = "remote-logger.selected-peer";
const KEY_DEVICE_ID: &str = "remote-logger.device-id";

/// String key-value persistence.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

impl SettingsStore for SqliteStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.get_setting(key)?)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        Ok(self.set_setting(key, value)?)
    }
}

/// Process-local settings, for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Typed view over a `SettingsStore`. Read failures fall back to defaults and
/// write failures are logged: preferences never stop the session.
#[derive(Clone)]
pub struct Preferences {
    settings: Arc<dyn SettingsStore>,
}

impl Preferences {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.settings.get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, "prefs: read failed: {e}");
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.settings.set(key, value) {
            tracing::warn!(key, "prefs: write failed: {e}");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.read(KEY_ENABLED).as_deref() == Some("true")
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.write(KEY_ENABLED, if enabled { "true" } else { "false" });
    }

    pub fn selected_peer(&self) -> Option<String> {
        self.read(KEY_SELECTED_PEER).filter(|name| !name.is_empty())
    }

    pub fn set_selected_peer(&self, name: &str) {
        self.write(KEY_SELECTED_PEER, name);
    }

    /// Stable identifier for this installation, generated on first use.
    pub fn device_id(&self) -> Uuid {
        if let Some(id) = self.read(KEY_DEVICE_ID).and_then(|s| s.parse().ok()) {
            return id;
        }
        let id = Uuid::new_v4();
        self.write(KEY_DEVICE_ID, &id.to_string());
        tracing::info!(device_id = %id, "prefs: generated device id");
        id
    }
}
