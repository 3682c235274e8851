//! Pulse Store -- rusqlite-backed log store.
//!
//! Persists log messages and network requests, keeps request/response bodies
//! as blobs addressed by SHA-256, and holds a small key-value settings table.
//! Every successful store is announced on a broadcast channel so the remote
//! logger can forward it.
//!
//! WAL mode + busy_timeout so a viewer process can read while we write.

use chrono::{DateTime, Utc};
use pulse_protocol::{Level, LogEvent, LoggerMessage, NetworkMessage};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Schema version written by `schema.sql`.
pub const SCHEMA_VERSION: u32 = 1;

/// Capacity of the store event channel. Slow subscribers lag, never block.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored log message with its row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    #[serde(flatten)]
    pub message: LoggerMessage,
}

/// A stored network request. Bodies live in the blob table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRequest {
    pub id: i64,
    pub host: Option<String>,
    pub is_completed: bool,
    pub request_body_key: Option<String>,
    pub response_body_key: Option<String>,
    #[serde(flatten)]
    pub message: NetworkMessage,
}

/// Predicate for message queries. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageQuery {
    pub label: Option<String>,
    pub session: Option<String>,
    pub min_level: Option<Level>,
    pub text_contains: Option<String>,
    /// Newest first; 0 means the default of 100.
    #[serde(default)]
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub messages: u64,
    pub requests: u64,
    pub blobs: u64,
    pub blob_bytes: u64,
}

/// The persistence collaborator as seen by the remote logger and viewer.
pub trait LogStore: Send + Sync {
    fn store_message(&self, message: &LoggerMessage) -> Result<i64>;
    fn store_request(&self, message: &NetworkMessage) -> Result<i64>;
    /// Stream of everything stored from now on.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;
}

/// SQLite implementation of the log store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    events: broadcast::Sender<LogEvent>,
}

impl SqliteStore {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let store = Self::from_connection(conn, Some(db_path.to_path_buf()));
        store.ensure_schema()?;
        Ok(store)
    }

    /// Transient store, used by tests and by viewers run without a database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self::from_connection(conn, None);
        store.ensure_schema()?;
        Ok(store)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            db_path,
            events,
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema.sql"))?;
            tracing::debug!(version = SCHEMA_VERSION, "store: initialised schema");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StoreError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        Ok(())
    }

    /// Content key for a blob: hex SHA-256.
    pub fn blob_key(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Store a blob and return its key. Storing the same bytes twice is a no-op.
    pub fn put_blob(&self, data: &[u8]) -> Result<String> {
        let key = Self::blob_key(data);
        let conn = self.db()?;
        conn.execute(
            "INSERT OR IGNORE INTO blobs (key, data, size) VALUES (?1, ?2, ?3)",
            params![key, data, data.len() as i64],
        )?;
        Ok(key)
    }

    pub fn blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.db()?;
        let data = conn
            .query_row("SELECT data FROM blobs WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(data)
    }

    /// Query messages matching `query`, newest first.
    pub fn messages(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>> {
        let mut sql = String::from(
            "SELECT id, created_at, level, label, session, text, metadata, file, function, line
             FROM messages WHERE 1=1",
        );
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(label) = &query.label {
            args.push(label.clone().into());
            sql.push_str(&format!(" AND label = ?{}", args.len()));
        }
        if let Some(session) = &query.session {
            args.push(session.clone().into());
            sql.push_str(&format!(" AND session = ?{}", args.len()));
        }
        if let Some(level) = query.min_level {
            args.push(level.order().into());
            sql.push_str(&format!(" AND level_order >= ?{}", args.len()));
        }
        if let Some(needle) = &query.text_contains {
            args.push(format!("%{needle}%").into());
            sql.push_str(&format!(" AND text LIKE ?{}", args.len()));
        }
        let limit = if query.limit == 0 { 100 } else { query.limit };
        args.push(i64::from(limit).into());
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", args.len()));

        let raw = {
            let conn = self.db()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args), |row| {
                    Ok(RawMessage {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        level: row.get(2)?,
                        label: row.get(3)?,
                        session: row.get(4)?,
                        text: row.get(5)?,
                        metadata: row.get(6)?,
                        file: row.get(7)?,
                        function: row.get(8)?,
                        line: row.get(9)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        raw.into_iter().map(RawMessage::into_stored).collect()
    }

    /// Most recent network requests, newest first.
    pub fn requests(&self, limit: u32) -> Result<Vec<StoredRequest>> {
        let raw = {
            let conn = self.db()?;
            let mut stmt = conn.prepare(
                "SELECT id, host, is_completed, request_body_key, response_body_key, details
                 FROM network_requests
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i32>(2)? != 0,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        raw.into_iter()
            .map(
                |(id, host, is_completed, request_body_key, response_body_key, details)| {
                    let message: NetworkMessage =
                        serde_json::from_str(&details).map_err(|e| StoreError::Corrupt {
                            id,
                            reason: e.to_string(),
                        })?;
                    Ok(StoredRequest {
                        id,
                        host,
                        is_completed,
                        request_body_key,
                        response_body_key,
                        message,
                    })
                },
            )
            .collect()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.db()?;
        let messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let requests: i64 =
            conn.query_row("SELECT COUNT(*) FROM network_requests", [], |r| r.get(0))?;
        let (blobs, blob_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM blobs",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(StoreStats {
            messages: messages as u64,
            requests: requests as u64,
            blobs: blobs as u64,
            blob_bytes: blob_bytes as u64,
        })
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.db()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn notify(&self, event: LogEvent) {
        // No subscribers is fine: nobody is forwarding right now
        let _ = self.events.send(event);
    }
}

impl LogStore for SqliteStore {
    fn store_message(&self, message: &LoggerMessage) -> Result<i64> {
        let metadata = serde_json::to_string(&message.metadata)?;
        let id = {
            let conn = self.db()?;
            conn.execute(
                "INSERT INTO messages
                 (created_at, level, level_order, label, session, text, metadata, file, function, line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.created_at.to_rfc3339(),
                    message.level.as_str(),
                    message.level.order(),
                    message.label,
                    message.session,
                    message.text,
                    metadata,
                    message.file,
                    message.function,
                    message.line,
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.notify(LogEvent::MessageStored(message.clone()));
        Ok(id)
    }

    fn store_request(&self, message: &NetworkMessage) -> Result<i64> {
        let request_body_key = message
            .request_body
            .as_deref()
            .map(|body| self.put_blob(body))
            .transpose()?;
        let response_body_key = message
            .response_body
            .as_deref()
            .map(|body| self.put_blob(body))
            .transpose()?;

        // Bodies are stored once, by key; the details column keeps the rest
        let mut details = message.clone();
        details.request_body = None;
        details.response_body = None;
        let details = serde_json::to_string(&details)?;

        let is_completed = message.response.is_some() || message.error.is_some();
        let id = {
            let conn = self.db()?;
            conn.execute(
                "INSERT INTO network_requests
                 (created_at, session, url, host, http_method, status_code, error_domain,
                  error_code, duration, is_completed, request_body_key, response_body_key, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    message.created_at.to_rfc3339(),
                    message.session,
                    message.request.url,
                    message.host(),
                    message.request.http_method,
                    message.response.as_ref().and_then(|r| r.status_code),
                    message.error.as_ref().map(|e| e.domain.clone()),
                    message.error.as_ref().map(|e| e.code),
                    message.metrics.as_ref().map(|m| m.duration_secs),
                    is_completed as i32,
                    request_body_key,
                    response_body_key,
                    details,
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.notify(LogEvent::NetworkMessageStored(message.clone()));
        Ok(id)
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}

struct RawMessage {
    id: i64,
    created_at: String,
    level: String,
    label: String,
    session: String,
    text: String,
    metadata: String,
    file: String,
    function: String,
    line: u32,
}

impl RawMessage {
    fn into_stored(self) -> Result<StoredMessage> {
        let id = self.id;
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };

        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);
        let level: Level = self.level.parse().map_err(corrupt)?;
        let metadata: BTreeMap<String, String> =
            serde_json::from_str(&self.metadata).map_err(|e| corrupt(e.to_string()))?;

        Ok(StoredMessage {
            id,
            message: LoggerMessage {
                created_at,
                level,
                label: self.label,
                session: self.session,
                text: self.text,
                metadata,
                file: self.file,
                function: self.function,
                line: self.line,
            },
        })
    }
}
