//! Security event log.
//!
//! Events are appended to a durable store and read later by admin tooling.
//! Writing is best effort: a failed write is reported through tracing and
//! never fails the request that produced the event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::{GuardError, Result};

/// Kinds of security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    RateLimitExceeded,
    LoginFailed,
    LoginSuccess,
    AccountLocked,
    RegistrationFailed,
    RegistrationSuccess,
}

/// One entry of the security log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityLogEntry {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub user_id: Option<String>,
    pub ip: String,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// An event about to be logged.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub ip: String,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, ip: impl Into<String>) -> Self {
        Self {
            event_type,
            ip: ip.into(),
            user_agent: None,
            user_id: None,
            metadata: None,
        }
    }

    pub fn user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn into_entry(self) -> SecurityLogEntry {
        SecurityLogEntry {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            user_id: self.user_id,
            ip: self.ip,
            user_agent: self.user_agent,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        }
    }
}

/// Durable, append-only storage for security events.
#[async_trait]
pub trait SecurityLogStore: Send + Sync {
    async fn append(&self, entry: &SecurityLogEntry) -> Result<()>;
}

/// In-process security log.
#[derive(Debug, Default)]
pub struct MemorySecurityLogStore {
    entries: Mutex<Vec<SecurityLogEntry>>,
}

impl MemorySecurityLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry appended so far.
    pub fn entries(&self) -> Vec<SecurityLogEntry> {
        self.entries.lock().clone()
    }

    /// Entries of one type.
    pub fn entries_of(&self, event_type: SecurityEventType) -> Vec<SecurityLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SecurityLogStore for MemorySecurityLogStore {
    async fn append(&self, entry: &SecurityLogEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Security log written as JSON Lines, one entry per line.
pub struct JsonlSecurityLogStore {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonlSecurityLogStore {
    /// The file is opened on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecurityLogStore for JsonlSecurityLogStore {
    async fn append(&self, entry: &SecurityLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let handle = match file.take() {
            Some(handle) => handle,
            None => tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    GuardError::SecurityLog(format!("cannot open {}: {}", self.path.display(), e))
                })?,
        };
        let handle = file.insert(handle);

        let written = match handle.write_all(&line).await {
            Ok(()) => handle.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            // Reopen on the next append
            *file = None;
            return Err(GuardError::Io(e));
        }
        Ok(())
    }
}

/// Best-effort security event logger.
#[derive(Clone)]
pub struct SecurityLogger {
    store: Arc<dyn SecurityLogStore>,
}

impl SecurityLogger {
    pub fn new(store: Arc<dyn SecurityLogStore>) -> Self {
        Self { store }
    }

    /// Append an event. Store failures are logged and swallowed.
    pub async fn log(&self, event: SecurityEvent) {
        let entry = event.into_entry();
        trace!(event_type = ?entry.event_type, ip = %entry.ip, "Recording security event");

        if let Err(e) = self.store.append(&entry).await {
            warn!(
                event_type = ?entry.event_type,
                ip = %entry.ip,
                error = %e,
                "Failed to write security event"
            );
        }
    }

    /// Append an event on a background task without waiting for it.
    pub fn spawn_log(&self, event: SecurityEvent) {
        let logger = self.clone();
        // Detached on purpose; the handle is dropped
        drop(tokio::spawn(async move { logger.log(event).await }));
    }
}

impl std::fmt::Debug for SecurityLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityLogger").finish_non_exhaustive()
    }
}
