//! Runtime configuration
//!
//! TOML-backed settings for mailboxes, journals and query correlation. Every
//! field has a default so an empty document is a valid configuration; where
//! the document comes from is the caller's business.

use crate::{ActorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mailbox: MailboxConfig,
    pub journal: JournalConfig,
    pub query: QueryConfig,
}

/// Per-mailbox queue settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Maximum queued messages before the overflow handler is consulted
    pub capacity: usize,

    /// Upper bound on how long an offer may wait for space, in milliseconds
    pub send_timeout_ms: u64,

    /// Messages drained between before/after batch hooks
    pub batch_limit: usize,

    /// How long shutdown waits for the drain task to acknowledge
    pub shutdown_timeout_ms: u64,

    /// Stamp service/method hop headers on every delivered message
    pub trace_headers: bool,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            send_timeout_ms: 60_000,
            batch_limit: 64,
            shutdown_timeout_ms: 1_000,
            trace_headers: false,
        }
    }
}

impl MailboxConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Checkpoint request policy for journals
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct JournalConfig {
    /// Request a checkpoint after this many records since the last one
    pub save_every_records: Option<u64>,

    /// Request a checkpoint once records are pending for this long
    pub save_interval_ms: Option<u64>,
}

impl JournalConfig {
    pub fn save_interval(&self) -> Option<Duration> {
        self.save_interval_ms.map(Duration::from_millis)
    }
}

/// Query correlation settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct QueryConfig {
    /// Deadline applied to queries and streams issued without one
    pub default_timeout_ms: Option<u64>,
}

impl QueryConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(source).map_err(|e| {
            ActorError::configuration(format!("Invalid runtime TOML: {}", e), None)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ActorError::io(format!("Failed to read {}", path.display()), e))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mailbox.capacity == 0 {
            return Err(ActorError::configuration(
                "Mailbox capacity must be at least 1",
                Some("mailbox.capacity"),
            ));
        }

        if self.mailbox.batch_limit == 0 {
            return Err(ActorError::configuration(
                "Batch limit must be at least 1",
                Some("mailbox.batch_limit"),
            ));
        }

        if self.journal.save_every_records == Some(0) {
            return Err(ActorError::configuration(
                "save_every_records must be positive when set",
                Some("journal.save_every_records"),
            ));
        }

        if self.query.default_timeout_ms == Some(0) {
            return Err(ActorError::configuration(
                "Default query timeout must be positive when set",
                Some("query.default_timeout_ms"),
            ));
        }

        Ok(())
    }
}
