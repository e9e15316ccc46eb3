//! Unified error types for the watcher subsystem
//!
//! Errors are serializable so they can be forwarded to status consumers,
//! and carry enough text to be actionable in logs. The live watcher absorbs
//! every failure internally (reconnect with backoff); only the probe and
//! the registry surface errors to callers, and the probe surfaces them as
//! structured results rather than `Err`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the mailbox connectivity subsystem.
///
/// The taxonomy matters for recovery: `Transport`, `Timeout` and `Protocol`
/// are always retried via the reconnect policy; `Auth` is terminal for the
/// probe but retried by the live watcher (credentials may have been revoked
/// and restored).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum WatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Unexpected server response: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Message store error: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

impl WatchError {
    /// Whether the live watcher should schedule a reconnect for this error.
    ///
    /// Everything is retriable on the live path; the distinction exists for
    /// the probe, which reports `Auth` as a terminal result.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, WatchError::Config(_) | WatchError::MailboxNotFound(_))
    }
}

impl From<std::io::Error> for WatchError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            WatchError::Timeout(err.to_string())
        } else {
            WatchError::Transport(err.to_string())
        }
    }
}

impl From<toml::de::Error> for WatchError {
    fn from(err: toml::de::Error) -> Self {
        WatchError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(err: serde_json::Error) -> Self {
        WatchError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for WatchError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        WatchError::Timeout(err.to_string())
    }
}

/// Result type alias using WatchError
pub type Result<T> = std::result::Result<T, WatchError>;
