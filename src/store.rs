//! Seams to the external message store and processing pipeline
//!
//! The watcher subsystem never persists messages and never runs analysis
//! itself. It calls these traits and reacts to the counts they return.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MailboxConnectionConfig;
use crate::error::Result;

/// Counts returned by a flagged-message fetch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// Messages matching the watched flag on the server
    pub fetched_count: u64,
    /// Messages newly persisted by the store (already-known ones excluded)
    pub stored_count: u64,
}

/// Fetches and persists newly flagged messages for a mailbox.
///
/// Fails with `WatchError::Transport`/`Auth` on connectivity problems; the
/// watcher treats either as a reason to reconnect.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn fetch_flagged(&self, mailbox: &MailboxConnectionConfig) -> Result<FetchOutcome>;
}

/// Downstream processing control.
///
/// `start` is fire-and-forget and must not block the watcher; a race that
/// starts two runs is tolerated because processing is idempotent per message.
#[async_trait]
pub trait ProcessingPipeline: Send + Sync {
    async fn is_active(&self) -> bool;
    async fn start(&self, reason: &str);
}

/// Source of active mailbox configurations, re-read on every registry
/// restart.
#[async_trait]
pub trait MailboxSource: Send + Sync {
    async fn list_active(&self) -> Result<Vec<MailboxConnectionConfig>>;
}
