//! Event plumbing between watchers and external consumers
//!
//! Watchers report "new mail available" and connectivity transitions over a
//! channel; the processing pipeline and the live status UI consume the other
//! end. Event types are a closed enum so routing is exhaustively checked at
//! compile time.

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Event emitted to the status/event sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MailEvent {
    /// Newly flagged messages were fetched and stored for a mailbox
    NewMail {
        mailbox_id: String,
        fetched_count: u64,
        stored_count: u64,
        at: DateTime<Utc>,
    },
    /// A watcher's connection came up or went down
    ConnectivityChanged {
        connected: bool,
        mailbox_id: Option<String>,
        error: Option<String>,
    },
    /// A processing run was requested because new mail arrived
    ProcessingStarted { trigger: String, message: String },
}

/// Sending half handed to every watcher.
///
/// Cloneable; sends never block and a disconnected sink only logs.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<MailEvent>,
}

impl EventSink {
    /// Create a sink and the receiver external consumers read from.
    pub fn channel() -> (Self, Receiver<MailEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: MailEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!("Event sink disconnected, dropping event: {}", e);
        }
    }
}
