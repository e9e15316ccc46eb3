//! Aggregated connectivity status
//!
//! Derived on demand from live watcher state so it can never be stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::watcher::WatcherHandle;

/// Snapshot of connectivity across all watchers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedStatus {
    /// True if at least one mailbox currently has a live connection
    pub connected: bool,
    /// Display summary, e.g. "2/3 mailboxes connected"
    pub mailbox_summary: String,
    /// Reconnect attempts summed across all watchers
    pub reconnect_attempts: u64,
    /// When this snapshot was computed
    pub checked_at: DateTime<Utc>,
}

impl AggregatedStatus {
    pub(crate) fn from_handles<'a, I>(handles: I) -> Self
    where
        I: Iterator<Item = &'a WatcherHandle>,
    {
        let mut total = 0u64;
        let mut connected_count = 0u64;
        let mut reconnect_attempts = 0u64;

        for handle in handles {
            total += 1;
            if handle.is_connected() {
                connected_count += 1;
            }
            reconnect_attempts += u64::from(handle.reconnect_attempts());
        }

        let mailbox_summary = if total == 0 {
            "no mailboxes watched".to_string()
        } else {
            format!("{}/{} mailboxes connected", connected_count, total)
        };

        Self {
            connected: connected_count > 0,
            mailbox_summary,
            reconnect_attempts,
            checked_at: Utc::now(),
        }
    }
}
