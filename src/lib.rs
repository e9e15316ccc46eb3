//! mailwatch - mailbox connectivity and live ingestion
//!
//! Keeps long-lived connections to mail servers alive so a downstream
//! processing pipeline can react to newly flagged messages in near-real
//! time.
//!
//! ## Module Organization
//!
//! - `config/`: mailbox connection settings and watcher timing knobs
//! - `probe/`: one-shot connectivity/credential verification
//! - `imap/`: minimal IMAP client for the live IDLE path
//! - `watch/`: per-mailbox watchers, backoff, registry, status
//! - `store`: seams to the external message store and pipeline
//! - `events`: notifications for the status/event sink

pub mod config;
pub mod error;
pub mod events;
pub mod imap;
pub mod probe;
pub mod store;
pub mod watch;

pub use error::{Result, WatchError};
pub use events::{EventSink, MailEvent};
pub use probe::{test_connection, ConnectionTestReport, ProbeCredentials, ProbeResult};
pub use store::{FetchOutcome, MailboxSource, MessageStore, ProcessingPipeline};
pub use watch::{AggregatedStatus, WatcherRegistry};
