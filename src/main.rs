//! Standalone connectivity monitor
//!
//! Runs the watcher registry against the mailboxes in the config file and
//! logs connectivity events and aggregated status. The message store and
//! the processing pipeline are external collaborators; in standalone mode
//! they are placeholders, so this binary watches connections without
//! ingesting anything. Embedding applications wire real implementations via
//! `WatcherRegistry::new`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mailwatch::config::{self, MailboxConnectionConfig};
use mailwatch::error::Result;
use mailwatch::events::EventSink;
use mailwatch::store::{FetchOutcome, MailboxSource, MessageStore, ProcessingPipeline};
use mailwatch::watch::WatcherRegistry;

/// Mailboxes straight from the loaded config file
struct ConfigMailboxes;

#[async_trait]
impl MailboxSource for ConfigMailboxes {
    async fn list_active(&self) -> Result<Vec<MailboxConnectionConfig>> {
        Ok(config::get_config()
            .mailboxes
            .into_iter()
            .filter(|m| m.active)
            .collect())
    }
}

/// Placeholder store for standalone mode: nothing is persisted.
struct StandaloneStore;

#[async_trait]
impl MessageStore for StandaloneStore {
    async fn fetch_flagged(&self, mailbox: &MailboxConnectionConfig) -> Result<FetchOutcome> {
        info!(
            "Standalone mode: skipping fetch for mailbox {} (no store wired)",
            mailbox.id
        );
        Ok(FetchOutcome::default())
    }
}

/// Placeholder pipeline for standalone mode: never active, never started.
struct StandalonePipeline;

#[async_trait]
impl ProcessingPipeline for StandalonePipeline {
    async fn is_active(&self) -> bool {
        false
    }

    async fn start(&self, reason: &str) {
        info!("Standalone mode: processing trigger ignored ({})", reason);
    }
}

#[tokio::main]
async fn main() {
    // rustls 0.23+ does not auto-select a crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mailwatch=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting mailwatch ...");

    if let Err(e) = config::init_config() {
        warn!("Could not load config: {}", e);
    }

    let (events, events_rx) = EventSink::channel();

    tokio::spawn(async move {
        while let Ok(event) = events_rx.recv_async().await {
            info!("Event: {:?}", event);
        }
    });

    let registry = Arc::new(WatcherRegistry::new(
        config::get_config().watch,
        Arc::new(ConfigMailboxes),
        Arc::new(StandaloneStore),
        Arc::new(StandalonePipeline),
        events,
    ));

    if let Err(e) = registry.restart_all().await {
        warn!("Failed to start watchers: {}", e);
    }

    let status_registry = registry.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let status = status_registry.status().await;
            info!(
                "Status: {} (reconnect attempts: {})",
                status.mailbox_summary, status.reconnect_attempts
            );
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down ...");
    registry.stop_all().await;
}
