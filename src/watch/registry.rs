//! Watcher registry
//!
//! Creates and destroys watchers for every active mailbox configuration,
//! reconciles the running set against configuration changes, and aggregates
//! connectivity status across all watchers. The legacy single-mailbox
//! fallback (environment credentials, used when no mailboxes are configured)
//! is an ordinary watcher stored under a reserved key, not a parallel code
//! path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::status::AggregatedStatus;
use super::watcher::{spawn_watcher, WatcherHandle};
use crate::config::{self, MailboxConnectionConfig, WatchConfig, ENV_MAILBOX_ID};
use crate::error::Result;
use crate::events::EventSink;
use crate::store::{MailboxSource, MessageStore, ProcessingPipeline};

/// Registry of live watchers, one per active mailbox
pub struct WatcherRegistry {
    watchers: RwLock<HashMap<String, WatcherHandle>>,
    watch: WatchConfig,
    source: Arc<dyn MailboxSource>,
    store: Arc<dyn MessageStore>,
    pipeline: Arc<dyn ProcessingPipeline>,
    events: EventSink,
}

impl WatcherRegistry {
    pub fn new(
        watch: WatchConfig,
        source: Arc<dyn MailboxSource>,
        store: Arc<dyn MessageStore>,
        pipeline: Arc<dyn ProcessingPipeline>,
        events: EventSink,
    ) -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
            watch,
            source,
            store,
            pipeline,
            events,
        }
    }

    /// Start (or restart) a watcher for one mailbox.
    ///
    /// Idempotent: an existing watcher for the same id is fully stopped
    /// before the fresh one connects, so a mailbox never has two live
    /// connections.
    pub async fn start(&self, mailbox: MailboxConnectionConfig) {
        let previous = {
            let mut watchers = self.watchers.write().await;
            watchers.remove(&mailbox.id)
        };

        if let Some(previous) = previous {
            info!("Replacing existing watcher for mailbox {}", mailbox.id);
            previous.stop().await;
        }

        info!(
            "Starting watcher for mailbox {} ({} on {}:{})",
            mailbox.id, mailbox.email, mailbox.host, mailbox.port
        );

        let handle = spawn_watcher(
            mailbox.clone(),
            self.watch.clone(),
            self.store.clone(),
            self.pipeline.clone(),
            self.events.clone(),
        );

        let mut watchers = self.watchers.write().await;
        watchers.insert(mailbox.id, handle);
    }

    /// Stop the watcher for one mailbox, if any.
    pub async fn stop(&self, mailbox_id: &str) {
        let handle = {
            let mut watchers = self.watchers.write().await;
            watchers.remove(mailbox_id)
        };

        if let Some(handle) = handle {
            info!("Stopping watcher for mailbox {}", mailbox_id);
            handle.stop().await;
        }
    }

    /// Tear down every watcher. Used on process shutdown; never fails, even
    /// when connections are already dead.
    pub async fn stop_all(&self) {
        let handles: Vec<WatcherHandle> = {
            let mut watchers = self.watchers.write().await;
            watchers.drain().map(|(_, handle)| handle).collect()
        };

        info!("Stopping {} watcher(s)", handles.len());
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Re-read the active mailbox set and reconcile the running watchers.
    ///
    /// Watchers for mailboxes that disappeared are stopped, new ones are
    /// started, and watchers whose configuration is unchanged are left
    /// running. Called at startup and after any external configuration
    /// change (mailbox created, updated, deleted, credentials rotated).
    pub async fn restart_all(&self) -> Result<()> {
        let mut desired = self.source.list_active().await?;

        // Legacy fallback: no configured mailboxes, but deployment-level
        // credentials exist. Never runs alongside configured mailboxes.
        if desired.is_empty() {
            if let Some(env_mailbox) = config::mailbox_from_env() {
                info!(
                    "No active mailbox configurations; falling back to environment credentials for {}",
                    env_mailbox.email
                );
                desired.push(env_mailbox);
            } else {
                warn!("No active mailbox configurations and no environment credentials");
            }
        } else {
            desired.retain(|m| {
                if m.id == ENV_MAILBOX_ID {
                    warn!("Ignoring configured mailbox using the reserved id {}", ENV_MAILBOX_ID);
                    false
                } else {
                    true
                }
            });
        }

        let desired_ids: HashSet<String> = desired.iter().map(|m| m.id.clone()).collect();

        // Stop watchers whose mailbox is gone or deactivated
        let stale: Vec<String> = {
            let watchers = self.watchers.read().await;
            watchers
                .keys()
                .filter(|id| !desired_ids.contains(*id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.stop(&id).await;
        }

        // Start new watchers; leave unchanged ones alone
        for mailbox in desired {
            let unchanged = {
                let watchers = self.watchers.read().await;
                watchers
                    .get(&mailbox.id)
                    .map(|handle| handle.config() == &mailbox)
                    .unwrap_or(false)
            };

            if unchanged {
                continue;
            }
            self.start(mailbox).await;
        }

        Ok(())
    }

    /// Mailbox ids with a running watcher.
    pub async fn watched_ids(&self) -> Vec<String> {
        let watchers = self.watchers.read().await;
        watchers.keys().cloned().collect()
    }

    /// Aggregate connectivity status across all watchers.
    ///
    /// Computed on read from the live watcher states, never cached, so it
    /// cannot go stale.
    pub async fn status(&self) -> AggregatedStatus {
        let watchers = self.watchers.read().await;
        AggregatedStatus::from_handles(watchers.values())
    }

    #[cfg(test)]
    pub(crate) async fn insert_stub(&self, handle: WatcherHandle) {
        let mut watchers = self.watchers.write().await;
        watchers.insert(handle.config().id.clone(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FetchOutcome;
    use crate::watch::watcher::WatcherShared;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticSource {
        mailboxes: Mutex<Vec<MailboxConnectionConfig>>,
    }

    impl StaticSource {
        fn new(mailboxes: Vec<MailboxConnectionConfig>) -> Arc<Self> {
            Arc::new(Self {
                mailboxes: Mutex::new(mailboxes),
            })
        }

        fn set(&self, mailboxes: Vec<MailboxConnectionConfig>) {
            *self.mailboxes.lock().unwrap() = mailboxes;
        }
    }

    #[async_trait]
    impl MailboxSource for StaticSource {
        async fn list_active(&self) -> Result<Vec<MailboxConnectionConfig>> {
            Ok(self.mailboxes.lock().unwrap().clone())
        }
    }

    struct NullStore;

    #[async_trait]
    impl MessageStore for NullStore {
        async fn fetch_flagged(&self, _: &MailboxConnectionConfig) -> Result<FetchOutcome> {
            Ok(FetchOutcome::default())
        }
    }

    struct NullPipeline;

    #[async_trait]
    impl ProcessingPipeline for NullPipeline {
        async fn is_active(&self) -> bool {
            true
        }

        async fn start(&self, _reason: &str) {}
    }

    fn mailbox(id: &str) -> MailboxConnectionConfig {
        MailboxConnectionConfig {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            password: "secret".to_string(),
            // Connections will fail fast; these tests only exercise the
            // registry bookkeeping, not the sockets.
            host: "127.0.0.1".to_string(),
            port: 1,
            tls: false,
            folder: "INBOX".to_string(),
            sent_folder: None,
            trash_folder: None,
            done_folder: None,
            active: true,
        }
    }

    fn registry(source: Arc<StaticSource>) -> WatcherRegistry {
        let (events, _rx) = EventSink::channel();
        WatcherRegistry::new(
            WatchConfig::default(),
            source,
            Arc::new(NullStore),
            Arc::new(NullPipeline),
            events,
        )
    }

    #[tokio::test]
    async fn test_restart_all_reconciles_watcher_set() {
        let source = StaticSource::new(vec![mailbox("a"), mailbox("b")]);
        let registry = registry(source.clone());

        registry.restart_all().await.unwrap();
        let mut ids = registry.watched_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        source.set(vec![mailbox("b"), mailbox("c")]);
        registry.restart_all().await.unwrap();

        let mut ids = registry.watched_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);

        registry.stop_all().await;
        assert!(registry.watched_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_mailbox() {
        let source = StaticSource::new(vec![]);
        let registry = registry(source);

        registry.start(mailbox("a")).await;
        registry.start(mailbox("a")).await;

        assert_eq!(registry.watched_ids().await, vec!["a"]);
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_status_aggregates_connected_and_attempts() {
        let source = StaticSource::new(vec![]);
        let registry = registry(source);

        let shared_a = Arc::new(WatcherShared::default());
        let shared_b = Arc::new(WatcherShared::default());
        shared_a.force_state(false, 3);
        shared_b.force_state(false, 2);

        registry
            .insert_stub(WatcherHandle::stub(mailbox("a"), shared_a.clone()))
            .await;
        registry
            .insert_stub(WatcherHandle::stub(mailbox("b"), shared_b.clone()))
            .await;

        let status = registry.status().await;
        assert!(!status.connected);
        assert_eq!(status.reconnect_attempts, 5);
        assert!(status.mailbox_summary.contains("0/2"));

        // connected iff at least one watcher is connected
        shared_b.force_state(true, 0);
        let status = registry.status().await;
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 3);

        shared_a.force_state(true, 0);
        shared_b.force_state(false, 1);
        let status = registry.status().await;
        assert!(status.connected);
    }

    #[tokio::test]
    async fn test_env_fallback_registers_reserved_watcher() {
        std::env::set_var("MAILWATCH_IMAP_HOST", "127.0.0.1");
        std::env::set_var("MAILWATCH_IMAP_USER", "env@example.com");
        std::env::set_var("MAILWATCH_IMAP_PASSWORD", "secret");
        std::env::set_var("MAILWATCH_IMAP_PORT", "1");

        let source = StaticSource::new(vec![]);
        let registry = registry(source.clone());

        registry.restart_all().await.unwrap();
        assert_eq!(registry.watched_ids().await, vec![ENV_MAILBOX_ID]);

        // Once real configurations appear, the legacy watcher is retired so
        // the two paths never run concurrently
        source.set(vec![mailbox("a")]);
        registry.restart_all().await.unwrap();
        assert_eq!(registry.watched_ids().await, vec!["a"]);

        registry.stop_all().await;
    }
}
