//! Live watcher for one mailbox
//!
//! Each watcher owns exactly one IMAP connection and runs every callback for
//! its mailbox on a single task, so the push handler, the poll timer and the
//! debounce timer can never race each other. Different mailboxes are fully
//! independent.
//!
//! State machine: disconnected → connecting → connected-idle →
//! (reconnect-pending | disconnected). Terminal only on explicit shutdown.

use flume::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use crate::config::{MailboxConnectionConfig, WatchConfig};
use crate::error::WatchError;
use crate::events::{EventSink, MailEvent};
use crate::imap::{ImapSession, IdleWriter, UntaggedEvent};
use crate::store::{MessageStore, ProcessingPipeline};

/// Budget for a watcher task to wind down after a stop request
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection-level signal delivered to the watcher loop.
///
/// A generic new-mail push and a flag-change push are treated identically;
/// the subsystem does not care which one woke it up.
#[derive(Debug)]
pub(crate) enum WatchSignal {
    /// Server pushed a change notification
    Push,
    /// The connection died (error, end-of-stream, close or BYE)
    ConnectionLost(WatchError),
}

/// State shared between a watcher task and status readers
#[derive(Debug, Default)]
pub struct WatcherShared {
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
}

impl WatcherShared {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, connected: bool, attempts: u32) {
        self.connected.store(connected, Ordering::SeqCst);
        self.reconnect_attempts.store(attempts, Ordering::SeqCst);
    }
}

/// Everything a watcher task needs, bundled once at spawn time
pub(crate) struct WatcherContext {
    pub config: MailboxConnectionConfig,
    pub watch: WatchConfig,
    pub store: Arc<dyn MessageStore>,
    pub pipeline: Arc<dyn ProcessingPipeline>,
    pub events: EventSink,
    pub shared: Arc<WatcherShared>,
}

impl WatcherContext {
    /// Flip the connected flag, emitting a connectivity event on transitions.
    fn set_connected(&self, connected: bool, error: Option<String>) {
        let was = self.shared.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            if connected {
                info!("Mailbox {} connected", self.config.id);
            } else {
                warn!(
                    "Mailbox {} disconnected: {}",
                    self.config.id,
                    error.as_deref().unwrap_or("shutdown")
                );
            }
            self.events.emit(MailEvent::ConnectivityChanged {
                connected,
                mailbox_id: Some(self.config.id.clone()),
                error,
            });
        }
    }
}

/// Handle kept by the registry for one running watcher
pub struct WatcherHandle {
    config: MailboxConnectionConfig,
    shared: Arc<WatcherShared>,
    shutdown_tx: Sender<()>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn config(&self) -> &MailboxConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts()
    }

    /// Stop the watcher and wait for its task to wind down.
    ///
    /// Never fails: a task stuck on a dead connection is aborted after the
    /// stop budget.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if timeout(STOP_TIMEOUT, self.task).await.is_err() {
            warn!("Watcher for {} did not stop in time", self.config.id);
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(config: MailboxConnectionConfig, shared: Arc<WatcherShared>) -> Self {
        let (shutdown_tx, _shutdown_rx) = flume::bounded(1);
        Self {
            config,
            shared,
            shutdown_tx,
            task: tokio::spawn(async {}),
        }
    }
}

/// Spawn the watcher task for one mailbox.
pub(crate) fn spawn_watcher(
    config: MailboxConnectionConfig,
    watch: WatchConfig,
    store: Arc<dyn MessageStore>,
    pipeline: Arc<dyn ProcessingPipeline>,
    events: EventSink,
) -> WatcherHandle {
    let shared = Arc::new(WatcherShared::default());
    let (shutdown_tx, shutdown_rx) = flume::bounded(1);

    let ctx = WatcherContext {
        config: config.clone(),
        watch,
        store,
        pipeline,
        events,
        shared: shared.clone(),
    };

    let task = tokio::spawn(run(ctx, shutdown_rx));

    WatcherHandle {
        config,
        shared,
        shutdown_tx,
        task,
    }
}

/// Outcome of one connected session
pub(crate) enum LoopExit {
    Shutdown,
    Failed(WatchError),
}

/// Top-level watcher loop: connect, watch, back off, repeat.
async fn run(ctx: WatcherContext, shutdown_rx: Receiver<()>) {
    let policy = ReconnectPolicy::from_config(&ctx.watch);

    loop {
        match connect_and_watch(&ctx, &shutdown_rx).await {
            LoopExit::Shutdown => {
                ctx.set_connected(false, None);
                debug!("Watcher for {} shut down", ctx.config.id);
                return;
            }
            LoopExit::Failed(err) => {
                ctx.set_connected(false, Some(err.to_string()));

                let attempt = ctx.shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let Some(delay) = policy.delay_for(attempt) else {
                    error!(
                        "Mailbox {} exhausted {} reconnect attempts, awaiting manual restart",
                        ctx.config.id,
                        policy.max_attempts()
                    );
                    // Parked: the watcher stays alive (and stoppable) but no
                    // longer reconnects on its own.
                    let _ = shutdown_rx.recv_async().await;
                    return;
                };

                info!(
                    "Mailbox {} reconnecting in {:?} (attempt {})",
                    ctx.config.id, delay, attempt
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv_async() => return,
                }
            }
        }
    }
}

/// One connection lifetime: setup, catch-up fetch, then the event loop.
async fn connect_and_watch(ctx: &WatcherContext, shutdown_rx: &Receiver<()>) -> LoopExit {
    debug!(
        host = %ctx.config.host,
        port = ctx.config.port,
        "Connecting watcher for mailbox {}",
        ctx.config.id
    );

    let mut session = match setup_session(ctx).await {
        Ok(session) => session,
        Err(e) => return LoopExit::Failed(e),
    };

    if let Err(e) = session.idle_start().await {
        return LoopExit::Failed(e);
    }

    let (mut reader, writer) = session.split();
    let (signal_tx, signal_rx) = flume::unbounded();

    // The reader task forwards pushes; everything else it sees is chatter.
    let reader_task = tokio::spawn(async move {
        loop {
            match reader.next_event().await {
                Ok(UntaggedEvent::Bye) => {
                    let _ = signal_tx.send(WatchSignal::ConnectionLost(WatchError::Transport(
                        "Server sent BYE".to_string(),
                    )));
                    return;
                }
                Ok(_) => {
                    if signal_tx.send(WatchSignal::Push).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = signal_tx.send(WatchSignal::ConnectionLost(e));
                    return;
                }
            }
        }
    });

    // Connected: reset the backoff ladder before anything else can fail
    ctx.shared.reconnect_attempts.store(0, Ordering::SeqCst);
    ctx.set_connected(true, None);

    // Catch up on anything flagged while we were offline
    run_fetch(ctx).await;

    let mut writer = Some(writer);
    let exit = event_loop(ctx, &signal_rx, shutdown_rx, &mut writer).await;

    // Teardown order matters: kill the reader before dropping the writer so
    // nothing delivers into a half-dead session after reconnect.
    reader_task.abort();
    if let LoopExit::Shutdown = exit {
        if let Some(mut w) = writer.take() {
            w.logout().await;
        }
    }

    exit
}

async fn setup_session(ctx: &WatcherContext) -> Result<ImapSession, WatchError> {
    let mut session = ImapSession::connect(&ctx.config).await?;
    session
        .login(&ctx.config.email, &ctx.config.password)
        .await?;
    session.select(&ctx.config.folder).await?;
    Ok(session)
}

/// The connected event loop: serialize pushes, poll ticks, the debounce
/// deadline and IDLE refresh on one task.
///
/// Extracted from `connect_and_watch` so tests can drive it with a scripted
/// signal channel instead of a socket.
pub(crate) async fn event_loop(
    ctx: &WatcherContext,
    signals: &Receiver<WatchSignal>,
    shutdown_rx: &Receiver<()>,
    writer: &mut Option<IdleWriter>,
) -> LoopExit {
    let poll_period = ctx.watch.poll_interval();
    let mut poll = tokio::time::interval_at(Instant::now() + poll_period, poll_period);

    let refresh_period = ctx.watch.idle_refresh();
    let mut refresh = tokio::time::interval_at(Instant::now() + refresh_period, refresh_period);

    // At most one pending debounce deadline; every trigger replaces it
    let mut fetch_due: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv_async() => {
                return LoopExit::Shutdown;
            }

            signal = signals.recv_async() => match signal {
                Ok(WatchSignal::Push) => {
                    debug!("Push for mailbox {}, arming debounce", ctx.config.id);
                    fetch_due = Some(Instant::now() + ctx.watch.debounce());
                }
                Ok(WatchSignal::ConnectionLost(e)) => {
                    return LoopExit::Failed(e);
                }
                Err(_) => {
                    return LoopExit::Failed(WatchError::Transport(
                        "Connection reader stopped".to_string(),
                    ));
                }
            },

            // The poll tick is a correctness fallback for servers that take
            // IDLE but never deliver; it goes through the same debounce so a
            // poll and a simultaneous push collapse into one fetch.
            _ = poll.tick() => {
                debug!("Poll tick for mailbox {}", ctx.config.id);
                fetch_due = Some(Instant::now() + ctx.watch.debounce());
            }

            _ = refresh.tick(), if writer.is_some() => {
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.refresh_idle().await {
                        return LoopExit::Failed(e);
                    }
                }
            }

            _ = sleep_until(fetch_due.unwrap_or_else(Instant::now)), if fetch_due.is_some() => {
                fetch_due = None;
                // The loop is parked here while the fetch runs, so a second
                // fetch cannot start; triggers arriving meanwhile queue up in
                // the signal channel and begin a fresh debounce cycle after.
                run_fetch(ctx).await;
            }
        }
    }
}

/// Delegate to the external message store and fan out the results.
async fn run_fetch(ctx: &WatcherContext) {
    debug!("Fetching flagged messages for mailbox {}", ctx.config.id);

    let outcome = match ctx.store.fetch_flagged(&ctx.config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // A store hiccup is not a connection failure; the watcher stays
            // up and the next trigger retries.
            warn!("Fetch for mailbox {} failed: {}", ctx.config.id, e);
            return;
        }
    };

    if outcome.stored_count == 0 {
        debug!(
            "Fetch for mailbox {} stored nothing new ({} fetched)",
            ctx.config.id, outcome.fetched_count
        );
        return;
    }

    info!(
        "Mailbox {}: {} fetched, {} newly stored",
        ctx.config.id, outcome.fetched_count, outcome.stored_count
    );

    ctx.events.emit(MailEvent::NewMail {
        mailbox_id: ctx.config.id.clone(),
        fetched_count: outcome.fetched_count,
        stored_count: outcome.stored_count,
        at: chrono::Utc::now(),
    });

    // Best-effort check-then-act; a duplicate processing run is tolerated
    // because processing is idempotent per message.
    if !ctx.pipeline.is_active().await {
        let message = format!(
            "{} new message(s) in mailbox {}",
            outcome.stored_count, ctx.config.id
        );
        ctx.events.emit(MailEvent::ProcessingStarted {
            trigger: "new-mail".to_string(),
            message,
        });

        // Fire and forget; starting a run must never block the watcher
        let pipeline = ctx.pipeline.clone();
        tokio::spawn(async move {
            pipeline.start("new-mail").await;
        });
    }
}
