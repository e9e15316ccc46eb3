//! Live mailbox watching
//!
//! One persistent, push-notified connection per active mailbox, with a
//! polling fallback, debounced fetch triggering and bounded-backoff
//! reconnection. The registry owns the watchers and aggregates their status.

pub mod backoff;
mod registry;
mod status;
pub(crate) mod watcher;

pub use registry::WatcherRegistry;
pub use status::AggregatedStatus;
pub use watcher::WatcherHandle;
