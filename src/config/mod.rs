//! Configuration for watched mailboxes
//!
//! Mailbox connection settings are owned by external configuration storage;
//! this module only reads them. Changes made externally are picked up when
//! the registry is told to restart; there is no live config push.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

use crate::error::WatchError;

/// Global configuration instance
static CONFIG: OnceCell<RwLock<AppConfig>> = OnceCell::new();

/// Reserved mailbox id for the environment-credential fallback watcher.
///
/// The legacy single-mailbox path is a regular watcher stored under this key,
/// so the registry never carries a parallel set of fields for it.
pub const ENV_MAILBOX_ID: &str = "__env__";

/// Top-level configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Watcher timing knobs
    #[serde(default)]
    pub watch: WatchConfig,

    /// Configured mailboxes
    #[serde(default)]
    pub mailboxes: Vec<MailboxConnectionConfig>,
}

/// Connection settings for one watched mailbox.
///
/// Read-only to the watcher subsystem. The secret is kept as an opaque
/// string; decryption or keychain lookup happens before it gets here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxConnectionConfig {
    /// Opaque mailbox identity
    pub id: String,

    /// Email address, also used as the login username
    pub email: String,

    /// Credential secret for IMAP and SMTP login
    pub password: String,

    /// IMAP server hostname
    pub host: String,

    /// IMAP server port (default: 993 for TLS, 143 for STARTTLS)
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Implicit TLS; when false the connection upgrades via STARTTLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Folder the watcher selects and monitors
    #[serde(default = "default_folder")]
    pub folder: String,

    /// Sent folder, if the deployment distinguishes one
    pub sent_folder: Option<String>,

    /// Trash folder
    pub trash_folder: Option<String>,

    /// Folder processed messages are filed into
    pub done_folder: Option<String>,

    /// Whether this mailbox should have a live watcher
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Watcher timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Quiet period a burst of change notifications must outlast before the
    /// fetch runs
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Fallback poll interval for servers that accept IDLE but never deliver
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,

    /// First reconnect delay
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Reconnect delay clamp
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Reconnect attempts before the watcher parks itself disconnected
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Re-issue IDLE before the server or a NAT box drops the connection
    #[serde(default = "default_idle_refresh_secs")]
    pub idle_refresh_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            poll_interval_secs: default_poll_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            idle_refresh_secs: default_idle_refresh_secs(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_refresh(&self) -> Duration {
        Duration::from_secs(self.idle_refresh_secs)
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_debounce_secs() -> u64 {
    2
}

fn default_poll_secs() -> u64 {
    30
}

fn default_backoff_base_secs() -> u64 {
    3
}

fn default_backoff_cap_secs() -> u64 {
    120
}

fn default_max_reconnect_attempts() -> u32 {
    50
}

fn default_idle_refresh_secs() -> u64 {
    // Re-issue well before the 29-minute RFC limit and common NAT timeouts
    20 * 60
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mailwatch").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("mailwatch")
                .join("config.toml"),
        );
    }

    paths
}

/// Initialize configuration from default paths
pub fn init_config() -> Result<(), WatchError> {
    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return init_config_from_path(&path);
        }
    }

    info!("No config file found, using empty config");
    set_config(AppConfig::default())
}

/// Initialize configuration from a specific path
pub fn init_config_from_path(path: &PathBuf) -> Result<(), WatchError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| WatchError::Config(format!("Failed to read config: {}", e)))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| WatchError::Config(format!("Failed to parse config: {}", e)))?;

    set_config(config)
}

/// Set the global configuration
pub fn set_config(config: AppConfig) -> Result<(), WatchError> {
    match CONFIG.get() {
        Some(lock) => {
            let mut guard = lock
                .write()
                .map_err(|e| WatchError::Config(format!("Failed to lock config: {}", e)))?;
            *guard = config;
        }
        None => {
            CONFIG.set(RwLock::new(config)).ok();
        }
    }
    Ok(())
}

/// Get a clone of the current configuration
pub fn get_config() -> AppConfig {
    CONFIG
        .get()
        .and_then(|lock| lock.read().ok().map(|c| c.clone()))
        .unwrap_or_default()
}

/// Check if configuration is initialized
pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}

/// Build a mailbox config from deployment environment variables.
///
/// Used as the legacy single-mailbox fallback when no mailbox configurations
/// exist. Returns `None` unless host, user and password are all present.
pub fn mailbox_from_env() -> Option<MailboxConnectionConfig> {
    let host = std::env::var("MAILWATCH_IMAP_HOST").ok()?;
    let email = std::env::var("MAILWATCH_IMAP_USER").ok()?;
    let password = std::env::var("MAILWATCH_IMAP_PASSWORD").ok()?;

    let port = std::env::var("MAILWATCH_IMAP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(default_imap_port);

    let tls = std::env::var("MAILWATCH_IMAP_TLS")
        .ok()
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);

    let folder = std::env::var("MAILWATCH_IMAP_FOLDER")
        .ok()
        .unwrap_or_else(default_folder);

    Some(MailboxConnectionConfig {
        id: ENV_MAILBOX_ID.to_string(),
        email,
        password,
        host,
        port,
        tls,
        folder,
        sent_folder: None,
        trash_folder: None,
        done_folder: None,
        active: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_mailbox() {
        let toml_str = r#"
            [[mailboxes]]
            id = "box-1"
            email = "inbox@example.com"
            password = "hunter2"
            host = "imap.example.com"
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mailboxes.len(), 1);

        let mailbox = &config.mailboxes[0];
        assert_eq!(mailbox.port, 993);
        assert!(mailbox.tls);
        assert_eq!(mailbox.folder, "INBOX");
        assert!(mailbox.active);
        assert!(mailbox.sent_folder.is_none());
    }

    #[test]
    fn test_watch_defaults() {
        let config = WatchConfig::default();
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.backoff_base_secs, 3);
        assert_eq!(config.backoff_cap_secs, 120);
        assert_eq!(config.max_reconnect_attempts, 50);
    }

    #[test]
    fn test_watch_overrides() {
        let toml_str = r#"
            [watch]
            debounce_secs = 5
            poll_interval_secs = 10
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.watch.debounce_secs, 5);
        assert_eq!(config.watch.poll_interval_secs, 10);
        // Unspecified knobs keep their defaults
        assert_eq!(config.watch.backoff_cap_secs, 120);
    }
}
