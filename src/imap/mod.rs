//! Minimal IMAP client for live watching
//!
//! Only the subset the watcher needs: connect (implicit TLS or STARTTLS),
//! LOGIN, SELECT, and the IDLE/DONE cycle, plus parsing of the untagged
//! responses a server pushes while idling. Message fetching happens in the
//! external message store, never on this connection.

pub mod transport;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::MailboxConnectionConfig;
use crate::error::{Result, WatchError};
use transport::{LineStream, MailStream};

/// Per-command budget while setting up a session
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Connector that actually verifies certificates, for the live path
fn live_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Quote a string for use as an IMAP quoted-string argument.
///
/// Embedded quotes and backslashes in secrets must be escaped or the LOGIN
/// command line falls apart.
pub fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Base64 SASL PLAIN initial response: \0user\0password
pub fn plain_auth_payload(username: &str, password: &str) -> String {
    let raw = format!("\0{}\0{}", username, password);
    BASE64.encode(raw.as_bytes())
}

/// Server push observed while idling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntaggedEvent {
    /// "* 42 EXISTS": message count changed, new mail may have arrived
    Exists,
    /// "* 42 FETCH (FLAGS (...))": flags changed on a message
    FlagsChanged { flags: String },
    /// "* 42 EXPUNGE": a message was removed
    Expunged,
    /// "* BYE ...": server is closing the connection
    Bye,
}

/// Parse an untagged IMAP response line into a watch event.
///
/// Everything else (tagged responses, continuations, OK chatter) returns
/// `None` and is skipped by the idle reader.
pub fn parse_untagged(line: &str) -> Option<UntaggedEvent> {
    let line = line.trim();

    if line.starts_with("* BYE") {
        return Some(UntaggedEvent::Bye);
    }

    // "* 42 EXISTS" / "* 42 RECENT"
    if line.ends_with(" EXISTS") || line.ends_with(" RECENT") {
        let middle = line.strip_prefix("* ")?;
        let count = middle.split_whitespace().next()?;
        if count.parse::<u32>().is_ok() {
            return Some(UntaggedEvent::Exists);
        }
    }

    // "* 42 EXPUNGE"
    if line.ends_with(" EXPUNGE") && line.starts_with("* ") {
        return Some(UntaggedEvent::Expunged);
    }

    // "* 42 FETCH (FLAGS (\Seen \Flagged))"
    if line.starts_with("* ") && line.contains(" FETCH ") && line.contains("FLAGS") {
        let flags = line
            .split_once("FLAGS")
            .map(|(_, rest)| rest.trim().trim_matches(|c| c == '(' || c == ')').to_string())
            .unwrap_or_default();
        return Some(UntaggedEvent::FlagsChanged { flags });
    }

    None
}

/// An authenticated, folder-selected IMAP session ready to idle
pub struct ImapSession {
    stream: LineStream,
    next_tag: u32,
}

impl ImapSession {
    /// Connect and secure the transport per the mailbox configuration.
    ///
    /// Mirrors the probe's transport logic, minus the exploratory port
    /// fallback; the configuration is assumed to be already validated.
    pub async fn connect(config: &MailboxConnectionConfig) -> Result<Self> {
        let connector = live_connector();
        let mut stream = LineStream::connect(
            &config.host,
            config.port,
            config.tls,
            &connector,
            COMMAND_TIMEOUT,
        )
        .await?;

        let greeting = stream.read_line(COMMAND_TIMEOUT).await?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(WatchError::Protocol(format!(
                "Unexpected IMAP greeting: {}",
                greeting
            )));
        }

        let mut next_tag = 0;
        if !config.tls && greeting.to_ascii_uppercase().contains("STARTTLS") {
            stream.write_line("w0 STARTTLS").await?;
            next_tag = 1;
            loop {
                let line = stream.read_line(COMMAND_TIMEOUT).await?;
                if let Some(rest) = line.strip_prefix("w0 ") {
                    if !rest.starts_with("OK") {
                        return Err(WatchError::Protocol(format!(
                            "STARTTLS refused: {}",
                            rest
                        )));
                    }
                    break;
                }
            }
            stream = stream
                .upgrade_tls(&config.host, &connector, COMMAND_TIMEOUT)
                .await?;
        }

        Ok(Self { stream, next_tag })
    }

    /// Authenticate with the plain LOGIN command.
    ///
    /// The SASL PLAIN capability is deliberately ignored here: some servers
    /// advertise it and then reject the exchange, so the live path strips it
    /// and goes straight to LOGIN.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let tag = self
            .send(&format!(
                "LOGIN {} {}",
                quote_string(username),
                quote_string(password)
            ))
            .await?;

        let (ok, text) = self.read_tagged(&tag).await?;
        if !ok {
            return Err(WatchError::Auth(text));
        }
        Ok(())
    }

    /// Select the folder to watch.
    pub async fn select(&mut self, folder: &str) -> Result<()> {
        let tag = self.send(&format!("SELECT {}", quote_string(folder))).await?;
        let (ok, text) = self.read_tagged(&tag).await?;
        if !ok {
            return Err(WatchError::MailboxNotFound(format!(
                "{}: {}",
                folder, text
            )));
        }
        Ok(())
    }

    /// Enter IDLE; the server acknowledges with a continuation.
    pub async fn idle_start(&mut self) -> Result<()> {
        self.send("IDLE").await?;
        loop {
            let line = self.stream.read_line(COMMAND_TIMEOUT).await?;
            if line.starts_with('+') {
                return Ok(());
            }
            // A queued untagged response may arrive before the continuation
            if !line.starts_with('*') {
                return Err(WatchError::Protocol(format!(
                    "IDLE not accepted: {}",
                    line
                )));
            }
        }
    }

    /// Split into the idle read loop and the command writer.
    ///
    /// Bytes already buffered are carried over to the reader so pushes
    /// arriving right after the IDLE acknowledgement are not lost.
    pub fn split(self) -> (IdleReader, IdleWriter) {
        let (stream, carry) = self.stream.into_parts();
        let (read_half, write_half) = tokio::io::split(stream);

        (
            IdleReader {
                reader: BufReader::new(read_half),
                carry,
            },
            IdleWriter {
                writer: write_half,
                next_tag: self.next_tag,
            },
        )
    }

    async fn send(&mut self, command: &str) -> Result<String> {
        let tag = format!("w{}", self.next_tag);
        self.next_tag += 1;
        self.stream
            .write_line(&format!("{} {}", tag, command))
            .await?;
        Ok(tag)
    }

    async fn read_tagged(&mut self, tag: &str) -> Result<(bool, String)> {
        loop {
            let line = self.stream.read_line(COMMAND_TIMEOUT).await?;
            if let Some(rest) = line.strip_prefix(&format!("{} ", tag)) {
                return Ok((rest.starts_with("OK"), rest.to_string()));
            }
        }
    }
}

/// Read half of an idling session
pub struct IdleReader {
    reader: BufReader<ReadHalf<MailStream>>,
    carry: Vec<u8>,
}

impl IdleReader {
    /// Wait for the next push event, skipping protocol chatter.
    ///
    /// Returns `Err` when the connection drops; `Bye` when the server says
    /// it is going away.
    pub async fn next_event(&mut self) -> Result<UntaggedEvent> {
        loop {
            let line = self.next_line().await?;
            if let Some(event) = parse_untagged(&line) {
                return Ok(event);
            }
            debug!("Ignoring idle chatter: {}", line);
        }
    }

    async fn next_line(&mut self) -> Result<String> {
        // Drain carried-over buffered lines before touching the socket
        if let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let rest = self.carry.split_off(pos + 1);
            let line = String::from_utf8_lossy(&self.carry).trim_end().to_string();
            self.carry = rest;
            return Ok(line);
        }

        let mut line = String::new();
        if !self.carry.is_empty() {
            line.push_str(String::from_utf8_lossy(&self.carry).trim_end());
            self.carry.clear();
        }

        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| WatchError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(WatchError::Transport(
                "Server closed the connection".to_string(),
            ));
        }

        Ok(line.trim_end().to_string())
    }
}

/// Write half of an idling session
pub struct IdleWriter {
    writer: WriteHalf<MailStream>,
    next_tag: u32,
}

impl IdleWriter {
    /// Break and re-issue IDLE before the server or a NAT box times out.
    ///
    /// The tagged completion and the fresh continuation are consumed (and
    /// ignored) by the reader side.
    pub async fn refresh_idle(&mut self) -> Result<()> {
        self.write_line("DONE").await?;
        let tag = self.next_tag;
        self.next_tag += 1;
        self.write_line(&format!("w{} IDLE", tag)).await
    }

    /// Best-effort clean shutdown.
    pub async fn logout(&mut self) {
        let _ = self.write_line("DONE").await;
        let tag = self.next_tag;
        self.next_tag += 1;
        let _ = self.write_line(&format!("w{} LOGOUT", tag)).await;
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("C: {}", line);
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WatchError::Transport(e.to_string()))?;
        self.writer
            .write_all(b"\r\n")
            .await
            .map_err(|e| WatchError::Transport(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| WatchError::Transport(e.to_string()))?;
        Ok(())
    }
}
