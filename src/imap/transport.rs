//! Line-oriented mail transport, plain or TLS, with in-place STARTTLS
//!
//! Both the probe and the live session talk line-framed text protocols over
//! a socket that may start plaintext and upgrade to TLS mid-stream. The
//! upgrade re-wraps the same TCP stream; any plaintext still sitting in the
//! read buffer is discarded, never replayed into the encrypted channel.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Result, WatchError};

/// A mail server connection, before or after TLS
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MailStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MailStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Buffered line transport over a [`MailStream`]
pub struct LineStream {
    inner: BufReader<MailStream>,
}

impl LineStream {
    /// Open a TCP connection, optionally wrapping it in TLS immediately.
    pub async fn connect(
        host: &str,
        port: u16,
        implicit_tls: bool,
        connector: &TlsConnector,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| WatchError::Timeout(format!("Connection timeout to {}", addr)))?
            .map_err(|e| WatchError::Transport(format!("Connect to {} failed: {}", addr, e)))?;

        let stream = if implicit_tls {
            let server_name = server_name(host)?;
            let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| WatchError::Timeout(format!("TLS handshake timeout to {}", addr)))?
                .map_err(|e| WatchError::Transport(format!("TLS error: {}", e)))?;
            MailStream::Tls(Box::new(tls))
        } else {
            MailStream::Plain(tcp)
        };

        Ok(Self {
            inner: BufReader::new(stream),
        })
    }

    /// Upgrade a plaintext connection to TLS in place.
    ///
    /// Consumes the buffered reader: whatever plaintext the server sent after
    /// its upgrade acknowledgement is dropped with the old buffer.
    pub async fn upgrade_tls(
        self,
        host: &str,
        connector: &TlsConnector,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        // into_inner discards the read buffer, which is exactly what we want
        let tcp = match self.inner.into_inner() {
            MailStream::Plain(tcp) => tcp,
            MailStream::Tls(_) => {
                return Err(WatchError::Protocol(
                    "STARTTLS on an already-encrypted connection".to_string(),
                ))
            }
        };

        let server_name = server_name(host)?;
        let tls = timeout(handshake_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| WatchError::Timeout(format!("TLS handshake timeout to {}", host)))?
            .map_err(|e| WatchError::Transport(format!("TLS error: {}", e)))?;

        Ok(Self {
            inner: BufReader::new(MailStream::Tls(Box::new(tls))),
        })
    }

    /// Read one CRLF-terminated line within the given budget.
    pub async fn read_line(&mut self, read_timeout: Duration) -> Result<String> {
        let mut line = String::new();
        let n = timeout(read_timeout, self.inner.read_line(&mut line))
            .await
            .map_err(|_| WatchError::Timeout("No response from server".to_string()))?
            .map_err(|e| WatchError::Transport(e.to_string()))?;

        if n == 0 {
            return Err(WatchError::Transport(
                "Server closed the connection".to_string(),
            ));
        }

        let line = line.trim_end().to_string();
        debug!("S: {}", line);
        Ok(line)
    }

    /// Try to read a line, returning `None` if nothing arrives in time.
    ///
    /// Used for the post-STARTTLS greeting some servers resend and some
    /// don't.
    pub async fn read_line_opt(&mut self, grace: Duration) -> Result<Option<String>> {
        match self.read_line(grace).await {
            Ok(line) => Ok(Some(line)),
            Err(WatchError::Timeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Take the underlying stream back, along with any bytes already read
    /// into the buffer. Callers that keep reading must drain the carried
    /// bytes first or server pushes can be lost.
    pub fn into_parts(self) -> (MailStream, Vec<u8>) {
        let carry = self.inner.buffer().to_vec();
        (self.inner.into_inner(), carry)
    }

    /// Send one line, appending CRLF.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("C: {}", redact(line));
        self.write_raw(line).await
    }

    /// Send a line that is nothing but credential material (SASL
    /// continuations, base64 AUTH LOGIN answers); the log shows a
    /// placeholder only.
    pub async fn write_secret_line(&mut self, line: &str) -> Result<()> {
        debug!("C: ***");
        self.write_raw(line).await
    }

    async fn write_raw(&mut self, line: &str) -> Result<()> {
        let stream = self.inner.get_mut();
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WatchError::Transport(e.to_string()))?;
        stream
            .write_all(b"\r\n")
            .await
            .map_err(|e| WatchError::Transport(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| WatchError::Transport(e.to_string()))?;
        Ok(())
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| WatchError::Transport(format!("Invalid hostname: {}", host)))
}

/// Keep credentials out of the debug log
fn redact(line: &str) -> String {
    let upper = line.to_ascii_uppercase();
    if upper.contains("LOGIN") || upper.contains("AUTHENTICATE") || upper.contains("AUTH ") {
        let mut words = line.splitn(3, ' ');
        let tag = words.next().unwrap_or("");
        let verb = words.next().unwrap_or("");
        format!("{} {} ***", tag, verb)
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_credentials() {
        assert_eq!(redact("a2 LOGIN \"user\" \"secret\""), "a2 LOGIN ***");
        assert_eq!(redact("a1 AUTHENTICATE PLAIN AGZvbwBiYXI="), "a1 AUTHENTICATE ***");
        assert_eq!(redact("a4 SELECT INBOX"), "a4 SELECT INBOX");
    }
}
