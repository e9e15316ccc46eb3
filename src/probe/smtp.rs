//! SMTP credential probe
//!
//! The outbound counterpart to the IMAP probe: greeting → EHLO →
//! (starttls → EHLO again) → AUTH. Accepting the credentials is the whole
//! verification; no mail is submitted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

use super::tls::probe_connector;
use super::ProbeResult;
use crate::error::{Result, WatchError};
use crate::imap::plain_auth_payload;
use crate::imap::transport::LineStream;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe an SMTP server with the given credentials.
pub async fn probe_smtp(
    host: &str,
    port: u16,
    implicit_tls: bool,
    username: &str,
    password: &str,
    budget: Duration,
) -> ProbeResult {
    let started = Instant::now();

    let result = timeout(budget, attempt(host, port, implicit_tls, username, password)).await;

    match result {
        Ok(Ok(message)) => ProbeResult::ok(message, started.elapsed()),
        Ok(Err(e)) => ProbeResult::fail(e.to_string(), started.elapsed()),
        Err(_) => ProbeResult::fail(
            format!(
                "Probe of {}:{} timed out after {}s",
                host,
                port,
                budget.as_secs()
            ),
            started.elapsed(),
        ),
    }
}

async fn attempt(
    host: &str,
    port: u16,
    implicit_tls: bool,
    username: &str,
    password: &str,
) -> Result<String> {
    let connector = probe_connector();
    let mut stream =
        LineStream::connect(host, port, implicit_tls, &connector, STEP_TIMEOUT).await?;

    let greeting = stream.read_line(STEP_TIMEOUT).await?;
    if !greeting.starts_with("220") {
        return Err(WatchError::Protocol(format!(
            "Unexpected SMTP greeting: {}",
            greeting
        )));
    }

    let mut secured = implicit_tls;
    let mut extensions = ehlo(&mut stream).await?;

    if !implicit_tls && extensions.iter().any(|e| e == "STARTTLS") {
        stream.write_line("STARTTLS").await?;
        let reply = stream.read_line(STEP_TIMEOUT).await?;
        if !reply.starts_with("220") {
            return Err(WatchError::Protocol(format!("STARTTLS refused: {}", reply)));
        }

        stream = stream.upgrade_tls(host, &connector, STEP_TIMEOUT).await?;
        secured = true;

        // The session restarts after the upgrade
        extensions = ehlo(&mut stream).await?;
    }

    debug!("SMTP extensions: {:?}", extensions);

    // AUTH PLAIN first, AUTH LOGIN as the fallback
    let payload = plain_auth_payload(username, password);
    stream.write_line(&format!("AUTH PLAIN {}", payload)).await?;
    let reply = stream.read_line(STEP_TIMEOUT).await?;

    if reply.starts_with("235") {
        let _ = stream.write_line("QUIT").await;
        return Ok(auth_success_message("AUTH PLAIN", secured));
    }

    let plain_rejection = reply;
    debug!(
        "AUTH PLAIN rejected ({}), falling back to AUTH LOGIN",
        plain_rejection
    );

    stream.write_line("AUTH LOGIN").await?;
    let reply = stream.read_line(STEP_TIMEOUT).await?;
    if !reply.starts_with("334") {
        return Err(WatchError::Auth(format!(
            "AUTH PLAIN: {}; AUTH LOGIN: {}",
            plain_rejection, reply
        )));
    }

    stream.write_secret_line(&BASE64.encode(username)).await?;
    let reply = stream.read_line(STEP_TIMEOUT).await?;
    if !reply.starts_with("334") {
        return Err(WatchError::Auth(format!(
            "AUTH PLAIN: {}; AUTH LOGIN: {}",
            plain_rejection, reply
        )));
    }

    stream.write_secret_line(&BASE64.encode(password)).await?;
    let reply = stream.read_line(STEP_TIMEOUT).await?;

    if reply.starts_with("235") {
        let _ = stream.write_line("QUIT").await;
        return Ok(auth_success_message("AUTH LOGIN", secured));
    }

    Err(WatchError::Auth(format!(
        "AUTH PLAIN: {}; AUTH LOGIN: {}",
        plain_rejection, reply
    )))
}

fn auth_success_message(method: &str, secured: bool) -> String {
    format!(
        "Accepted credentials via {} over {}",
        method,
        if secured { "TLS" } else { "plaintext" }
    )
}

/// Send EHLO and collect the advertised extensions.
async fn ehlo(stream: &mut LineStream) -> Result<Vec<String>> {
    stream.write_line("EHLO mailwatch.invalid").await?;

    let mut extensions = Vec::new();
    loop {
        let line = stream.read_line(STEP_TIMEOUT).await?;
        if !line.starts_with("250") {
            return Err(WatchError::Protocol(format!(
                "EHLO rejected: {}",
                line
            )));
        }

        // "250-EXT" continues, "250 EXT" ends the list
        if let Some(ext) = line.get(4..) {
            extensions.push(ext.split_whitespace().next().unwrap_or("").to_string());
        }
        if line.as_bytes().get(3) != Some(&b'-') {
            break;
        }
    }

    Ok(extensions)
}
