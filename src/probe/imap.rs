//! IMAP credential probe
//!
//! A one-shot state machine over the line protocol:
//! greeting → (starttls → starttls-greeting) → auth-plain → login → done.
//! Both auth methods are tried in order; a server that rejects the SASL
//! exchange but accepts LOGIN still probes as a success. No third method is
//! ever attempted.

use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info};

use super::tls::probe_connector;
use super::{ProbeResult, STARTTLS_GREETING_GRACE};
use crate::error::{Result, WatchError};
use crate::imap::transport::LineStream;
use crate::imap::{plain_auth_payload, quote_string};

/// Per-step budget for connect and single-line reads
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Plaintext port used for the STARTTLS retry after an implicit-TLS failure
const STARTTLS_FALLBACK_PORT: u16 = 143;

/// Probe an IMAP server with the given credentials.
///
/// Always returns within `budget + small epsilon` per attempt and never
/// leaves a socket open: every exit path drops the stream.
pub async fn probe_imap(
    host: &str,
    port: u16,
    implicit_tls: bool,
    username: &str,
    password: &str,
    budget: Duration,
) -> ProbeResult {
    let started = Instant::now();

    let first = run_attempt(host, port, implicit_tls, username, password, budget).await;

    let first_err = match first {
        Ok(message) => return ProbeResult::ok(message, started.elapsed()),
        Err(e) => e,
    };

    // Many providers accept exactly one of {implicit TLS, STARTTLS}. If the
    // secure-port attempt failed, try once more through the plaintext port.
    if implicit_tls {
        info!(
            host = %host,
            "Implicit-TLS probe failed, retrying via STARTTLS on port {}",
            STARTTLS_FALLBACK_PORT
        );

        let second = run_attempt(
            host,
            STARTTLS_FALLBACK_PORT,
            false,
            username,
            password,
            budget,
        )
        .await;

        return match second {
            Ok(message) => ProbeResult::ok(
                format!("{} (after implicit-TLS attempt failed: {})", message, first_err),
                started.elapsed(),
            ),
            Err(second_err) => ProbeResult::fail(
                format!("{}; STARTTLS retry: {}", first_err, second_err),
                started.elapsed(),
            ),
        };
    }

    ProbeResult::fail(first_err.to_string(), started.elapsed())
}

/// One full probe attempt against one port, hard time-boxed.
async fn run_attempt(
    host: &str,
    port: u16,
    implicit_tls: bool,
    username: &str,
    password: &str,
    budget: Duration,
) -> Result<String> {
    match timeout(budget, attempt(host, port, implicit_tls, username, password)).await {
        Ok(result) => result,
        Err(_) => Err(WatchError::Timeout(format!(
            "Probe of {}:{} timed out after {}s",
            host,
            port,
            budget.as_secs()
        ))),
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

    // greeting
    let greeting = stream.read_line(STEP_TIMEOUT).await?;
    if greeting.starts_with("* PREAUTH") {
        let _ = stream.write_line("a3 LOGOUT").await;
        return Ok("Server pre-authenticated the session".to_string());
    }
    if !greeting.starts_with("* OK") {
        return Err(WatchError::Protocol(format!(
            "Unexpected IMAP greeting: {}",
            greeting
        )));
    }

    // starttls, when the server says plaintext login is off the table
    let mut secured = implicit_tls;
    if !implicit_tls && needs_starttls(&greeting) {
        stream.write_line("a0 STARTTLS").await?;
        let (ok, text) = read_tagged(&mut stream, "a0").await?;
        if !ok {
            return Err(WatchError::Protocol(format!("STARTTLS refused: {}", text)));
        }

        stream = stream.upgrade_tls(host, &connector, STEP_TIMEOUT).await?;
        secured = true;

        // starttls-greeting: some servers resend a greeting, some don't
        if let Some(line) = stream.read_line_opt(STARTTLS_GREETING_GRACE).await? {
            debug!("Post-STARTTLS greeting: {}", line);
        }
    }

    // auth-plain
    let payload = plain_auth_payload(username, password);
    stream
        .write_line(&format!("a1 AUTHENTICATE PLAIN {}", payload))
        .await?;

    let plain_rejection = match read_auth_response(&mut stream, "a1", &payload).await? {
        AuthOutcome::Accepted => {
            let _ = stream.write_line("a3 LOGOUT").await;
            return Ok(auth_success_message("AUTH PLAIN", secured));
        }
        AuthOutcome::Rejected(reason) => reason,
    };

    debug!("AUTH PLAIN rejected ({}), falling back to LOGIN", plain_rejection);

    // login fallback with the same credentials
    stream
        .write_line(&format!(
            "a2 LOGIN {} {}",
            quote_string(username),
            quote_string(password)
        ))
        .await?;

    let (ok, text) = read_tagged(&mut stream, "a2").await?;
    if ok {
        let _ = stream.write_line("a3 LOGOUT").await;
        return Ok(auth_success_message("LOGIN", secured));
    }

    Err(WatchError::Auth(format!(
        "AUTH PLAIN: {}; LOGIN: {}",
        plain_rejection, text
    )))
}

fn auth_success_message(method: &str, secured: bool) -> String {
    format!(
        "Authenticated via {} over {}",
        method,
        if secured { "TLS" } else { "plaintext" }
    )
}

/// Whether the greeting advertises that an upgrade is required or available
fn needs_starttls(greeting: &str) -> bool {
    let upper = greeting.to_ascii_uppercase();
    upper.contains("STARTTLS") || upper.contains("LOGINDISABLED")
}

enum AuthOutcome {
    Accepted,
    Rejected(String),
}

/// Read the response to an AUTHENTICATE command.
///
/// Servers without SASL-IR answer with a `+` continuation instead of taking
/// the inline payload; resend it on their terms.
async fn read_auth_response(
    stream: &mut LineStream,
    tag: &str,
    payload: &str,
) -> Result<AuthOutcome> {
    let mut resent = false;
    loop {
        let line = stream.read_line(STEP_TIMEOUT).await?;

        if line.starts_with('+') {
            if resent {
                return Err(WatchError::Protocol(
                    "Server kept requesting auth continuation".to_string(),
                ));
            }
            stream.write_secret_line(payload).await?;
            resent = true;
            continue;
        }

        if let Some(rest) = line.strip_prefix(&format!("{} ", tag)) {
            return if rest.starts_with("OK") {
                Ok(AuthOutcome::Accepted)
            } else {
                Ok(AuthOutcome::Rejected(rest.to_string()))
            };
        }

        // untagged chatter (capability updates etc.) is skipped
    }
}

/// Read lines until the tagged response arrives, skipping untagged ones.
async fn read_tagged(stream: &mut LineStream, tag: &str) -> Result<(bool, String)> {
    loop {
        let line = stream.read_line(STEP_TIMEOUT).await?;
        if let Some(rest) = line.strip_prefix(&format!("{} ", tag)) {
            return Ok((rest.starts_with("OK"), rest.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_starttls() {
        assert!(needs_starttls(
            "* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] ready"
        ));
        assert!(needs_starttls("* OK [CAPABILITY IMAP4rev1 STARTTLS] ready"));
        assert!(!needs_starttls(
            "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready"
        ));
    }
}
