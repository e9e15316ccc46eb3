//! One-shot connectivity and credential probing
//!
//! Used by admin tooling to validate mailbox credentials before they are
//! trusted. The probe negotiates transport security and authentication
//! against an unknown server and reports a structured result. Callers
//! always get a `ProbeResult`, never an error, so a bad test cannot crash
//! the caller. The live watcher does not use this path.

mod imap;
mod smtp;
mod tls;

pub use imap::probe_imap;
pub use smtp::probe_smtp;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Hard wall-clock budget for a single probe attempt
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period for servers that resend a greeting after STARTTLS
pub(crate) const STARTTLS_GREETING_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one probe call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    /// Human-readable outcome, including which auth method succeeded or
    /// every rejection reason collected along the way
    pub message: String,
    /// Wall-clock time the probe took
    pub elapsed_ms: u64,
}

impl ProbeResult {
    pub(crate) fn ok(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            message: message.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub(crate) fn fail(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            message: message.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Credentials and endpoints under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeCredentials {
    pub email: String,
    pub password: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_tls: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_tls: bool,
}

/// Combined report for the admin connectivity test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTestReport {
    pub imap: ProbeResult,
    pub smtp: ProbeResult,
}

impl ConnectionTestReport {
    pub fn success(&self) -> bool {
        self.imap.success && self.smtp.success
    }
}

/// Test both transports for a set of credentials.
///
/// The IMAP and SMTP probes run concurrently; each is independently
/// time-boxed so the whole test returns within the probe budget.
pub async fn test_connection(creds: &ProbeCredentials) -> ConnectionTestReport {
    info!(
        imap = %creds.imap_host,
        smtp = %creds.smtp_host,
        "Testing connection for {}",
        creds.email
    );

    let (imap, smtp) = tokio::join!(
        probe_imap(
            &creds.imap_host,
            creds.imap_port,
            creds.imap_tls,
            &creds.email,
            &creds.password,
            PROBE_TIMEOUT,
        ),
        probe_smtp(
            &creds.smtp_host,
            creds.smtp_port,
            creds.smtp_tls,
            &creds.email,
            &creds.password,
            PROBE_TIMEOUT,
        ),
    );

    info!(
        "Connection test for {}: imap={} smtp={}",
        creds.email, imap.success, smtp.success
    );

    ConnectionTestReport { imap, smtp }
}
