//! Probe behavior against scripted servers
//!
//! Each test binds a local listener that plays one server-side script, then
//! asserts on the structured probe result. No TLS paths here: the scripts
//! exercise the auth state machine over plaintext, the way a port-143
//! server without STARTTLS would.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use mailwatch::probe::{probe_imap, probe_smtp, test_connection, ProbeCredentials};

const BUDGET: Duration = Duration::from_secs(15);

/// Spawn a one-connection server running `script`; returns its address and
/// a channel yielding every command line the client sent.
async fn spawn_server<F, Fut>(script: F) -> (SocketAddr, mpsc::UnboundedReceiver<String>)
where
    F: FnOnce(ServerConn) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        script(ServerConn {
            reader: BufReader::new(read_half),
            writer: write_half,
            seen: seen_tx,
        })
        .await;
    });

    (addr, seen_rx)
}

struct ServerConn {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    seen: mpsc::UnboundedSender<String>,
}

impl ServerConn {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end().to_string();
        let _ = self.seen.send(line.clone());
        line
    }
}

fn drain(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}

#[tokio::test]
async fn imap_probe_falls_back_to_login_and_stops_there() {
    let (addr, seen_rx) = spawn_server(|mut conn| async move {
        conn.send("* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready").await;

        let auth = conn.recv().await;
        assert!(auth.starts_with("a1 AUTHENTICATE PLAIN "));
        conn.send("a1 NO [AUTHENTICATIONFAILED] SASL not allowed").await;

        let login = conn.recv().await;
        assert!(login.starts_with("a2 LOGIN \"user@example.com\""));
        conn.send("a2 OK LOGIN completed").await;

        let logout = conn.recv().await;
        assert!(logout.starts_with("a3 LOGOUT"));
        conn.send("* BYE").await;
        conn.send("a3 OK").await;
    })
    .await;

    let result = probe_imap(
        "127.0.0.1",
        addr.port(),
        false,
        "user@example.com",
        "secret",
        BUDGET,
    )
    .await;

    assert!(result.success, "unexpected failure: {}", result.message);
    assert!(result.message.contains("LOGIN"));

    // Exactly two auth attempts, never a third method
    let commands = drain(seen_rx);
    let auth_attempts = commands
        .iter()
        .filter(|c| c.contains("AUTHENTICATE") || c.contains(" LOGIN "))
        .count();
    assert_eq!(auth_attempts, 2);
}

#[tokio::test]
async fn imap_probe_reports_auth_plain_success() {
    let (addr, _seen) = spawn_server(|mut conn| async move {
        conn.send("* OK ready").await;
        let _auth = conn.recv().await;
        conn.send("a1 OK authenticated").await;
        let _logout = conn.recv().await;
        conn.send("a3 OK").await;
    })
    .await;

    let result = probe_imap("127.0.0.1", addr.port(), false, "user", "pw", BUDGET).await;

    assert!(result.success);
    assert!(result.message.contains("AUTH PLAIN"));
}

#[tokio::test]
async fn imap_probe_handles_continuation_servers() {
    // A server without SASL-IR ignores the inline payload and asks for it
    let (addr, _seen) = spawn_server(|mut conn| async move {
        conn.send("* OK ready").await;
        let _auth = conn.recv().await;
        conn.send("+").await;
        let payload = conn.recv().await;
        assert!(!payload.is_empty());
        conn.send("a1 OK authenticated").await;
        let _logout = conn.recv().await;
        conn.send("a3 OK").await;
    })
    .await;

    let result = probe_imap("127.0.0.1", addr.port(), false, "user", "pw", BUDGET).await;
    assert!(result.success, "unexpected failure: {}", result.message);
}

#[tokio::test]
async fn imap_probe_collects_both_rejection_reasons() {
    let (addr, _seen) = spawn_server(|mut conn| async move {
        conn.send("* OK ready").await;
        let _auth = conn.recv().await;
        conn.send("a1 NO mechanism disabled").await;
        let _login = conn.recv().await;
        conn.send("a2 NO invalid credentials").await;
    })
    .await;

    let result = probe_imap("127.0.0.1", addr.port(), false, "user", "pw", BUDGET).await;

    assert!(!result.success);
    assert!(result.message.contains("mechanism disabled"));
    assert!(result.message.contains("invalid credentials"));
}

#[tokio::test]
async fn imap_probe_times_out_against_a_silent_server() {
    // Accepts the connection and never says anything
    let (addr, _seen) = spawn_server(|mut conn| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        conn.send("* OK too late").await;
    })
    .await;

    let budget = Duration::from_secs(1);
    let started = Instant::now();
    let result = probe_imap("127.0.0.1", addr.port(), false, "user", "pw", budget).await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert!(
        result.message.to_lowercase().contains("time"),
        "message should mention the timeout: {}",
        result.message
    );
    assert!(elapsed < budget + Duration::from_secs(2));
}

#[tokio::test]
async fn imap_probe_fails_fast_on_refused_connection() {
    // Nothing listens on this port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = probe_imap("127.0.0.1", addr.port(), false, "user", "pw", BUDGET).await;
    assert!(!result.success);
}

#[tokio::test]
async fn smtp_probe_falls_back_to_auth_login() {
    let (addr, _seen) = spawn_server(|mut conn| async move {
        conn.send("220 mail.example.com ESMTP").await;

        let ehlo = conn.recv().await;
        assert!(ehlo.starts_with("EHLO"));
        conn.send("250-mail.example.com").await;
        conn.send("250 AUTH PLAIN LOGIN").await;

        let _plain = conn.recv().await;
        conn.send("535 5.7.8 PLAIN rejected").await;

        let login = conn.recv().await;
        assert_eq!(login, "AUTH LOGIN");
        conn.send("334 VXNlcm5hbWU6").await;
        let _user = conn.recv().await;
        conn.send("334 UGFzc3dvcmQ6").await;
        let _pass = conn.recv().await;
        conn.send("235 2.7.0 accepted").await;

        let _quit = conn.recv().await;
        conn.send("221 bye").await;
    })
    .await;

    let result = probe_smtp("127.0.0.1", addr.port(), false, "user", "pw", BUDGET).await;

    assert!(result.success, "unexpected failure: {}", result.message);
    assert!(result.message.contains("AUTH LOGIN"));
}

#[tokio::test]
async fn smtp_probe_accepts_plain_directly() {
    let (addr, _seen) = spawn_server(|mut conn| async move {
        conn.send("220 mail ESMTP").await;
        let _ehlo = conn.recv().await;
        conn.send("250 AUTH PLAIN").await;
        let _plain = conn.recv().await;
        conn.send("235 accepted").await;
        let _quit = conn.recv().await;
        conn.send("221 bye").await;
    })
    .await;

    let result = probe_smtp("127.0.0.1", addr.port(), false, "user", "pw", BUDGET).await;
    assert!(result.success);
    assert!(result.message.contains("AUTH PLAIN"));
}

#[tokio::test]
async fn test_connection_reports_both_transports() {
    let (imap_addr, _a) = spawn_server(|mut conn| async move {
        conn.send("* OK ready").await;
        let _auth = conn.recv().await;
        conn.send("a1 OK authenticated").await;
        let _logout = conn.recv().await;
        conn.send("a3 OK").await;
    })
    .await;

    let (smtp_addr, _b) = spawn_server(|mut conn| async move {
        conn.send("220 mail ESMTP").await;
        let _ehlo = conn.recv().await;
        conn.send("250 AUTH PLAIN").await;
        let _plain = conn.recv().await;
        conn.send("235 accepted").await;
        let _quit = conn.recv().await;
    })
    .await;

    let creds = ProbeCredentials {
        email: "user@example.com".to_string(),
        password: "pw".to_string(),
        imap_host: "127.0.0.1".to_string(),
        imap_port: imap_addr.port(),
        imap_tls: false,
        smtp_host: "127.0.0.1".to_string(),
        smtp_port: smtp_addr.port(),
        smtp_tls: false,
    };

    let report = test_connection(&creds).await;
    assert!(report.imap.success, "imap: {}", report.imap.message);
    assert!(report.smtp.success, "smtp: {}", report.smtp.message);
    assert!(report.success());
}
