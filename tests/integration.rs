//! End-to-end tests driving `server::ServerSession` and
//! `client::ClientSession` together through `worker::serve_connection`
//! over real loopback TCP sockets, with a scripted task standing in for
//! both the inbound client and the upstream SMTP server.
//!
//! These exercise byte-exact relay, dot-stuffing round-trip, HELO/EHLO
//! identity rewrite, and filter-pipeline composition/failure.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use smtp_filter_relay::server::ServerSession;
use smtp_filter_relay::worker::{serve_connection, WorkerConfig};

fn base_config(upstream_port: u16) -> WorkerConfig {
    WorkerConfig {
        upstream_host: "127.0.0.1".to_string(),
        upstream_port,
        helo: None,
        debugtrace_prefix: None,
        filters: Vec::new(),
        min_per_child: 1,
        max_per_child: 1,
    }
}

/// Spawns a scripted "upstream" SMTP server on loopback that sends `banner`
/// immediately, then for each incoming command line, writes the matching
/// reply from `script` in order and records every line it received.
async fn spawn_scripted_upstream(
    banner: &'static str,
    script: Vec<&'static str>,
) -> (u16, tokio::sync::oneshot::Receiver<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("{}\r\n", banner).as_bytes())
            .await
            .unwrap();

        let mut received = Vec::new();
        for reply in script {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                break;
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            received.push(line);
            write_half
                .write_all(format!("{}\r\n", reply).as_bytes())
                .await
                .unwrap();
        }
        let _ = tx.send(received);
    });

    (port, rx)
}

/// Spawns a scripted upstream that sends `banner`, then reads lines until
/// it sees the DATA terminator `.`, then sends `final_reply` once (or
/// nothing, if the connection closes first).
async fn spawn_data_upstream(
    banner: &'static str,
    final_reply: Option<&'static str>,
) -> (u16, tokio::sync::oneshot::Receiver<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("{}\r\n", banner).as_bytes())
            .await
            .unwrap();

        let mut received = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                break;
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            let is_terminator = line == ".";
            received.push(line);
            if is_terminator {
                if let Some(reply) = final_reply {
                    write_half
                        .write_all(format!("{}\r\n", reply).as_bytes())
                        .await
                        .unwrap();
                }
                break;
            }
        }
        let _ = tx.send(received);
    });

    (port, rx)
}

async fn connect_and_transcript(proxy_port: u16, dialogue: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port))
        .await
        .unwrap();
    stream.write_all(dialogue.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).to_string()
}

#[tokio::test]
async fn s1_pass_through_relays_commands_and_replies_verbatim() {
    let (upstream_port, received_rx) = spawn_scripted_upstream(
        "220 upstream.example ESMTP",
        vec!["250 upstream.example", "250 OK", "250 OK", "250 OK", "221 bye"],
    )
    .await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let cfg = base_config(upstream_port);

    let server_task = tokio::spawn(async move {
        let (mut server, _peer) = ServerSession::accept(&listener, None).await.unwrap();
        serve_connection(&mut server, &cfg, std::process::id(), &None)
            .await
            .unwrap();
    });

    let dialogue = "EHLO c\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nSubject: t\r\n\r\nhi\r\n.\r\nQUIT\r\n";
    let transcript = connect_and_transcript(proxy_port, dialogue).await;

    server_task.await.unwrap();
    let received = received_rx.await.unwrap();
    assert_eq!(
        received,
        vec!["EHLO c", "MAIL FROM:<a@x>", "RCPT TO:<b@y>", "DATA", "."]
    );

    assert_eq!(
        transcript,
        "220 upstream.example ESMTP\r\n\
         250 upstream.example\r\n\
         250 OK\r\n\
         250 OK\r\n\
         354 End data with <CR><LF>.<CR><LF>\r\n\
         250 OK\r\n\
         221 bye\r\n"
    );
}

#[tokio::test]
async fn s2_dot_stuffing_round_trips_through_the_relay() {
    let (upstream_port, received_rx) =
        spawn_data_upstream("220 upstream.example ESMTP", Some("250 OK")).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let cfg = base_config(upstream_port);

    let server_task = tokio::spawn(async move {
        let (mut server, _peer) = ServerSession::accept(&listener, None).await.unwrap();
        serve_connection(&mut server, &cfg, std::process::id(), &None)
            .await
            .unwrap();
    });

    let dialogue = "DATA\r\n..hidden\r\n.\r\n";
    let transcript = connect_and_transcript(proxy_port, dialogue).await;
    server_task.await.unwrap();

    // The DATA line itself never reaches upstream as a command (the proxy
    // answers 354 locally); the captured, dot-unstuffed body is re-stuffed
    // on the way out, so upstream sees exactly what the client sent.
    let received = received_rx.await.unwrap();
    assert_eq!(received, vec!["..hidden", "."]);

    assert_eq!(
        transcript,
        "220 upstream.example ESMTP\r\n354 End data with <CR><LF>.<CR><LF>\r\n250 OK\r\n"
    );
}

#[tokio::test]
async fn s3_helo_rewrite_replaces_identity_but_not_extensions() {
    let (upstream_port, received_rx) = spawn_scripted_upstream(
        "220 upstream.example ESMTP",
        vec!["250-upstream.example\r\n250-SIZE 10485760\r\n250 HELP"],
    )
    .await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let mut cfg = base_config(upstream_port);
    cfg.helo = Some("proxy.example".to_string());

    let server_task = tokio::spawn(async move {
        let (mut server, _peer) = ServerSession::accept(&listener, None).await.unwrap();
        let _ = serve_connection(&mut server, &cfg, std::process::id(), &None).await;
    });

    let transcript = connect_and_transcript(proxy_port, "EHLO laptop\r\n").await;
    server_task.await.unwrap();

    let received = received_rx.await.unwrap();
    assert_eq!(received, vec!["EHLO proxy.example"]);

    assert_eq!(
        transcript,
        "220 proxy.example ESMTP filter proxy\r\n\
         250-proxy.example\r\n250-SIZE 10485760\r\n250 HELP\r\n"
    );
}

#[tokio::test]
async fn s6_filter_failure_closes_without_a_data_success_reply() {
    let (upstream_port, received_rx) =
        spawn_data_upstream("220 upstream.example ESMTP", None).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let mut cfg = base_config(upstream_port);
    cfg.filters = vec![vec!["false".to_string()]];

    let server_task = tokio::spawn(async move {
        let (mut server, _peer) = ServerSession::accept(&listener, None).await.unwrap();
        serve_connection(&mut server, &cfg, std::process::id(), &None).await
    });

    let transcript = connect_and_transcript(proxy_port, "DATA\r\nhi\r\n.\r\n").await;
    let result = server_task.await.unwrap();

    assert!(result.is_err());
    // The 354 is synthesized locally before the filter even runs; the
    // upstream never sees a DATA terminator and so never gets asked for a
    // final 250, and the client's connection is closed without one.
    assert_eq!(transcript, "220 upstream.example ESMTP\r\n354 End data with <CR><LF>.<CR><LF>\r\n");
    let received = received_rx.await.unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn s4_and_s5_filter_chain_transforms_the_body_before_forwarding() {
    let (upstream_port, received_rx) =
        spawn_data_upstream("220 upstream.example ESMTP", Some("250 OK")).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let mut cfg = base_config(upstream_port);
    cfg.filters = vec![
        vec!["sed".to_string(), "s/foo/bar/".to_string()],
        vec!["tr".to_string(), "a-z".to_string(), "A-Z".to_string()],
    ];

    let server_task = tokio::spawn(async move {
        let (mut server, _peer) = ServerSession::accept(&listener, None).await.unwrap();
        serve_connection(&mut server, &cfg, std::process::id(), &None)
            .await
            .unwrap();
    });

    let dialogue = "DATA\r\nfoo\r\n.\r\n";
    let transcript = connect_and_transcript(proxy_port, dialogue).await;
    server_task.await.unwrap();

    // Each stage runs in declaration order: sed's substitution first, then
    // tr's case-fold, composing as f_2 ∘ f_1 rather than f_1 ∘ f_2.
    let received = received_rx.await.unwrap();
    assert_eq!(received, vec!["BAR", "."]);

    assert_eq!(
        transcript,
        "220 upstream.example ESMTP\r\n354 End data with <CR><LF>.<CR><LF>\r\n250 OK\r\n"
    );
}
