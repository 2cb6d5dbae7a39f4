//! The per-connection session orchestrator that runs inside a forked
//! worker: it weaves `server::ServerSession`, `client::ClientSession`, and
//! `filter::run` together for one inbound connection at a time, and bounds
//! the worker's total lifetime to a randomized number of sessions.

use anyhow::{Context, Result};
use log::{error, info};
use rand::Rng;
use tokio::net::TcpListener;

use crate::client::ClientSession;
use crate::filter::FilterSpec;
use crate::server::{Command, ServerSession};
use crate::trace::TraceSink;

/// Everything a worker needs that does not change between sessions.
pub struct WorkerConfig {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub helo: Option<String>,
    pub debugtrace_prefix: Option<String>,
    pub filters: Vec<FilterSpec>,
    pub min_per_child: u32,
    pub max_per_child: u32,
}

/// Runs one worker to completion: builds its own current-thread Tokio
/// runtime (workers are independent processes; none of this state is
/// shared with the parent or with sibling workers), then serves
/// connections sequentially until its randomized lifetime is exhausted.
///
/// The worker installs no signal handler of its own: `pool::spawn_worker`
/// resets SIGTERM/SIGINT to their default disposition right after forking,
/// so the parent's broadcast ends this process immediately between
/// syscalls, same as any other process with no handler installed.
pub fn run(std_listener: &std::net::TcpListener, cfg: &WorkerConfig) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build worker Tokio runtime")?;
    rt.block_on(run_async(std_listener, cfg))
}

async fn run_async(std_listener: &std::net::TcpListener, cfg: &WorkerConfig) -> Result<()> {
    let listener_clone = std_listener.try_clone()?;
    listener_clone.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener_clone)?;

    let pid = std::process::id();
    let trace_master = match &cfg.debugtrace_prefix {
        Some(prefix) => Some(TraceSink::open(prefix, pid)?),
        None => None,
    };

    // Drawn once at birth from a per-process RNG seeded independently of
    // the parent and any sibling (the first use of `thread_rng` after
    // `fork` reseeds from OS entropy).
    let mut remaining: u32 = rand::thread_rng().gen_range(cfg.min_per_child..=cfg.max_per_child);
    info!("worker {} starting with lifetime {}", pid, remaining);

    loop {
        let (mut server, peer) = match ServerSession::accept(&listener, clone_trace(&trace_master)?).await {
            Ok(v) => v,
            Err(e) => {
                error!("worker {} accept failed: {:#}", pid, e);
                continue;
            }
        };
        info!("worker {} serving connection from {}", pid, peer);

        if let Err(e) = serve_connection(&mut server, cfg, pid, &trace_master).await {
            error!("worker {} session with {} aborted: {:#}", pid, peer, e);
        }

        remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            info!("worker {} exhausted its lifetime, exiting", pid);
            return Ok(());
        }
    }
}

fn clone_trace(master: &Option<TraceSink>) -> Result<Option<TraceSink>> {
    master.as_ref().map(TraceSink::try_clone).transpose()
}

/// Serves one full SMTP session: banner, then the forwarding loop over
/// `ServerSession::chat()`. Public so integration tests can drive a single
/// session over real loopback sockets without going through `pool::Pool`,
/// which forks and therefore cannot be exercised from within a test
/// harness process.
pub async fn serve_connection(
    server: &mut ServerSession,
    cfg: &WorkerConfig,
    pid: u32,
    trace_master: &Option<TraceSink>,
) -> Result<()> {
    let mut client = ClientSession::open(&cfg.upstream_host, cfg.upstream_port)
        .await
        .context("failed to connect to upstream SMTP server")?;

    let upstream_banner = client.hear().await.context("failed to read upstream banner")?;

    let banner = match &cfg.helo {
        Some(fqdn) => {
            let mut banner = format!("220 {} ESMTP filter proxy", fqdn);
            if let (Some(prefix), Some(_)) = (&cfg.debugtrace_prefix, trace_master) {
                banner.push_str(&format!(" {}.{}", prefix, pid));
            }
            banner
        }
        None => upstream_banner,
    };
    server.ok(&banner).await?;

    while let Some(command) = server.chat().await? {
        match command {
            Command::Line(line) => {
                if let (Some(fqdn), Some(verb)) = (&cfg.helo, helo_verb(&line)) {
                    let rewritten = format!("{} {}", verb, fqdn);
                    client.say(&rewritten).await?;
                    let reply = client.hear().await?;
                    server.ok(&rewrite_identity_line(&reply, fqdn)).await?;
                } else {
                    client.say(&line).await?;
                    let reply = client.hear().await?;
                    server.ok(&reply).await?;
                }
            }
            Command::DataCaptured => {
                let body = server
                    .take_body()
                    .context("DATA sentinel reached without a captured body")?;
                let mut filtered = crate::filter::run(&cfg.filters, body)
                    .context("content filter pipeline failed")?;
                client.yammer(&mut filtered).await?;
                let reply = client.hear().await?;
                server.ok(&reply).await?;
            }
        }
    }

    Ok(())
}

/// If `line` is a `HELO` or `EHLO` command (verb followed by whitespace),
/// returns the verb exactly as the client sent it so the rewritten command
/// preserves it.
fn helo_verb(line: &str) -> Option<&str> {
    let verb = line.split_whitespace().next()?;
    if verb.eq_ignore_ascii_case("HELO") || verb.eq_ignore_ascii_case("EHLO") {
        Some(verb)
    } else {
        None
    }
}

/// Rewrites only the first line of a (possibly multi-line) upstream reply
/// when it is a `250` identity announcement, leaving any subsequent
/// `250-...` extension lines (e.g. `250-SIZE ...`) untouched.
///
/// The naive approach of rewriting every `250-...` line would corrupt
/// extension announcements like `250-SIZE ...`; this restricts the
/// substitution to the first line, which is the hostname announcement.
fn rewrite_identity_line(reply: &str, fqdn: &str) -> String {
    let mut lines: Vec<String> = reply.split("\r\n").map(str::to_string).collect();
    if let Some(first) = lines.first_mut() {
        if first.len() >= 4 && first.as_bytes()[..3] == *b"250" {
            let sep = first.as_bytes()[3];
            if sep == b'-' || sep == b' ' {
                *first = format!("250{}{}", sep as char, fqdn);
            }
        }
    }
    lines.join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helo_verb_matches_case_insensitively() {
        assert_eq!(helo_verb("ehlo laptop"), Some("ehlo"));
        assert_eq!(helo_verb("HELO foo"), Some("HELO"));
        assert_eq!(helo_verb("MAIL FROM:<a@x>"), None);
    }

    #[test]
    fn rewrite_only_touches_identity_line() {
        let reply = "250-upstream.example\r\n250-SIZE 10485760\r\n250 HELP";
        let rewritten = rewrite_identity_line(reply, "proxy.example");
        assert_eq!(
            rewritten,
            "250-proxy.example\r\n250-SIZE 10485760\r\n250 HELP"
        );
    }

    #[test]
    fn rewrite_handles_single_line_reply() {
        let reply = "250 Hello laptop";
        let rewritten = rewrite_identity_line(reply, "proxy.example");
        assert_eq!(rewritten, "250 proxy.example");
    }
}
