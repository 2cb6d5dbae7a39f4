//! The server side of the SMTP dialogue: the half of the proxy that talks
//! to the inbound client.
//!
//! `ServerSession` owns the inbound transport and the per-transaction state
//! (envelope, captured body) and exposes `accept`, `ok`, `chat`, and the
//! body accessor. It never talks to the upstream server directly; the
//! orchestrator in `worker` wires this together with `client::ClientSession`
//! and `filter::run`.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::body::BodyHandle;
use crate::codec;
use crate::trace::TraceSink;

/// One command handed back to the orchestrator by `chat()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A command line forwarded verbatim from the client (HELO, MAIL FROM,
    /// RCPT TO, RSET, QUIT, or anything else the client sends).
    Line(String),
    /// The sentinel produced after a full DATA payload has been captured.
    DataCaptured,
}

/// The envelope captured so far in the current transaction.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
}

/// Server-side half of one SMTP session.
pub struct ServerSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    envelope: Envelope,
    body: Option<BodyHandle>,
    trace: Option<TraceSink>,
    quit_seen: bool,
}

impl ServerSession {
    /// Waits on `listener` for a new inbound connection and installs it as
    /// the session's transport. `trace` is attached for the lifetime of the
    /// session if the worker was started with `--debugtrace`.
    pub async fn accept(listener: &TcpListener, trace: Option<TraceSink>) -> Result<(Self, std::net::SocketAddr)> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        Ok((
            ServerSession {
                reader: BufReader::new(read_half),
                writer: write_half,
                envelope: Envelope::default(),
                body: None,
                trace,
                quit_seen: false,
            },
            peer,
        ))
    }

    /// Writes a complete reply line to the client verbatim plus CRLF.
    pub async fn ok(&mut self, line: &str) -> Result<()> {
        if let Some(trace) = &mut self.trace {
            trace.record_out(line)?;
        }
        codec::write_line(&mut self.writer, line).await
    }

    /// Reads the next command from the client, special-casing `DATA`.
    ///
    /// Returns `Ok(None)` when the client has closed the connection, or
    /// once `QUIT` has already been relayed by the orchestrator.
    pub async fn chat(&mut self) -> Result<Option<Command>> {
        if self.quit_seen {
            return Ok(None);
        }

        let line = match codec::read_line(&mut self.reader).await? {
            Some(line) => line,
            None => return Ok(None),
        };
        if let Some(trace) = &mut self.trace {
            trace.record_in(&line)?;
        }

        let upper = line.to_ascii_uppercase();

        if upper == "DATA" {
            self.ok("354 End data with <CR><LF>.<CR><LF>").await?;
            let mut body = BodyHandle::new()?;
            codec::read_body(&mut self.reader, &mut body).await?;
            if let Some(trace) = &mut self.trace {
                trace.record_body(&mut body)?;
            }
            self.body = Some(body);
            return Ok(Some(Command::DataCaptured));
        }

        if upper == "RSET" {
            self.body = None;
            self.envelope = Envelope::default();
        } else if upper.starts_with("MAIL FROM:") {
            // A second MAIL FROM starts a new transaction: drop whatever
            // recipients and body (if any) belonged to the previous one.
            self.body = None;
            self.envelope = Envelope::default();
            self.envelope.mail_from = Some(line.clone());
        } else if upper.starts_with("RCPT TO:") {
            self.envelope.rcpt_to.push(line.clone());
        } else if upper == "QUIT" {
            self.quit_seen_after_reply();
        }

        Ok(Some(Command::Line(line)))
    }

    /// Marks that the next `chat()` call should report end-of-dialogue,
    /// once the orchestrator has relayed this QUIT's upstream reply.
    fn quit_seen_after_reply(&mut self) {
        self.quit_seen = true;
    }

    /// Takes the captured body, leaving `None` behind. The orchestrator
    /// hands this to the filter pipeline and installs the result with
    /// `set_body`.
    pub fn take_body(&mut self) -> Option<BodyHandle> {
        self.body.take()
    }

    pub fn set_body(&mut self, body: BodyHandle) {
        self.body = Some(body);
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

/// Opens a fresh `TcpListener` bound to `addr`, inherited across forked
/// workers.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}
