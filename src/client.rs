//! The client side of the SMTP dialogue: the half of the proxy that talks
//! to the upstream SMTP server.
//!
//! `ClientSession` mirrors `server::ServerSession` on the egress leg:
//! `open`, `hear`, `say`, and `yammer`. Multi-line replies (`250-...`
//! continuations terminated by a final `250 ...`) are collapsed into a
//! single composite string so the orchestrator can relay them to the
//! client unchanged.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::body::BodyHandle;
use crate::codec;

pub struct ClientSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ClientSession {
    /// Establishes a TCP connection to the upstream SMTP server.
    pub async fn open(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        Ok(ClientSession {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Reads one complete reply, folding multi-line `xyz-...` continuations
    /// into a single `\r\n`-joined string whose last line carries
    /// `xyz ...` (the space separator, not a dash).
    pub async fn hear(&mut self) -> Result<String> {
        let mut composite = String::new();
        loop {
            let line = codec::read_line(&mut self.reader)
                .await?
                .ok_or_else(|| anyhow::anyhow!("upstream closed connection while awaiting reply"))?;

            let is_final = line
                .as_bytes()
                .get(3)
                .map(|b| *b != b'-')
                .unwrap_or(true);

            if !composite.is_empty() {
                composite.push_str("\r\n");
            }
            composite.push_str(&line);

            if is_final {
                return Ok(composite);
            }
        }
    }

    /// Writes a command line verbatim plus CRLF.
    pub async fn say(&mut self, command: &str) -> Result<()> {
        codec::write_line(&mut self.writer, command).await
    }

    /// Streams `body` to the upstream server as a DATA payload, dot-stuffing
    /// as it goes, followed by the terminating `.` line. Callers must
    /// follow this with `hear()` to obtain the final disposition.
    pub async fn yammer(&mut self, body: &mut BodyHandle) -> Result<()> {
        codec::write_body(&mut self.writer, body).await
    }
}
