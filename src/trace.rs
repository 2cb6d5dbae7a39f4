//! The optional per-worker debug-trace sink.
//!
//! When `--debugtrace=PREFIX` is configured, each worker opens
//! `PREFIX.<pid>` once at birth and appends a literal transcript of the
//! server-side dialogue (as seen from the client) for the lifetime of the
//! worker. The file is append-only and is simply closed (dropped) at
//! worker exit.

use std::fs::{File, OpenOptions};
use std::io::Write;

use anyhow::{Context, Result};

use crate::body::BodyHandle;

pub struct TraceSink {
    file: File,
}

impl TraceSink {
    /// Opens `<prefix>.<pid>` for appending, creating it if necessary.
    pub fn open(prefix: &str, pid: u32) -> Result<Self> {
        let path = format!("{}.{}", prefix, pid);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open debug trace file {}", path))?;
        Ok(TraceSink { file })
    }

    /// Records a line read from the client.
    pub fn record_in(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "<- {}", line)?;
        Ok(())
    }

    /// Records a line written to the client.
    pub fn record_out(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "-> {}", line)?;
        Ok(())
    }

    /// Records a captured DATA body verbatim, rewinding `body` afterward so
    /// the caller can still stream it onward.
    pub fn record_body(&mut self, body: &mut BodyHandle) -> Result<()> {
        std::io::copy(body.reader()?, &mut self.file)?;
        body.rewind()?;
        Ok(())
    }

    /// Duplicates the underlying file descriptor so the same append-only
    /// sink can be handed to each successive session a worker serves.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(TraceSink {
            file: self.file.try_clone()?,
        })
    }
}
