//! The captured DATA payload, held as a seekable file-backed byte stream.
//!
//! A `BodyHandle` is created empty when a session enters the DATA phase,
//! filled line-by-line by the server session as the client streams the
//! message, and may later be replaced wholesale by the filter pipeline's
//! output. Replacement is a move: the pre-filter handle is dropped, not
//! aliased, so nothing downstream can observe stale content.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};

/// An owned, movable, file-backed byte stream holding a dot-unstuffed
/// message body.
///
/// Backed by an unlinked temporary file (`tempfile::tempfile`) so the OS
/// reclaims storage on drop regardless of how the session ends, and so the
/// filter pipeline's output sink is already unlinked when it is wrapped
/// back into a `BodyHandle`.
pub struct BodyHandle {
    file: File,
}

impl BodyHandle {
    /// Creates a fresh, empty body handle backed by a new unlinked
    /// temporary file.
    pub fn new() -> Result<Self> {
        let file = tempfile::tempfile().context("failed to create body temp file")?;
        Ok(BodyHandle { file })
    }

    /// Wraps an already-open file (used by the filter pipeline to hand back
    /// its captured stdout as the new body).
    pub fn from_file(file: File) -> Self {
        BodyHandle { file }
    }

    /// Appends one dot-unstuffed body line (without its CRLF) plus a
    /// trailing CRLF.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.write_line_bytes(line.as_bytes())
    }

    /// Appends one dot-unstuffed body line as raw bytes (without its CRLF)
    /// plus a trailing CRLF. The message body is an opaque byte stream, not
    /// necessarily valid UTF-8, so the relay path writes through this
    /// rather than `write_line`.
    pub fn write_line_bytes(&mut self, line: &[u8]) -> Result<()> {
        self.file.write_all(line)?;
        self.file.write_all(b"\r\n")?;
        Ok(())
    }

    /// Rewinds the handle to position zero. Invariant: callers must do
    /// this before streaming the handle onward.
    pub fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Returns a handle to the underlying file for direct reading, already
    /// rewound to the start.
    pub fn reader(&mut self) -> Result<&mut File> {
        self.rewind()?;
        Ok(&mut self.file)
    }

    /// Returns a duplicate file descriptor positioned at the start,
    /// suitable for handing to a subprocess as stdin.
    pub fn duplicate_for_feed(&mut self) -> Result<File> {
        self.rewind()?;
        Ok(self.file.try_clone()?)
    }

    /// Reads the entire body into memory. Used by tests and the filter
    /// pipeline's feeder thread; not used on the hot relay path, which
    /// streams instead so body size is unbounded.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader()?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn into_file(self) -> File {
        self.file
    }
}
