//! CRLF line framing and DATA-phase dot-(un)stuffing.
//!
//! Every command and reply on the wire is a line terminated by CRLF; the
//! DATA payload is a sequence of such lines terminated by a line containing
//! only `.`, with any line that begins with `.` carrying one extra leading
//! `.` to disambiguate it from the terminator. This module is the single
//! place that understands that framing; `server`, `client`, and `filter`
//! build on top of it.
//!
//! Command/reply lines are handled as `String` (they're ASCII SMTP
//! grammar); the DATA payload is handled as raw bytes, since a message
//! body is an opaque byte stream that need not be valid UTF-8.

use std::io::BufRead;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::body::BodyHandle;

/// Reads one CRLF-terminated line and strips the terminator.
///
/// Returns `Ok(None)` on a clean EOF (the peer closed the connection before
/// sending a terminator). Lines longer than 998 octets are returned in
/// full; this codec never truncates.
pub async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Writes `line` followed by a single CRLF and flushes.
pub async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one CRLF-terminated line of raw body bytes, without requiring it
/// to be valid UTF-8, unlike the command/reply lines `read_line` handles.
async fn read_body_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Consumes DATA-phase lines from `reader` into `body` until the lone-dot
/// terminator, dot-unstuffing as it goes. The terminator itself is
/// consumed but not written to `body`.
pub async fn read_body<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    body: &mut BodyHandle,
) -> Result<()> {
    loop {
        match read_body_line(reader).await? {
            None => anyhow::bail!("unexpected EOF while reading DATA payload"),
            Some(line) => {
                if line == b"." {
                    return Ok(());
                }
                let unstuffed = if line.first() == Some(&b'.') {
                    &line[1..]
                } else {
                    &line[..]
                };
                body.write_line_bytes(unstuffed)?;
            }
        }
    }
}

/// Streams `body`'s contents to `writer` as a DATA payload: dot-stuffs each
/// line, terminates each with CRLF, then writes the lone-dot terminator.
/// `body` is left positioned at EOF; callers that need to reuse it should
/// rewind first. Lines are read and written as raw bytes, so a body that
/// isn't valid UTF-8 round-trips unchanged.
pub async fn write_body<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    body: &mut BodyHandle,
) -> Result<()> {
    let file = body.reader()?.try_clone()?;
    let mut reader = std::io::BufReader::new(file);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.first() == Some(&b'.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(&line).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn read_line_strips_crlf() {
        let mut r = BufReader::new("HELO there\r\n".as_bytes());
        let line = read_line(&mut r).await.unwrap();
        assert_eq!(line, Some("HELO there".to_string()));
    }

    #[tokio::test]
    async fn read_line_eof_is_none() {
        let mut r = BufReader::new("".as_bytes());
        let line = read_line(&mut r).await.unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn dot_unstuffing_round_trip() {
        let mut body = BodyHandle::new().unwrap();
        let mut r = BufReader::new("Subject: t\r\n\r\n..hidden\r\nhi\r\n.\r\n".as_bytes());
        read_body(&mut r, &mut body).await.unwrap();

        let contents = body.read_to_vec().unwrap();
        assert_eq!(contents, b"Subject: t\r\n\r\n.hidden\r\nhi\r\n");

        let mut out = Vec::new();
        write_body(&mut out, &mut body).await.unwrap();
        assert_eq!(out, b"Subject: t\r\n\r\n..hidden\r\nhi\r\n.\r\n");
    }

    #[tokio::test]
    async fn body_round_trips_non_utf8_bytes() {
        let mut body = BodyHandle::new().unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(b"\xff\xfe binary\r\n");
        wire.extend_from_slice(b".\r\n");
        let mut r = BufReader::new(&wire[..]);
        read_body(&mut r, &mut body).await.unwrap();

        let contents = body.read_to_vec().unwrap();
        assert_eq!(contents, b"\xff\xfe binary\r\n");

        let mut out = Vec::new();
        write_body(&mut out, &mut body).await.unwrap();
        assert_eq!(out, b"\xff\xfe binary\r\n.\r\n");
    }
}
