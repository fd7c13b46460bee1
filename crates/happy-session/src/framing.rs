//! JSON-RPC message framing for the permission tool server's stdio transport.
//!
//! Two framings are accepted on input:
//!
//! - **Content-Length**: `Content-Length: N\r\n\r\n<N bytes>`
//! - **Newline-delimited**: one JSON object per `\n`-terminated line
//!
//! [`FrameReader`] detects the framing per message and reports it, so replies
//! go back in the framing the peer used.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire framing of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength,
    NewlineDelimited,
}

/// Upper bound on one message body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_HEADER: &str = "content-length:";
const READ_CHUNK: usize = 8 * 1024;

/// Reads framed JSON messages from an async reader.
///
/// Bytes are accumulated in an internal buffer and a message is only removed
/// from it once complete, so [`FrameReader::next_message`] may be dropped at
/// any `.await` (for example as a `tokio::select!` branch) without losing
/// input.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

/// What the buffer head holds right now.
enum Parsed {
    Message(String, Framing),
    Incomplete,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    /// Read the next message and its framing, returning `None` on EOF.
    ///
    /// Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails, a Content-Length header is
    /// malformed or oversized, a message is not UTF-8, or the stream ends
    /// inside a Content-Length frame.
    pub async fn next_message(&mut self) -> io::Result<Option<(String, Framing)>> {
        loop {
            if let Parsed::Message(msg, framing) = self.parse_buffered()? {
                return Ok(Some((msg, framing)));
            }
            if self.eof {
                return self.drain_at_eof();
            }
            self.buf.reserve(READ_CHUNK);
            // `read_buf` either appends to `buf` or, when cancelled, leaves it
            // untouched.
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }

    fn parse_buffered(&mut self) -> io::Result<Parsed> {
        loop {
            let Some(line_end) = find_newline(&self.buf, 0) else {
                if self.buf.len() > MAX_FRAME_LEN {
                    return Err(invalid_data(format!(
                        "unterminated line of {} bytes exceeds limit",
                        self.buf.len()
                    )));
                }
                return Ok(Parsed::Incomplete);
            };
            let line = std::str::from_utf8(&self.buf[..line_end])
                .map_err(invalid_data)?
                .trim();

            if line.is_empty() {
                self.buf.drain(..=line_end);
                continue;
            }

            let Some(len) = content_length(line)? else {
                let msg = line.to_string();
                self.buf.drain(..=line_end);
                return Ok(Parsed::Message(msg, Framing::NewlineDelimited));
            };

            let Some(body_start) = end_of_headers(&self.buf, line_end + 1) else {
                return Ok(Parsed::Incomplete);
            };
            let body_end = body_start + len;
            if self.buf.len() < body_end {
                return Ok(Parsed::Incomplete);
            }
            let body: Vec<u8> = self.buf.drain(..body_end).skip(body_start).collect();
            let msg = String::from_utf8(body).map_err(invalid_data)?;
            return Ok(Parsed::Message(msg, Framing::ContentLength));
        }
    }

    /// Hand out an unterminated final line, or fail on a cut-off frame.
    fn drain_at_eof(&mut self) -> io::Result<Option<(String, Framing)>> {
        let rest = std::mem::take(&mut self.buf);
        let text = std::str::from_utf8(&rest).map_err(invalid_data)?.trim();
        if text.is_empty() {
            return Ok(None);
        }
        if is_length_header(text) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a Content-Length frame",
            ));
        }
        Ok(Some((text.to_string(), Framing::NewlineDelimited)))
    }
}

fn find_newline(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == b'\n').map(|i| from + i)
}

fn is_length_header(line: &str) -> bool {
    line.get(..LENGTH_HEADER.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(LENGTH_HEADER))
}

/// Body length announced by `line`, or `None` when it is not a length header.
fn content_length(line: &str) -> io::Result<Option<usize>> {
    if !is_length_header(line) {
        return Ok(None);
    }
    let len: usize = line[LENGTH_HEADER.len()..]
        .trim()
        .parse()
        .map_err(invalid_data)?;
    if len > MAX_FRAME_LEN {
        return Err(invalid_data(format!("frame of {len} bytes exceeds limit")));
    }
    Ok(Some(len))
}

/// Offset just past the blank line that ends the header block starting at
/// `from`, once it has been buffered.
fn end_of_headers(buf: &[u8], mut from: usize) -> Option<usize> {
    loop {
        let end = find_newline(buf, from)?;
        if buf[from..end].iter().all(u8::is_ascii_whitespace) {
            return Some(end + 1);
        }
        from = end + 1;
    }
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Write `json` to `writer` in the given framing and flush.
///
/// For newline framing `json` must not contain embedded newlines (compact
/// `serde_json` output never does).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    json: &str,
    framing: Framing,
) -> io::Result<()> {
    let mut frame = Vec::with_capacity(json.len() + 32);
    match framing {
        Framing::ContentLength => {
            frame.extend_from_slice(format!("Content-Length: {}\r\n\r\n", json.len()).as_bytes());
            frame.extend_from_slice(json.as_bytes());
        }
        Framing::NewlineDelimited => {
            frame.extend_from_slice(json.as_bytes());
            frame.push(b'\n');
        }
    }
    writer.write_all(&frame).await?;
    writer.flush().await
}
