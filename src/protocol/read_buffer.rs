//! Read buffer for turning a byte stream into messages.
//!
//! Uses `bytes::BytesMut` to accumulate partial reads. Two framings are
//! accepted on the same stream, detected line by line:
//! - header block: `Content-Length: N\r\n`, other headers, a blank line,
//!   then exactly `N` payload bytes
//! - newline-delimited: a line starting with `{` is one whole message
//!
//! State machine:
//! - `Headers`: consuming header lines (remembering any `Content-Length`)
//! - `Body`: blank line seen, waiting for the remaining payload bytes
//!
//! # Example
//!
//! ```
//! use rpcwire::protocol::ReadBuffer;
//!
//! let mut buffer = ReadBuffer::new();
//! buffer.append(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
//! assert!(buffer.read_message().unwrap().is_none());
//!
//! buffer.append(b"\n").unwrap();
//! let msg = buffer.read_message().unwrap().unwrap();
//! assert_eq!(msg.method(), Some("ping"));
//! ```

use bytes::BytesMut;

use super::wire_format::DEFAULT_MAX_MESSAGE_SIZE;
use super::Message;
use crate::error::{Result, RpcError};

const CONTENT_LENGTH: &str = "content-length";

#[derive(Debug, Clone, Copy)]
enum State {
    /// Reading header lines; `content_length` is 0 until a usable one is seen.
    Headers { content_length: usize },
    /// Header block finished, payload pending.
    Body { remaining: usize },
}

/// Incremental frame decoder.
///
/// Feed bytes with [`append`](Self::append), then call
/// [`read_message`](Self::read_message) until it returns `Ok(None)`.
pub struct ReadBuffer {
    buffer: BytesMut,
    state: State,
    max_message_size: usize,
    closed: bool,
}

impl ReadBuffer {
    /// Create a read buffer with default settings (64 MiB message limit).
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a read buffer with a custom message size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::Headers { content_length: 0 },
            max_message_size,
            closed: false,
        }
    }

    /// Add raw bytes. Incomplete data stays buffered for later reads.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RpcError::BufferClosed);
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Extract the next complete message.
    ///
    /// Returns:
    /// - `Ok(Some(msg))` when a full frame was buffered
    /// - `Ok(None)` when more bytes are needed
    /// - `Err(..)` when a frame was malformed; its bytes are discarded so the
    ///   next call continues with whatever follows
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        if self.closed {
            return Err(RpcError::BufferClosed);
        }

        loop {
            match self.state {
                State::Headers { content_length } => {
                    let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                        if self.buffer.len() > self.max_message_size {
                            let len = self.buffer.len();
                            self.buffer.clear();
                            return Err(RpcError::Parse(format!(
                                "line of {len} bytes exceeds maximum {}",
                                self.max_message_size
                            )));
                        }
                        return Ok(None);
                    };

                    let line = self.buffer.split_to(newline + 1);
                    let text = trim_line(&line);

                    if text.is_empty() {
                        if content_length > 0 {
                            self.state = State::Body {
                                remaining: content_length,
                            };
                        }
                        continue;
                    }

                    if text[0] == b'{' {
                        self.state = State::Headers { content_length: 0 };
                        return Message::decode(text).map(Some);
                    }

                    if let Some(length) = self.parse_header(text)? {
                        self.state = State::Headers {
                            content_length: length,
                        };
                    }
                }

                State::Body { remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::Headers { content_length: 0 };
                    return Message::decode(&payload).map(Some);
                }
            }
        }
    }

    /// Drain every complete message currently buffered.
    ///
    /// Malformed frames are returned in place as `Err` entries so the caller
    /// can report them and keep going.
    pub fn drain(&mut self) -> Vec<Result<Message>> {
        let mut out = Vec::new();
        loop {
            match self.read_message() {
                Ok(Some(msg)) => out.push(Ok(msg)),
                Ok(None) => break,
                Err(RpcError::BufferClosed) => {
                    out.push(Err(RpcError::BufferClosed));
                    break;
                }
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Returns the `Content-Length` value, or `None` for a header to skip.
    fn parse_header(&mut self, line: &[u8]) -> Result<Option<usize>> {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            tracing::debug!("Skipping malformed header line");
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&line[..colon]);
        if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            // Content-Type and friends
            return Ok(None);
        }

        let value = String::from_utf8_lossy(&line[colon + 1..]);
        let length: usize = value.trim().parse().map_err(|_| {
            self.state = State::Headers { content_length: 0 };
            RpcError::Parse(format!("invalid Content-Length: {}", value.trim()))
        })?;

        if length == 0 {
            tracing::debug!("Skipping Content-Length: 0 header");
            return Ok(None);
        }
        if length > self.max_message_size {
            self.state = State::Headers { content_length: 0 };
            return Err(RpcError::Parse(format!(
                "Content-Length {length} exceeds maximum {}",
                self.max_message_size
            )));
        }
        Ok(Some(length))
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard buffered bytes and partial state. The buffer stays usable.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Headers { content_length: 0 };
    }

    /// Release the buffer; every later call fails with `BufferClosed`.
    pub fn close(&mut self) {
        self.buffer = BytesMut::new();
        self.state = State::Headers { content_length: 0 };
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::Headers { .. } => "Headers",
            State::Body { .. } => "Body",
        }
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the line terminator and surrounding ASCII whitespace.
fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    const PING: &[u8] = br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut bytes = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_newline_needs_terminator() {
        let mut buffer = ReadBuffer::new();
        buffer.append(PING).unwrap();
        assert!(buffer.read_message().unwrap().is_none());

        buffer.append(b"\n").unwrap();
        let msg = buffer.read_message().unwrap().unwrap();
        assert_eq!(msg.method(), Some("ping"));
        assert_eq!(msg.id(), Some(RequestId(1)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_header_framed_message() {
        let mut buffer = ReadBuffer::new();
        buffer.append(&framed(PING)).unwrap();

        let msg = buffer.read_message().unwrap().unwrap();
        assert_eq!(msg.method(), Some("ping"));
        assert!(buffer.read_message().unwrap().is_none());
    }

    #[test]
    fn test_split_mid_payload() {
        let mut buffer = ReadBuffer::new();
        let bytes = framed(PING);
        let split = bytes.len() - 10;

        buffer.append(&bytes[..split]).unwrap();
        assert!(buffer.read_message().unwrap().is_none());
        assert_eq!(buffer.state_name(), "Body");

        buffer.append(&bytes[split..]).unwrap();
        assert!(buffer.read_message().unwrap().is_some());
        assert!(buffer.read_message().unwrap().is_none());
    }

    #[test]
    fn test_split_mid_header() {
        let mut buffer = ReadBuffer::new();
        let bytes = framed(PING);

        buffer.append(&bytes[..8]).unwrap();
        assert!(buffer.read_message().unwrap().is_none());
        assert_eq!(buffer.state_name(), "Headers");

        buffer.append(&bytes[8..]).unwrap();
        assert!(buffer.read_message().unwrap().is_some());
    }

    #[test]
    fn test_unknown_headers_skipped() {
        let mut buffer = ReadBuffer::new();
        let mut bytes =
            b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nX-Whatever: 1\r\n".to_vec();
        bytes.extend(format!("Content-Length: {}\r\n\r\n", PING.len()).into_bytes());
        bytes.extend_from_slice(PING);
        buffer.append(&bytes).unwrap();

        assert!(buffer.read_message().unwrap().is_some());
    }

    #[test]
    fn test_zero_content_length_skipped() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"Content-Length: 0\r\n\r\n").unwrap();
        assert!(buffer.read_message().unwrap().is_none());

        buffer.append(PING).unwrap();
        buffer.append(b"\n").unwrap();
        assert_eq!(
            buffer.read_message().unwrap().unwrap().method(),
            Some("ping")
        );
    }

    #[test]
    fn test_mixed_framings_in_one_chunk() {
        let mut buffer = ReadBuffer::new();
        let mut bytes = PING.to_vec();
        bytes.push(b'\n');
        bytes.extend(framed(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#));
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(br#"{"jsonrpc":"2.0","id":2,"result":{}}"#);
        bytes.push(b'\n');
        buffer.append(&bytes).unwrap();

        let kinds: Vec<_> = buffer
            .drain()
            .into_iter()
            .map(|m| m.unwrap().kind())
            .collect();
        assert_eq!(kinds, vec!["request", "notification", "response"]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = ReadBuffer::new();
        let bytes = framed(PING);
        let mut found = Vec::new();

        for byte in &bytes {
            buffer.append(&[*byte]).unwrap();
            while let Some(msg) = buffer.read_message().unwrap() {
                found.push(msg);
            }
        }

        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_bad_message_dropped_stream_continues() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"{not json}\n").unwrap();
        buffer.append(PING).unwrap();
        buffer.append(b"\n").unwrap();

        assert!(matches!(buffer.read_message(), Err(RpcError::Parse(_))));
        assert!(buffer.read_message().unwrap().is_some());
    }

    #[test]
    fn test_invalid_content_length() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"Content-Length: abc\r\n").unwrap();
        assert!(matches!(buffer.read_message(), Err(RpcError::Parse(_))));
        assert_eq!(buffer.state_name(), "Headers");
    }

    #[test]
    fn test_max_message_size() {
        let mut buffer = ReadBuffer::with_max_message_size(16);
        buffer.append(b"Content-Length: 1000\r\n\r\n").unwrap();
        let err = buffer.read_message().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));

        let mut buffer = ReadBuffer::with_max_message_size(16);
        buffer.append(&[b'x'; 32]).unwrap();
        assert!(buffer.read_message().is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_then_reuse() {
        let mut buffer = ReadBuffer::new();
        let bytes = framed(PING);
        buffer.append(&bytes[..bytes.len() - 3]).unwrap();
        assert!(buffer.read_message().unwrap().is_none());

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.state_name(), "Headers");

        buffer.append(&framed(PING)).unwrap();
        assert_eq!(
            buffer.read_message().unwrap().unwrap().method(),
            Some("ping")
        );
    }

    #[test]
    fn test_close_rejects_further_use() {
        let mut buffer = ReadBuffer::new();
        buffer.close();
        assert!(buffer.is_closed());
        assert!(matches!(buffer.append(PING), Err(RpcError::BufferClosed)));
        assert!(matches!(buffer.read_message(), Err(RpcError::BufferClosed)));
    }
}
