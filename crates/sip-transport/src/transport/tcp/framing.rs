//! Splits a SIP byte stream into individual messages.
//!
//! Framing only looks at the blank line ending the header block and at the
//! `Content-Length` header (long or compact form). Everything else about the
//! message is left to the signaling engine.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest header block accepted before the connection is considered broken
pub const MAX_HEADER_SIZE: usize = 64 * 1024;
/// Largest body accepted on a stream connection
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const HEADER_SEARCH_LIMIT: usize = MAX_HEADER_SIZE + HEADER_TERMINATOR.len();

/// Incremental message framer for stream transports
#[derive(Debug)]
pub struct StreamFramer {
    buffer: BytesMut,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Buffer the reader appends to
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Appends received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered, not yet framed bytes
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete message, `Ok(None)` if more bytes are needed
    pub fn next_message(&mut self) -> Result<Option<Bytes>> {
        // CRLF keep-alives between messages (RFC 5626)
        while self.buffer.starts_with(b"\r\n") {
            self.buffer.advance(2);
        }

        // The terminator of an acceptable header block lies within this window
        let window = self.buffer.len().min(HEADER_SEARCH_LIMIT);
        let header_end = match find_header_end(&self.buffer[..window]) {
            Some(end) if end <= MAX_HEADER_SIZE => end,
            None if self.buffer.len() < HEADER_SEARCH_LIMIT => return Ok(None),
            _ => {
                return Err(Error::framing(format!(
                    "header block exceeds {} bytes",
                    MAX_HEADER_SIZE
                )));
            }
        };

        let body_len = content_length(&self.buffer[..header_end])?;
        if body_len > MAX_BODY_SIZE {
            return Err(Error::framing(format!(
                "Content-Length {} exceeds {} bytes",
                body_len, MAX_BODY_SIZE
            )));
        }

        let total = header_end + HEADER_TERMINATOR.len() + body_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        Ok(Some(self.buffer.split_to(total).freeze()))
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

// Missing Content-Length means an empty body
fn content_length(headers: &[u8]) -> Result<usize> {
    for line in headers.split(|b| *b == b'\n').skip(1) {
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        let name = line[..colon].trim_ascii();
        if !(name.eq_ignore_ascii_case(b"content-length") || name.eq_ignore_ascii_case(b"l")) {
            continue;
        }

        let value = std::str::from_utf8(line[colon + 1..].trim_ascii())
            .map_err(|_| Error::framing("Content-Length is not valid UTF-8"))?;
        return value
            .parse::<usize>()
            .map_err(|_| Error::framing(format!("invalid Content-Length '{}'", value)));
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 192.168.1.64:5060;branch=z9hG4bK1\r\n\
        Content-Length: 5\r\n\r\nhello";

    #[test]
    fn test_single_message() {
        let mut framer = StreamFramer::new();
        framer.extend(REGISTER.as_bytes());
        let message = framer.next_message().unwrap().unwrap();
        assert_eq!(&message[..], REGISTER.as_bytes());
        assert_eq!(framer.pending(), 0);
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn test_partial_body_waits_for_more_bytes() {
        let mut framer = StreamFramer::new();
        let (head, tail) = REGISTER.split_at(REGISTER.len() - 3);
        framer.extend(head.as_bytes());
        assert!(framer.next_message().unwrap().is_none());
        framer.extend(tail.as_bytes());
        assert!(framer.next_message().unwrap().is_some());
    }

    #[test]
    fn test_pipelined_messages_and_keep_alives() {
        let mut framer = StreamFramer::new();
        framer.extend(b"\r\n\r\n");
        framer.extend(REGISTER.as_bytes());
        framer.extend(b"\r\n");
        framer.extend(REGISTER.as_bytes());

        assert!(framer.next_message().unwrap().is_some());
        assert!(framer.next_message().unwrap().is_some());
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn test_compact_content_length_and_missing_length() {
        let mut framer = StreamFramer::new();
        framer.extend(b"MESSAGE sip:a@b SIP/2.0\r\nl: 2\r\n\r\nokOPTIONS sip:a@b SIP/2.0\r\n\r\n");
        let first = framer.next_message().unwrap().unwrap();
        assert!(first.ends_with(b"ok"));
        let second = framer.next_message().unwrap().unwrap();
        assert!(second.starts_with(b"OPTIONS"));
    }

    #[test]
    fn test_invalid_content_length() {
        let mut framer = StreamFramer::new();
        framer.extend(b"INVITE sip:a@b SIP/2.0\r\nContent-Length: abc\r\n\r\n");
        assert!(matches!(framer.next_message(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_oversized_header_block() {
        let mut framer = StreamFramer::new();
        framer.extend(&vec![b'a'; MAX_HEADER_SIZE + 3]);
        assert!(framer.next_message().unwrap().is_none());
        framer.extend(b"a");
        assert!(matches!(framer.next_message(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_oversized_header_block_with_terminator() {
        let mut framer = StreamFramer::new();
        let mut message = b"REGISTER sip:3402000000 SIP/2.0\r\n".to_vec();
        while message.len() <= MAX_HEADER_SIZE {
            message.extend_from_slice(b"X-Padding: 0123456789abcdef0123456789abcdef\r\n");
        }
        message.extend_from_slice(b"Content-Length: 0\r\n\r\n");

        framer.extend(&message);
        assert!(matches!(framer.next_message(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_header_block_at_limit_is_accepted() {
        let mut framer = StreamFramer::new();
        let mut message = b"OPTIONS sip:3402000000 SIP/2.0\r\nContent-Length: 0\r\nX-Padding: ".to_vec();
        message.resize(MAX_HEADER_SIZE, b'a');
        message.extend_from_slice(b"\r\n\r\n");

        framer.extend(&message);
        let framed = framer.next_message().unwrap().unwrap();
        assert_eq!(framed.len(), MAX_HEADER_SIZE + 4);
    }
}
