//! Wire framing: `PURPOSE SP LENGTH SP <payload bytes> LF`.
//!
//! `PURPOSE` is an ASCII token (no whitespace), `LENGTH` the ASCII decimal
//! byte count of the payload, and the frame ends with a single `\n` directly
//! after the payload.  The payload itself is opaque to this layer.
//!
//! [`FrameParser`] is a streaming parser: feed it arbitrary byte chunks and
//! drain complete frames as they become available.  TCP segmentation must
//! never break decoding, so the parser keeps a residual buffer between
//! calls.  UDP datagrams carry exactly one frame; use [`decode_datagram`].

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Upper bound on `PURPOSE SP LENGTH SP`.  A stream that produces this much
/// data without a complete header is not speaking the protocol.
const MAX_HEADER_LEN: usize = 128;

/// Upper bound on a declared payload length (16 MiB).
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One protocol unit on the wire: a purpose token plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub purpose: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(purpose: impl Into<String>, payload: Vec<u8>) -> Self {
        Frame {
            purpose: purpose.into(),
            payload,
        }
    }

    /// Serialize the frame into its on-wire byte form.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!("{} {} ", self.purpose, self.payload.len());
        let mut out = Vec::with_capacity(header.len() + self.payload.len() + 1);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out.push(b'\n');
        out
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Malformed-frame conditions.  Any of these means the connection that
/// produced the bytes should be closed.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame header ended before both fields were present")]
    TruncatedHeader,
    #[error("no complete header within {MAX_HEADER_LEN} bytes")]
    HeaderTooLong,
    #[error("empty purpose token")]
    EmptyPurpose,
    #[error("purpose token contains non-ASCII or whitespace bytes")]
    InvalidPurpose,
    #[error("invalid length field: {0:?}")]
    InvalidLength(String),
    #[error("declared payload length {0} exceeds the {MAX_PAYLOAD_LEN} byte cap")]
    PayloadTooLarge(usize),
    #[error("payload is not terminated by a newline")]
    MissingTerminator,
    #[error("datagram carries trailing bytes after the frame")]
    TrailingBytes,
    #[error("datagram does not contain a complete frame")]
    Incomplete,
}

// ---------------------------------------------------------------------------
// Streaming parser
// ---------------------------------------------------------------------------

/// Incremental frame parser with a residual buffer.
///
/// Call [`feed`](FrameParser::feed) with each received chunk, then drain
/// frames with [`next_frame`](FrameParser::next_frame) until it yields
/// `Ok(None)`.  An `Err` is unrecoverable for the stream.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes to the residual buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn residual_len(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode one complete frame from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(first_space) = find_byte(&self.buf, b' ', 0) else {
            return self.incomplete_header();
        };

        let purpose = &self.buf[..first_space];
        if purpose.is_empty() {
            return Err(FrameError::EmptyPurpose);
        }
        if !purpose.iter().all(u8::is_ascii_graphic) {
            return Err(FrameError::InvalidPurpose);
        }

        let Some(second_space) = find_byte(&self.buf, b' ', first_space + 1) else {
            return self.incomplete_header();
        };
        if second_space > MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLong);
        }

        let length_field = &self.buf[first_space + 1..second_space];
        let length = parse_length(length_field)?;
        if length > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(length));
        }

        // Header is valid; wait for payload + terminator.
        let payload_start = second_space + 1;
        let frame_len = payload_start + length + 1;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        if self.buf[payload_start + length] != b'\n' {
            return Err(FrameError::MissingTerminator);
        }

        let purpose = String::from_utf8_lossy(&self.buf[..first_space]).into_owned();
        let payload = self.buf[payload_start..payload_start + length].to_vec();
        self.buf.advance(frame_len);
        Ok(Some(Frame { purpose, payload }))
    }

    /// Drain every complete frame currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    // Header incomplete: decide between "wait for more" and "malformed".
    // Nothing is consumed yet, so the whole buffer is header prefix.
    fn incomplete_header(&self) -> Result<Option<Frame>, FrameError> {
        if find_byte(&self.buf, b'\n', 0).is_some() {
            // A terminator arrived before both header fields did.
            return Err(FrameError::TruncatedHeader);
        }
        if self.buf.len() > MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLong);
        }
        Ok(None)
    }
}

/// Decode a UDP datagram that must contain exactly one frame.
pub fn decode_datagram(datagram: &[u8]) -> Result<Frame, FrameError> {
    let mut parser = FrameParser::new();
    parser.feed(datagram);
    match parser.next_frame()? {
        Some(frame) if parser.residual_len() == 0 => Ok(frame),
        Some(_) => Err(FrameError::TrailingBytes),
        None => Err(FrameError::Incomplete),
    }
}

fn find_byte(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| i + from)
}

fn parse_length(field: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(field)
        .map_err(|_| FrameError::InvalidLength(String::from_utf8_lossy(field).into_owned()))?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::InvalidLength(text.to_owned()));
    }
    text.parse()
        .map_err(|_| FrameError::InvalidLength(text.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(purpose: &str, payload: &[u8]) -> Frame {
        Frame::new(purpose, payload.to_vec())
    }

    #[test]
    fn encode_matches_wire_format() {
        let encoded = frame("PING", b"").encode();
        assert_eq!(encoded, b"PING 0 \n");

        let encoded = frame("MESSAGE", b"{\"a\":1}").encode();
        assert_eq!(encoded, b"MESSAGE 7 {\"a\":1}\n");
    }

    #[test]
    fn roundtrip_single_frame() {
        let original = frame("SERVER_ANNOUNCE", b"payload bytes");
        let mut parser = FrameParser::new();
        parser.feed(&original.encode());

        let decoded = parser.next_frame().expect("parse").expect("one frame");
        assert_eq!(decoded, original);
        assert_eq!(parser.residual_len(), 0);
    }

    #[test]
    fn payload_may_contain_newlines_and_spaces() {
        let original = frame("MESSAGE", b"line one\nline two with spaces\n");
        let mut parser = FrameParser::new();
        parser.feed(&original.encode());
        let decoded = parser.next_frame().expect("parse").expect("one frame");
        assert_eq!(decoded, original);
    }

    #[test]
    fn concatenated_frames_fed_in_arbitrary_chunks() {
        let frames = vec![
            frame("PING", b""),
            frame("MESSAGE", b"hello \n world"),
            frame("PONG", b""),
            frame("SEARCH_USERS", br#"{"query":"a","handle":9}"#),
        ];
        let mut stream = Vec::new();
        for f in &frames {
            stream.extend_from_slice(&f.encode());
        }

        // Feed in every chunk size from 1 byte upwards; the parser must
        // produce the identical sequence each time.
        for chunk_size in 1..=stream.len() {
            let mut parser = FrameParser::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                parser.feed(chunk);
                decoded.extend(parser.drain().expect("no malformed frames"));
            }
            assert_eq!(decoded, frames, "chunk size {chunk_size}");
            assert_eq!(parser.residual_len(), 0, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn partial_frame_is_retained_until_completed() {
        let encoded = frame("MESSAGE", b"0123456789").encode();
        let (head, tail) = encoded.split_at(6);

        let mut parser = FrameParser::new();
        parser.feed(head);
        assert!(parser.next_frame().expect("incomplete is fine").is_none());

        parser.feed(tail);
        let decoded = parser.next_frame().expect("parse").expect("one frame");
        assert_eq!(decoded.payload, b"0123456789");
    }

    #[test]
    fn missing_terminator_is_malformed() {
        let mut bad = frame("PING", b"").encode();
        *bad.last_mut().expect("non-empty") = b'X';
        bad.extend_from_slice(b"PONG 0 \n");

        let mut parser = FrameParser::new();
        parser.feed(&bad);
        assert!(matches!(
            parser.next_frame(),
            Err(FrameError::MissingTerminator)
        ));
    }

    #[test]
    fn newline_before_header_fields_is_malformed() {
        let mut parser = FrameParser::new();
        parser.feed(b"GARBAGE\n");
        assert!(matches!(
            parser.next_frame(),
            Err(FrameError::TruncatedHeader)
        ));

        let mut parser = FrameParser::new();
        parser.feed(b"PURPOSE_ONLY \n");
        assert!(matches!(
            parser.next_frame(),
            Err(FrameError::TruncatedHeader)
        ));
    }

    #[test]
    fn non_numeric_length_is_malformed() {
        let mut parser = FrameParser::new();
        parser.feed(b"PING abc \n");
        assert!(matches!(
            parser.next_frame(),
            Err(FrameError::InvalidLength(_))
        ));
    }

    #[test]
    fn unbounded_garbage_is_rejected() {
        let mut parser = FrameParser::new();
        parser.feed(&vec![b'x'; MAX_HEADER_LEN + 1]);
        assert!(matches!(parser.next_frame(), Err(FrameError::HeaderTooLong)));
    }

    #[test]
    fn oversized_payload_declaration_is_rejected() {
        let mut parser = FrameParser::new();
        parser.feed(b"MESSAGE 99999999999 ");
        assert!(matches!(
            parser.next_frame(),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn datagram_decoding_requires_exactly_one_frame() {
        let one = frame("DISCOVER_SERVER", b"");
        assert_eq!(decode_datagram(&one.encode()).expect("single frame"), one);

        let mut two = one.encode();
        two.extend_from_slice(&one.encode());
        assert!(matches!(
            decode_datagram(&two),
            Err(FrameError::TrailingBytes)
        ));

        assert!(matches!(
            decode_datagram(b"DISCOVER_SERVER 0 "),
            Err(FrameError::Incomplete)
        ));
    }
}
