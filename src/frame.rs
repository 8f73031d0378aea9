//! The 5-byte-prefixed message frame (spec §3 "Frame", §4.1) and a streaming
//! parser that tolerates arbitrarily chunked or coalesced input.
//!
//! Wire form: `[compressed: u8][len: u32 big-endian][payload: len bytes]`.
//! This mirrors the framing `hotaru_grpc::transport::GrpcMessage` implements
//! over a single in-memory buffer; the difference here is that `Parser`
//! keeps its state across calls so it can be fed one byte at a time.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FrameError;

/// Size of the frame header: 1 compression-flag byte + 4 big-endian length
/// bytes.
pub const HEADER_LEN: usize = 5;

/// One fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub compressed: bool,
    pub payload: Bytes,
}

/// Encodes one application message into a framed wire chunk.
///
/// Fails if `payload.len()` does not fit in a `u32`.
pub fn encode(payload: &[u8], compressed: bool) -> Result<Bytes, FrameError> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge { len: payload.len() });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&[compressed as u8]);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Parses a 5-byte frame header. `header` must be at least `HEADER_LEN`
/// bytes; only the first 5 are inspected.
pub fn parse_header(header: &[u8]) -> Result<(bool, u32), FrameError> {
    if header.len() < HEADER_LEN {
        return Err(FrameError::HeaderTruncated { available: header.len() });
    }
    let compressed = header[0] != 0;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    Ok((compressed, len))
}

#[derive(Debug, Clone, Copy)]
enum ParserState {
    ReadHeader,
    ReadBody { compressed: bool, len: usize },
}

/// Per-stream framer state on the receive side (spec §3 "ParserState").
///
/// Feed it arbitrarily sized, arbitrarily split byte chunks; it emits
/// exactly one [`DecodedFrame`] per fully-received frame, in order, and
/// carries partial frames across calls. `feed(A)` followed by `feed(B)`
/// yields the same frames, in the same order, as a single `feed(A ++ B)`.
#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    state: ParserState,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), state: ParserState::ReadHeader }
    }

    /// Appends `chunk` to the internal buffer and extracts every complete
    /// frame now available. Returns the frames in receive order; an empty
    /// vec means `chunk` only completed a partial header or body.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            match self.state {
                ParserState::ReadHeader => {
                    if self.buf.len() < HEADER_LEN {
                        break;
                    }
                    // parse_header cannot fail here: we just checked the length.
                    let (compressed, len) = parse_header(&self.buf[..HEADER_LEN])
                        .expect("header length was checked above");
                    self.buf.advance(HEADER_LEN);
                    self.state = ParserState::ReadBody { compressed, len: len as usize };
                }
                ParserState::ReadBody { compressed, len } => {
                    if self.buf.len() < len {
                        break;
                    }
                    let payload = self.buf.split_to(len).freeze();
                    out.push(DecodedFrame { compressed, payload });
                    self.state = ParserState::ReadHeader;
                }
            }
        }
        out
    }

    /// True if there is no partially-buffered frame (a fresh parser, or one
    /// that just finished a frame exactly on a chunk boundary).
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ParserState::ReadHeader) && self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn encode_decode_header_round_trip() {
        let frame = encode(b"hello", false).unwrap();
        let (compressed, len) = parse_header(&frame[..HEADER_LEN]).unwrap();
        assert!(!compressed);
        assert_eq!(len as usize, 5);
        assert_eq!(&frame[HEADER_LEN..], b"hello");
    }

    #[test]
    fn parse_header_rejects_short_input() {
        assert!(matches!(
            parse_header(&[1, 2, 3]),
            Err(FrameError::HeaderTruncated { available: 3 })
        ));
    }

    #[test]
    fn parser_reassembles_byte_at_a_time() {
        let frame = encode(b"split across many chunks", true).unwrap();
        let mut parser = Parser::new();
        let mut out = Vec::new();
        for byte in frame.iter() {
            out.extend(parser.feed(&[*byte]));
        }
        assert_eq!(out.len(), 1);
        assert!(out[0].compressed);
        assert_eq!(&out[0].payload[..], b"split across many chunks");
        assert!(parser.is_idle());
    }

    #[test]
    fn parser_splits_coalesced_frames() {
        let mut combined = BytesMut::new();
        for i in 0..10u8 {
            combined.extend_from_slice(&encode(&[i; 4], false).unwrap());
        }
        let mut parser = Parser::new();
        let out = parser.feed(&combined);
        assert_eq!(out.len(), 10);
        for (i, frame) in out.iter().enumerate() {
            assert_eq!(&frame.payload[..], &[i as u8; 4]);
        }
    }

    #[quickcheck]
    fn round_trip_preserves_payload(payload: Vec<u8>) -> bool {
        let frame = encode(&payload, false).unwrap();
        let mut parser = Parser::new();
        let out = parser.feed(&frame);
        out.len() == 1 && !out[0].compressed && out[0].payload[..] == payload[..]
    }

    #[quickcheck]
    fn feed_is_associative(a: Vec<u8>, b: Vec<u8>, c: Vec<u8>) -> bool {
        let frames: Vec<Bytes> = [&a, &b, &c]
            .iter()
            .map(|p| encode(p, false).unwrap())
            .collect();

        let mut combined = BytesMut::new();
        for f in &frames {
            combined.extend_from_slice(f);
        }

        let mut whole = Parser::new();
        let whole_out = whole.feed(&combined);

        let mut split = Parser::new();
        let mid = combined.len() / 2;
        let mut split_out = split.feed(&combined[..mid]);
        split_out.extend(split.feed(&combined[mid..]));

        whole_out == split_out
    }
}
