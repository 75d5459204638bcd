//! Wire framing for JSON-RPC over a byte stream.
//!
//! Two dialects are spoken by stdio MCP servers:
//! - `Line`: one JSON document per `\n`-terminated line
//! - `Header`: `Content-Length: N\r\n\r\n` followed by exactly N body bytes
//!
//! [`FrameDecoder`] is incremental: bytes may arrive in any chunking, and a
//! frame is only produced once it is complete.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest body a `Content-Length` header may announce.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Line,
    Header,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Line => write!(f, "line"),
            Framing::Header => write!(f, "content-length"),
        }
    }
}

/// A single frame that could not be decoded. The decoder has already
/// skipped past it.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("header block without a valid Content-Length: {header:?}")]
    MissingContentLength { header: String },

    #[error("Content-Length {length} exceeds the {max} byte frame limit")]
    FrameTooLarge { length: u64, max: usize },

    #[error("frame is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
}

/// Encode one message for the given framing.
pub fn encode_frame(framing: Framing, message: &Value) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let frame = match framing {
        Framing::Line => {
            let mut frame = body;
            frame.push(b'\n');
            frame
        }
        Framing::Header => {
            let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
            frame.extend_from_slice(&body);
            frame
        }
    };
    Ok(frame)
}

#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Append raw bytes read from the stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next complete frame, if any. Call repeatedly until it
    /// returns `None`; errors describe a single skipped frame and decoding
    /// can continue afterwards.
    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        match self.framing {
            Framing::Line => self.next_line_frame(),
            Framing::Header => self.next_header_frame(),
        }
    }

    fn next_line_frame(&mut self) -> Option<Result<Value, FrameError>> {
        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n')?;
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            return Some(
                serde_json::from_slice(line).map_err(|source| FrameError::InvalidJson { source }),
            );
        }
    }

    fn next_header_frame(&mut self) -> Option<Result<Value, FrameError>> {
        let header_end = find_subslice(&self.buffer, HEADER_TERMINATOR)?;
        let body_start = header_end + HEADER_TERMINATOR.len();

        let header = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
        let Some(length) = parse_content_length(&header) else {
            self.buffer.drain(..body_start);
            return Some(Err(FrameError::MissingContentLength { header }));
        };
        if length > MAX_FRAME_LEN as u64 {
            self.buffer.drain(..body_start);
            return Some(Err(FrameError::FrameTooLarge {
                length,
                max: MAX_FRAME_LEN,
            }));
        }

        let body_end = body_start + length as usize;
        if self.buffer.len() < body_end {
            return None;
        }

        let frame: Vec<u8> = self.buffer.drain(..body_end).collect();
        Some(
            serde_json::from_slice(&frame[body_start..])
                .map_err(|source| FrameError::InvalidJson { source }),
        )
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &str) -> Option<u64> {
    header.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<u64>().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Result<Value, FrameError>> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    fn values(decoder: &mut FrameDecoder) -> Vec<Value> {
        drain(decoder).into_iter().filter_map(Result::ok).collect()
    }

    #[test]
    fn test_header_frame_every_split_point() {
        let frame = b"Content-Length: 7\r\n\r\n{\"a\":1}";
        let next = b"Content-Length: 7\r\n\r\n{\"b\":2}";

        for split in 0..=frame.len() {
            let mut decoder = FrameDecoder::new(Framing::Header);
            decoder.feed(&frame[..split]);
            let mut decoded = values(&mut decoder);
            decoder.feed(&frame[split..]);
            decoded.extend(values(&mut decoder));

            assert_eq!(decoded, vec![json!({"a": 1})], "split at {}", split);
            assert_eq!(decoder.buffered(), 0);

            decoder.feed(next);
            assert_eq!(values(&mut decoder), vec![json!({"b": 2})]);
        }
    }

    #[test]
    fn test_header_frame_single_byte_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"Content-Length: 7\r\n\r\n{\"a\":1}");
        stream.extend_from_slice(b"content-length:8\r\n\r\n{\"b\":22}");

        let mut decoder = FrameDecoder::new(Framing::Header);
        let mut decoded = Vec::new();
        for byte in &stream {
            decoder.feed(std::slice::from_ref(byte));
            decoded.extend(values(&mut decoder));
        }
        assert_eq!(decoded, vec![json!({"a": 1}), json!({"b": 22})]);
    }

    #[test]
    fn test_header_length_counts_utf8_bytes() {
        let message = json!({"text": "héllo ✓"});
        let frame = encode_frame(Framing::Header, &message).unwrap();
        let body_len = serde_json::to_vec(&message).unwrap().len();
        let expected_header = format!("Content-Length: {}\r\n\r\n", body_len);
        assert!(frame.starts_with(expected_header.as_bytes()));
        assert!(body_len > serde_json::to_string(&message).unwrap().chars().count());

        // Split inside the multi-byte characters.
        let mut decoder = FrameDecoder::new(Framing::Header);
        for chunk in frame.chunks(3) {
            decoder.feed(chunk);
        }
        assert_eq!(values(&mut decoder), vec![message]);
    }

    #[test]
    fn test_header_with_extra_fields() {
        let mut decoder = FrameDecoder::new(Framing::Header);
        decoder.feed(b"Content-Type: application/json\r\nCONTENT-LENGTH: 2\r\n\r\n{}");
        assert_eq!(values(&mut decoder), vec![json!({})]);
    }

    #[test]
    fn test_missing_content_length_is_skipped() {
        let mut decoder = FrameDecoder::new(Framing::Header);
        decoder.feed(b"X-Junk: 1\r\n\r\nContent-Length: 2\r\n\r\n{}");

        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FrameError::MissingContentLength { .. })));
        assert_eq!(frames[1].as_ref().unwrap(), &json!({}));
    }

    #[test]
    fn test_incomplete_body_waits() {
        let mut decoder = FrameDecoder::new(Framing::Header);
        decoder.feed(b"Content-Length: 10\r\n\r\n{\"a\":");
        assert!(decoder.next_frame().is_none());
        decoder.feed(b"100}");
        assert_eq!(values(&mut decoder), vec![json!({"a": 100})]);
    }

    #[test]
    fn test_invalid_header_body_keeps_sync() {
        let mut decoder = FrameDecoder::new(Framing::Header);
        decoder.feed(b"Content-Length: 3\r\n\r\nxyzContent-Length: 2\r\n\r\n{}");
        let frames = drain(&mut decoder);
        assert!(matches!(frames[0], Err(FrameError::InvalidJson { .. })));
        assert_eq!(frames[1].as_ref().unwrap(), &json!({}));
    }

    #[test]
    fn test_overflowing_length_is_skipped() {
        let mut decoder = FrameDecoder::new(Framing::Header);
        decoder.feed(b"Content-Length: 18446744073709551615\r\n\r\n");
        decoder.feed(b"Content-Length: 7\r\n\r\n{\"a\":1}");

        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[0],
            Err(FrameError::FrameTooLarge { length: u64::MAX, .. })
        ));
        assert_eq!(frames[1].as_ref().unwrap(), &json!({"a": 1}));
    }

    #[test]
    fn test_length_over_limit_is_skipped() {
        let mut decoder = FrameDecoder::new(Framing::Header);
        let oversized = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_LEN + 1);
        decoder.feed(oversized.as_bytes());

        // Rejected as soon as the header is complete, without waiting for a body.
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(FrameError::FrameTooLarge { .. }))
        ));
        assert!(decoder.next_frame().is_none());

        decoder.feed(b"Content-Length: 2\r\n\r\n{}");
        assert_eq!(values(&mut decoder), vec![json!({})]);
    }

    #[test]
    fn test_line_frames() {
        let mut decoder = FrameDecoder::new(Framing::Line);
        decoder.feed(b"{\"a\":1}\n\n  \r\n{\"b\"");
        assert_eq!(values(&mut decoder), vec![json!({"a": 1})]);
        decoder.feed(b":2}\r\n");
        assert_eq!(values(&mut decoder), vec![json!({"b": 2})]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_bad_line_is_dropped() {
        let mut decoder = FrameDecoder::new(Framing::Line);
        decoder.feed(b"not json\n{\"ok\":true}\n");
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1].as_ref().unwrap(), &json!({"ok": true}));
    }

    #[test]
    fn test_line_encoding() {
        let frame = encode_frame(Framing::Line, &json!({"id": 1})).unwrap();
        assert_eq!(frame, b"{\"id\":1}\n");
    }
}
