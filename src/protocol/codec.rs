// src/protocol/codec.rs
//! Newline-delimited JSON frame codec
//!
//! Bytes are buffered until a `\n` arrives; each complete line is decoded as
//! one [`Frame`]. A bad line yields [`Decoded::Malformed`] and decoding resumes
//! at the next line, so a single corrupt frame never desynchronizes the
//! stream. Lines longer than the configured limit are dropped up to the next
//! newline.
//!
//! The same state machine backs both [`FrameCodec::feed`] (push-style, owns
//! its buffer) and the tokio-util [`Decoder`] impl used with `FramedRead`.

use crate::protocol::frame::Frame;
use crate::utils::errors::PoolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default longest accepted line (8 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const SNIPPET_LEN: usize = 120;

/// A line that could not be turned into a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid JSON frame ({error}): {snippet}")]
    InvalidJson { error: String, snippet: String },

    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },

    #[error("stream ended inside a frame ({len} bytes pending)")]
    Truncated { len: usize },
}

/// One decoding result
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    Malformed(FrameError),
}

impl Decoded {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Decoded::Frame(frame) => Some(frame),
            Decoded::Malformed(_) => None,
        }
    }
}

/// Frame codec with cross-read buffering
#[derive(Debug)]
pub struct FrameCodec {
    /// Longest accepted line, newline excluded
    max_frame_bytes: usize,

    /// Offset already scanned for a newline
    next_index: usize,

    /// Dropping bytes of an oversized line until its newline
    discarding: bool,

    /// Pending bytes for `feed`
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            next_index: 0,
            discarding: false,
            buffer: BytesMut::new(),
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Append raw bytes and return every frame completed by them.
    ///
    /// Bytes after the last newline stay buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Some(decoded) = self.decode_line(&mut buffer) {
            out.push(decoded);
        }

        self.buffer = buffer;
        out
    }

    /// Bytes currently waiting for a newline in the `feed` buffer
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Serialize one frame as a single newline-terminated line
    pub fn encode_frame(frame: &Frame) -> Result<Bytes, PoolError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Option<Decoded> {
        loop {
            if self.discarding {
                match src.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.discarding = false;
                        self.next_index = 0;
                        continue;
                    }
                    None => {
                        src.clear();
                        return None;
                    }
                }
            }

            let read_to = cmp::min(self.max_frame_bytes.saturating_add(1), src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match newline {
                Some(offset) => {
                    let idx = self.next_index + offset;
                    self.next_index = 0;
                    let line = src.split_to(idx + 1);
                    let mut line = &line[..idx];
                    if line.last() == Some(&b'\r') {
                        line = &line[..line.len() - 1];
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(parse_line(line));
                }
                None if src.len() > self.max_frame_bytes => {
                    self.next_index = 0;
                    match src[read_to..].iter().position(|b| *b == b'\n') {
                        Some(pos) => src.advance(read_to + pos + 1),
                        None => {
                            src.clear();
                            self.discarding = true;
                        }
                    }
                    return Some(Decoded::Malformed(FrameError::Oversized {
                        limit: self.max_frame_bytes,
                    }));
                }
                None => {
                    self.next_index = read_to;
                    return None;
                }
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &[u8]) -> Decoded {
    match serde_json::from_slice::<Frame>(line) {
        Ok(frame) => Decoded::Frame(frame),
        Err(e) => {
            let end = cmp::min(line.len(), SNIPPET_LEN);
            Decoded::Malformed(FrameError::InvalidJson {
                error: e.to_string(),
                snippet: String::from_utf8_lossy(&line[..end]).into_owned(),
            })
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = PoolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, PoolError> {
        Ok(self.decode_line(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, PoolError> {
        if let Some(decoded) = self.decode_line(src) {
            return Ok(Some(decoded));
        }
        if self.discarding {
            src.clear();
            self.discarding = false;
            return Ok(None);
        }
        if src.is_empty() || src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        let len = src.len();
        src.clear();
        self.next_index = 0;
        Ok(Some(Decoded::Malformed(FrameError::Truncated { len })))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PoolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), PoolError> {
        let line = FrameCodec::encode_frame(&frame)?;
        dst.reserve(line.len());
        dst.put(line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::RequestId;
    use proptest::prelude::*;
    use serde_json::json;

    fn frames(decoded: Vec<Decoded>) -> Vec<Frame> {
        decoded.into_iter().filter_map(Decoded::into_frame).collect()
    }

    fn sample_stream() -> (Vec<Frame>, Vec<u8>) {
        let id = RequestId::from("req-1");
        let frames = vec![
            Frame::message(id.clone(), json!({"text": "first\nline"})),
            Frame::message(id.clone(), json!({"text": "ünïcödé ✓"})),
            Frame::healthcheck(3),
            Frame::complete(id, json!({"ok": true})),
        ];
        let mut bytes = Vec::new();
        for frame in &frames {
            bytes.extend_from_slice(&FrameCodec::encode_frame(frame).unwrap());
        }
        (frames, bytes)
    }

    #[test]
    fn test_encode_is_single_line() {
        let frame = Frame::message(RequestId::from("a"), json!({"text": "x\ny\nz"}));
        let line = FrameCodec::encode_frame(&frame).unwrap();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(line.last(), Some(&b'\n'));
    }

    #[test]
    fn test_feed_whole_stream() {
        let (expected, bytes) = sample_stream();
        let mut codec = FrameCodec::new();
        assert_eq!(frames(codec.feed(&bytes)), expected);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_feed_byte_at_a_time() {
        let (expected, bytes) = sample_stream();
        let mut codec = FrameCodec::new();
        let mut decoded = Vec::new();
        for b in &bytes {
            decoded.extend(codec.feed(std::slice::from_ref(b)));
        }
        assert_eq!(frames(decoded), expected);
    }

    #[test]
    fn test_partial_line_is_retained() {
        let mut codec = FrameCodec::new();
        assert!(codec.feed(br#"{"type":"shut"#).is_empty());
        assert_eq!(codec.pending(), 13);
        let out = codec.feed(b"down\"}\n");
        assert_eq!(frames(out), vec![Frame::Shutdown]);
    }

    #[test]
    fn test_malformed_line_does_not_desync() {
        let mut codec = FrameCodec::new();
        let mut bytes = b"{not json}\n".to_vec();
        bytes.extend_from_slice(&FrameCodec::encode_frame(&Frame::healthcheck(1)).unwrap());
        bytes.extend_from_slice(b"{\"payload\":{}}\n");
        bytes.extend_from_slice(&FrameCodec::encode_frame(&Frame::Shutdown).unwrap());

        let out = codec.feed(&bytes);
        assert_eq!(out.len(), 4);
        assert!(matches!(out[0], Decoded::Malformed(FrameError::InvalidJson { .. })));
        assert_eq!(out[1], Decoded::Frame(Frame::healthcheck(1)));
        assert!(matches!(out[2], Decoded::Malformed(_)));
        assert_eq!(out[3], Decoded::Frame(Frame::Shutdown));
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let mut codec = FrameCodec::new();
        let out = codec.feed(b"\n\r\n{\"type\":\"shutdown\"}\r\n");
        assert_eq!(frames(out), vec![Frame::Shutdown]);
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut codec = FrameCodec::with_max_frame_bytes(32);
        let big = format!("{{\"type\":\"message\",\"payload\":\"{}\"}}\n", "x".repeat(100));
        let mut bytes = big.into_bytes();
        bytes.extend_from_slice(&FrameCodec::encode_frame(&Frame::Shutdown).unwrap());

        let out = codec.feed(&bytes);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            Decoded::Malformed(FrameError::Oversized { limit: 32 })
        );
        assert_eq!(out[1], Decoded::Frame(Frame::Shutdown));
    }

    #[test]
    fn test_oversized_line_split_across_reads() {
        let mut codec = FrameCodec::with_max_frame_bytes(16);
        let out = codec.feed(&[b'a'; 40]);
        assert_eq!(out, vec![Decoded::Malformed(FrameError::Oversized { limit: 16 })]);
        assert!(codec.feed(&[b'b'; 40]).is_empty());
        let out = codec.feed(b"ccc\n{\"type\":\"shutdown\"}\n");
        assert_eq!(frames(out), vec![Frame::Shutdown]);
    }

    #[test]
    fn test_decoder_eof_reports_truncation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ready\"}\n{\"type\":"[..]);
        let first = codec.decode_eof(&mut buf).unwrap();
        assert!(matches!(first, Some(Decoded::Frame(Frame::Ready { .. }))));
        let second = codec.decode_eof(&mut buf).unwrap();
        assert_eq!(
            second,
            Some(Decoded::Malformed(FrameError::Truncated { len: 8 }))
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encoder_trait() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Frame::healthcheck(9), &mut dst).unwrap();
        codec.encode(Frame::Shutdown, &mut dst).unwrap();
        let out = frames(FrameCodec::new().feed(&dst));
        assert_eq!(out, vec![Frame::healthcheck(9), Frame::Shutdown]);
    }

    proptest! {
        /// Arbitrary chunking yields the same frames as a single read.
        #[test]
        fn fragmentation_is_idempotent(cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12)) {
            let (expected, bytes) = sample_stream();
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut codec = FrameCodec::new();
            let mut decoded = Vec::new();
            let mut start = 0;
            for p in points {
                decoded.extend(codec.feed(&bytes[start..p]));
                start = p;
            }
            decoded.extend(codec.feed(&bytes[start..]));

            prop_assert_eq!(frames(decoded), expected);
            prop_assert_eq!(codec.pending(), 0);
        }

        /// Garbage lines never panic and never swallow the following frame.
        #[test]
        fn garbage_line_recovers(garbage in "[^\n]{0,64}") {
            let mut bytes = garbage.into_bytes();
            bytes.push(b'\n');
            bytes.extend_from_slice(&FrameCodec::encode_frame(&Frame::Shutdown).unwrap());

            let out = FrameCodec::new().feed(&bytes);
            prop_assert_eq!(out.last(), Some(&Decoded::Frame(Frame::Shutdown)));
        }
    }
}
