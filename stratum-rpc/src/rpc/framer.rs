//! Newline-delimited JSON framing.
//!
//! Each line on the wire is one JSON value. [`LineFramer`] is a tokio codec:
//! as a [`Decoder`] it splits a byte stream into lines and parses each one,
//! as an [`Encoder`] it writes one value plus `\n`. A line that fails to
//! decode is surfaced as [`Decoded::Malformed`] rather than an error so that
//! one bad line from the server cannot end the stream.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::error::{FramingError, RpcError};

/// Default cap on a single inbound line.
///
/// Electrum replies for large histories run to several megabytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 32 * 1024 * 1024;

/// One item yielded by the decoder.
#[derive(Debug)]
pub enum Decoded {
    /// A complete, parsed line
    Message(Value),
    /// A line that had to be dropped
    Malformed(FramingError),
}

/// Codec for newline-delimited JSON.
#[derive(Debug)]
pub struct LineFramer {
    /// Maximum line size before discarding
    max_length: usize,

    /// Bytes already scanned for a newline in the current buffer
    next_index: usize,

    /// Skipping the remainder of an overlong line
    discarding: bool,

    /// Buffer for the push-style [`feed`](Self::feed) API
    pending: BytesMut,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl LineFramer {
    /// Create a framer with the given line length cap.
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
            pending: BytesMut::new(),
        }
    }

    /// Push raw bytes and collect every complete line they finish.
    ///
    /// A trailing partial line is retained for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Ok(Some(item)) = self.decode(&mut buf) {
            out.push(item);
        }

        self.pending = buf;
        out
    }

    /// Serialize one message as a complete line.
    pub fn encode_line<T: Serialize>(msg: &T) -> Result<BytesMut, RpcError> {
        let mut dst = BytesMut::new();
        serde_json::to_writer((&mut dst).writer(), msg)?;
        dst.put_u8(b'\n');
        Ok(dst)
    }

    fn parse_line(line: &[u8]) -> Option<Decoded> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(_) => return Some(Decoded::Malformed(FramingError::InvalidUtf8)),
        };

        if text.is_empty() {
            return None;
        }

        trace!(rx = %text, "Received line");

        Some(match serde_json::from_str(text) {
            Ok(value) => Decoded::Message(value),
            Err(e) => Decoded::Malformed(FramingError::InvalidJson(e)),
        })
    }
}

impl Decoder for LineFramer {
    type Item = Decoded;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(pos)) => {
                    // End of the overlong line; resume normal framing
                    let _ = src.split_to(pos + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    let _ = src.split_to(src.len());
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(pos)) if pos > self.max_length => {
                    let _ = src.split_to(pos + 1);
                    self.next_index = 0;
                    return Ok(Some(Decoded::Malformed(FramingError::LineTooLong {
                        limit: self.max_length,
                    })));
                }
                (false, Some(pos)) => {
                    let line = src.split_to(pos + 1);
                    self.next_index = 0;
                    match Self::parse_line(&line[..pos]) {
                        Some(item) => return Ok(Some(item)),
                        None => continue, // blank line
                    }
                }
                (false, None) if src.len() > self.max_length => {
                    let _ = src.split_to(src.len());
                    self.discarding = true;
                    self.next_index = 0;
                    return Ok(Some(Decoded::Malformed(FramingError::LineTooLong {
                        limit: self.max_length,
                    })));
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }

        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }

        let len = src.len();
        let leftover = src.split_to(len);
        if leftover.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        Ok(Some(Decoded::Malformed(FramingError::Truncated { len })))
    }
}

impl<T: Serialize> Encoder<&T> for LineFramer {
    type Error = RpcError;

    fn encode(&mut self, item: &T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        serde_json::to_writer((&mut *dst).writer(), item)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages(items: Vec<Decoded>) -> Vec<Value> {
        items
            .into_iter()
            .map(|item| match item {
                Decoded::Message(v) => v,
                Decoded::Malformed(e) => panic!("unexpected malformed line: {}", e),
            })
            .collect()
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let request = json!({"id": 2, "method": "server.ping", "params": []});
        let bytes = LineFramer::encode_line(&request).unwrap();
        assert_eq!(&bytes[..], &b"{\"id\":2,\"method\":\"server.ping\",\"params\":[]}\n"[..]);
    }

    #[test]
    fn test_encoder_writes_lines_back_to_back() {
        let mut framer = LineFramer::default();
        let mut dst = BytesMut::new();
        framer.encode(&json!(1), &mut dst).unwrap();
        framer.encode(&json!([2]), &mut dst).unwrap();
        assert_eq!(&dst[..], b"1\n[2]\n");
    }

    #[test]
    fn test_feed_retains_partial_line() {
        let mut framer = LineFramer::default();

        let first = framer.feed(br#"{"id":2,"res"#);
        assert!(first.is_empty());

        let second = framer.feed(b"ult\":true}\n{\"id\":3");
        assert_eq!(messages(second), vec![json!({"id": 2, "result": true})]);

        let third = framer.feed(b",\"result\":false}\n");
        assert_eq!(messages(third), vec![json!({"id": 3, "result": false})]);
    }

    #[test]
    fn test_feed_preserves_order_and_skips_blank_lines() {
        let mut framer = LineFramer::default();
        let out = framer.feed(b"1\n\n  \r\n2\r\n3\n");
        assert_eq!(messages(out), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_malformed_line_does_not_stop_framing() {
        let mut framer = LineFramer::default();
        let out = framer.feed(b"{\"id\":1,\"result\":1}\nnot json at all\n{\"id\":2,\"result\":2}\n");

        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Decoded::Message(v) if v["id"] == 1));
        assert!(matches!(&out[1], Decoded::Malformed(FramingError::InvalidJson(_))));
        assert!(matches!(&out[2], Decoded::Message(v) if v["id"] == 2));
    }

    #[test]
    fn test_invalid_utf8_is_reported_per_line() {
        let mut framer = LineFramer::default();
        let out = framer.feed(b"\xff\xfe\n\"ok\"\n");

        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Decoded::Malformed(FramingError::InvalidUtf8)));
        assert!(matches!(&out[1], Decoded::Message(v) if v == "ok"));
    }

    #[test]
    fn test_overlong_line_is_discarded_once() {
        let mut framer = LineFramer::new(8);

        // Exceeds the cap before its newline arrives
        let out = framer.feed(b"\"aaaaaaaaaaaa");
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Decoded::Malformed(FramingError::LineTooLong { limit: 8 })));

        // Rest of the same line is skipped silently
        let out = framer.feed(b"aaaa\"\n7\n");
        assert_eq!(messages(out), vec![json!(7)]);
    }

    #[test]
    fn test_overlong_complete_line() {
        let mut framer = LineFramer::new(4);
        let out = framer.feed(b"[1,2,3,4]\n5\n");
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Decoded::Malformed(FramingError::LineTooLong { .. })));
        assert!(matches!(&out[1], Decoded::Message(v) if v == 5));
    }

    #[test]
    fn test_decode_eof_reports_truncated_line() {
        let mut framer = LineFramer::default();
        let mut buf = BytesMut::from(&b"1\n{\"id\":"[..]);

        assert!(matches!(framer.decode_eof(&mut buf).unwrap(), Some(Decoded::Message(_))));
        assert!(matches!(
            framer.decode_eof(&mut buf).unwrap(),
            Some(Decoded::Malformed(FramingError::Truncated { len: 6 }))
        ));
        assert!(framer.decode_eof(&mut buf).unwrap().is_none());
    }
}
