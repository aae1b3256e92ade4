//! Parsed RTSP message model.
//!
//! A decoded message keeps one reference-counted backing buffer and
//! records every textual component as a byte range into it, so no header
//! name or value is copied during parsing and the slices stay valid for
//! the whole life of the message.

use std::ops::Range;
use std::str;

use bytes::Bytes;

use crate::header::{HeaderId, RtspHeader};

/// The three kinds of traffic sharing one RTSP byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspMessageType {
    /// `<method> <path> RTSP/<ver>` start line
    Request,
    /// `RTSP/<ver> <code> <reason>` start line
    Response,
    /// Binary frame introduced by a `0x24` byte
    InterleavedData,
}

/// Content-Type split into its type and subtype tokens.
#[derive(Debug, Clone)]
pub(crate) struct ContentType {
    pub(crate) mtype: Range<usize>,
    pub(crate) subtype: Range<usize>,
}

/// A complete RTSP message: request, response or interleaved-data frame.
///
/// Produced by [`RtspMessage::decode`]. Request/response accessors return
/// the empty string when called on the wrong message type, mirroring the
/// unset slices of the wire representation.
#[derive(Debug, Clone)]
pub struct RtspMessage {
    pub(crate) raw: Bytes,
    pub(crate) mtype: RtspMessageType,
    pub(crate) ver: Range<usize>,
    pub(crate) met: Range<usize>,
    pub(crate) path: Range<usize>,
    pub(crate) prm: Option<Range<usize>>,
    pub(crate) status: u16,
    pub(crate) reason: Range<usize>,
    pub(crate) cseq: Option<u32>,
    pub(crate) clen: usize,
    pub(crate) ctype: Option<ContentType>,
    pub(crate) channel: u8,
    pub(crate) headers: Vec<RtspHeader>,
    pub(crate) body: Bytes,
}

impl RtspMessage {
    fn str_at(&self, r: &Range<usize>) -> &str {
        str::from_utf8(&self.raw[r.clone()]).unwrap_or("")
    }

    /// Message type
    pub fn message_type(&self) -> RtspMessageType {
        self.mtype
    }

    /// Request method, e.g. `OPTIONS`
    pub fn method(&self) -> &str {
        self.str_at(&self.met)
    }

    /// Request path (without query parameters)
    pub fn path(&self) -> &str {
        self.str_at(&self.path)
    }

    /// Request query parameters, the part after `?`
    pub fn params(&self) -> Option<&str> {
        self.prm.as_ref().map(|r| self.str_at(r))
    }

    /// Protocol version, e.g. `1.0`
    pub fn version(&self) -> &str {
        self.str_at(&self.ver)
    }

    /// Response status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response reason phrase
    pub fn reason(&self) -> &str {
        self.str_at(&self.reason)
    }

    /// CSeq header value, when present
    pub fn cseq(&self) -> Option<u32> {
        self.cseq
    }

    /// Content-Length header value (ILD frame length for interleaved data)
    pub fn content_length(&self) -> usize {
        self.clen
    }

    /// Content-Type as `(type, subtype)` tokens, when present
    pub fn content_type(&self) -> Option<(&str, &str)> {
        self.ctype
            .as_ref()
            .map(|ct| (self.str_at(&ct.mtype), self.str_at(&ct.subtype)))
    }

    /// Interleaved-data channel number
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Message body (the ILD payload for interleaved data)
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// All header fields in wire order
    pub fn headers(&self) -> &[RtspHeader] {
        &self.headers
    }

    /// Resolve a header's name
    pub fn header_name(&self, hdr: &RtspHeader) -> &str {
        self.str_at(&hdr.name)
    }

    /// Resolve a header's value
    pub fn header_value(&self, hdr: &RtspHeader) -> &str {
        self.str_at(&hdr.value)
    }

    /// First header with the given id
    pub fn header(&self, hid: HeaderId) -> Option<&RtspHeader> {
        self.header_apply(true, hid, |_| true)
    }

    /// Walk headers with the given id, forward or reverse, returning the
    /// first one for which `f` returns true.
    pub fn header_apply<F>(&self, fwd: bool, hid: HeaderId, mut f: F) -> Option<&RtspHeader>
    where
        F: FnMut(&RtspHeader) -> bool,
    {
        let iter: Box<dyn Iterator<Item = &RtspHeader> + '_> = if fwd {
            Box::new(self.headers.iter())
        } else {
            Box::new(self.headers.iter().rev())
        };

        for hdr in iter {
            if hdr.id != hid {
                continue;
            }
            if f(hdr) {
                return Some(hdr);
            }
        }
        None
    }

    /// Number of headers with the given id
    pub fn header_count(&self, hid: HeaderId) -> u32 {
        self.headers.iter().filter(|h| h.id == hid).count() as u32
    }

    /// True when a header with the given id carries `value`
    /// (ASCII case-insensitive compare).
    pub fn header_has_value(&self, hid: HeaderId, value: &str) -> bool {
        self.header_apply(true, hid, |h| {
            self.header_value(h).eq_ignore_ascii_case(value)
        })
        .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode(input: &str) -> RtspMessage {
        let mut buf = BytesMut::from(input);
        RtspMessage::decode(&mut buf).expect("decode")
    }

    #[test]
    fn test_header_lookup() {
        let msg = decode(
            "DESCRIBE rtsp://cam/1 RTSP/1.0\r\n\
             CSeq: 7\r\n\
             Session: 12345678\r\n\
             Require: foo, bar\r\n\r\n",
        );

        let hdr = msg.header(crate::header::id::SESSION).unwrap();
        assert_eq!(msg.header_value(hdr), "12345678");

        assert_eq!(msg.header_count(crate::header::id::REQUIRE), 2);
        assert!(msg.header_has_value(crate::header::id::REQUIRE, "bar"));
        assert!(msg.header_has_value(crate::header::id::REQUIRE, "BAR"));
        assert!(!msg.header_has_value(crate::header::id::REQUIRE, "baz"));
    }

    #[test]
    fn test_header_apply_reverse() {
        let msg = decode(
            "OPTIONS * RTSP/1.0\r\n\
             Require: foo, bar\r\n\r\n",
        );

        let first = msg
            .header_apply(true, crate::header::id::REQUIRE, |_| true)
            .unwrap();
        let last = msg
            .header_apply(false, crate::header::id::REQUIRE, |_| true)
            .unwrap();
        assert_eq!(msg.header_value(first), "foo");
        assert_eq!(msg.header_value(last), "bar");
    }
}
