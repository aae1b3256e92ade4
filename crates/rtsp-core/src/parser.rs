//! Incremental RTSP message decoding.
//!
//! One byte stream carries three kinds of traffic (requests, responses
//! and interleaved binary frames); the first pending byte decides which.
//! [`RtspMessage::decode`] consumes exactly one complete message from the
//! front of the caller's buffer and leaves any remainder in place, so the
//! caller can feed network reads of arbitrary chunking and retry on
//! [`Error::NeedMoreData`].
//!
//! The header block is walked character by character: it supports line
//! folding (a continuation line keeps its CRLF and leading whitespace
//! inside the value slice), splitting of comma-separated headers outside
//! quoted strings, and trims trailing whitespace with a running counter
//! instead of a second pass.

use std::ops::Range;

use bytes::BytesMut;
use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{opt, rest},
    sequence::preceded,
    IResult, Offset,
};

use crate::error::{Error, Result};
use crate::header::{comma_separated, hash_id, id, HeaderId, RtspHeader};
use crate::message::{ContentType, RtspMessage, RtspMessageType};

/// Maximum bytes allowed before the first line terminator.
const STARTLINE_MAX: usize = 8192;

/// Parsed head of a message: everything except the body.
pub(crate) struct Head {
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
    pub(crate) consumed: usize,
}

impl Head {
    fn empty(mtype: RtspMessageType) -> Self {
        Head {
            mtype,
            ver: 0..0,
            met: 0..0,
            path: 0..0,
            prm: None,
            status: 0,
            reason: 0..0,
            cseq: None,
            clen: 0,
            ctype: None,
            channel: 0,
            headers: Vec::new(),
            consumed: 0,
        }
    }
}

impl RtspMessage {
    /// Decode one complete message from the front of `buf`.
    ///
    /// On success the message's bytes (head and `Content-Length` body, or
    /// the 4-byte ILD header and payload) are removed from `buf`; any
    /// following bytes stay for the next call. [`Error::NeedMoreData`]
    /// leaves `buf` untouched. Any other error means the input can never
    /// parse and the connection carrying it should be closed.
    pub fn decode(buf: &mut BytesMut) -> Result<RtspMessage> {
        let head = parse_head(buf)?;

        let total = head.consumed + head.clen;
        if buf.len() < total {
            return Err(Error::NeedMoreData);
        }

        let raw = buf.split_to(total).freeze();
        let body = raw.slice(head.consumed..);

        Ok(RtspMessage {
            raw,
            mtype: head.mtype,
            ver: head.ver,
            met: head.met,
            path: head.path,
            prm: head.prm,
            status: head.status,
            reason: head.reason,
            cseq: head.cseq,
            clen: head.clen,
            ctype: head.ctype,
            channel: head.channel,
            headers: head.headers,
            body,
        })
    }
}

/// `RTSP/<ver> <code> [reason]`
fn response_line(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (i, _) = tag(&b"RTSP/"[..])(i)?;
    let (i, ver) = take_while1(|c: u8| c.is_ascii_digit() || c == b'.')(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, code) = digit1(i)?;
    let (i, _) = take_while(|c: u8| c == b' ')(i)?;
    let (i, reason) = rest(i)?;
    Ok((i, (ver, code, reason)))
}

/// `<method> <path>[?<params>] RTSP/<ver>`
#[allow(clippy::type_complexity)]
fn request_line(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8], Option<&[u8]>, &[u8])> {
    let (i, met) = take_while1(|c: u8| c.is_ascii_alphabetic() || c == b'_')(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, path) = take_while1(|c: u8| c != b'?' && c != b' ')(i)?;
    let (i, prm) = opt(preceded(char('?'), take_while(|c: u8| c != b' ')))(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, _) = tag(&b"RTSP/"[..])(i)?;
    let (i, ver) = take_while1(|c: u8| c.is_ascii_digit() || c == b'.')(i)?;
    Ok((i, (met, path, prm, ver)))
}

fn range_of(src: &[u8], part: &[u8]) -> Range<usize> {
    let start = src.offset(part);
    start..start + part.len()
}

/// Lenient numeric parse: leading decimal digits, 0 when there are none.
fn digits_u32(s: &[u8]) -> u32 {
    let mut v: u32 = 0;
    for &b in s {
        if !b.is_ascii_digit() {
            break;
        }
        v = v.wrapping_mul(10).wrapping_add((b - b'0') as u32);
    }
    v
}

/// Parse the head of the next message without consuming anything.
fn parse_head(src: &[u8]) -> Result<Head> {
    let Some(&first) = src.first() else {
        return Err(Error::NeedMoreData);
    };

    // Interleaved data: 0x24, channel, length (u16 BE)
    if first == 0x24 {
        if src.len() < 4 {
            return Err(Error::NeedMoreData);
        }
        let mut head = Head::empty(RtspMessageType::InterleavedData);
        head.channel = src[1];
        head.clen = u16::from_be_bytes([src[2], src[3]]) as usize;
        head.consumed = 4;
        return Ok(head);
    }

    // Start line: skip leading CR/LF, then take everything up to the
    // next LF (minus a trailing CR).
    let mut sol = 0;
    while sol < src.len() && (src[sol] == b'\r' || src[sol] == b'\n') {
        sol += 1;
    }
    let Some(eol_rel) = src[sol..].iter().position(|&b| b == b'\n') else {
        return Err(if src.len() > STARTLINE_MAX {
            Error::Malformed("start line too long")
        } else {
            Error::NeedMoreData
        });
    };
    let eol = sol + eol_rel;
    let mut line_end = eol;
    while line_end > sol && src[line_end - 1] == b'\r' {
        line_end -= 1;
    }
    let line = &src[sol..line_end];

    let mut head;
    if let Ok((_, (ver, code, reason))) = response_line(line) {
        head = Head::empty(RtspMessageType::Response);
        head.ver = range_of(src, ver);
        head.status = digits_u32(code) as u16;
        head.reason = range_of(src, reason);
    } else if let Ok((_, (met, path, prm, ver))) = request_line(line) {
        head = Head::empty(RtspMessageType::Request);
        head.met = range_of(src, met);
        head.path = range_of(src, path);
        head.prm = prm.map(|p| range_of(src, p));
        head.ver = range_of(src, ver);
    } else {
        return Err(Error::Malformed("start line"));
    }

    parse_headers(src, eol + 1, &mut head)?;
    Ok(head)
}

/// Append one header field, trimming `ws` trailing whitespace bytes off
/// the value. `p` is the position just past the value's last byte.
fn add_header(
    src: &[u8],
    head: &mut Head,
    name: Range<usize>,
    hid: HeaderId,
    cv: Option<usize>,
    p: usize,
    ws: usize,
) -> Result<()> {
    let value = match cv {
        Some(s) => s..s + (p - s).saturating_sub(ws),
        None => p..p,
    };

    match hid {
        id::CONTENT_TYPE => head.ctype = Some(parse_content_type(src, &value)?),
        id::CONTENT_LENGTH => head.clen = digits_u32(&src[value.clone()]) as usize,
        id::CSEQ => head.cseq = Some(digits_u32(&src[value.clone()])),
        _ => {}
    }

    head.headers.push(RtspHeader {
        name,
        value,
        id: hid,
    });
    Ok(())
}

/// `type/subtype` with optional parameters after `;`
fn parse_content_type(src: &[u8], value: &Range<usize>) -> Result<ContentType> {
    let v = &src[value.clone()];
    let slash = v
        .iter()
        .position(|&b| b == b'/')
        .ok_or(Error::Malformed("content type"))?;
    if slash == 0 {
        return Err(Error::Malformed("content type"));
    }

    let sub = &v[slash + 1..];
    let sub_len = sub
        .iter()
        .position(|&b| b == b';' || b == b' ' || b == b'\t')
        .unwrap_or(sub.len());
    if sub_len == 0 {
        return Err(Error::Malformed("content type"));
    }

    let sub_start = value.start + slash + 1;
    Ok(ContentType {
        mtype: value.start..value.start + slash,
        subtype: sub_start..sub_start + sub_len,
    })
}

/// Walk the header block starting at `start`, filling `head.headers` and
/// the typed fields. Sets `head.consumed` to one past the terminating
/// CRLFCRLF on success.
fn parse_headers(src: &[u8], start: usize, head: &mut Head) -> Result<()> {
    let mut name: Option<usize> = None;
    let mut name_len: usize = 0;
    let mut hid: HeaderId = 0;
    let mut comsep = false;
    let mut quote = false;
    let mut cv: Option<usize> = None;
    let mut ws: usize = 0;
    let mut lf: u32 = 0;

    let mut i = start;
    while i < src.len() {
        let c = src[i];
        match c {
            b' ' | b'\t' => {
                // a line starting with whitespace folds into the
                // previous value
                lf = 0;
                ws += 1;
            }
            b'\r' => {
                ws += 1;
            }
            b'\n' => {
                ws += 1;
                if name.is_none() {
                    // empty block: no headers at all
                    head.consumed = i + 1;
                    return Ok(());
                }
                lf += 1;
                if lf > 1 {
                    // CRLFCRLF: flush the pending header and finish
                    if name_len == 0 {
                        return Err(Error::Malformed("header"));
                    }
                    let p = i + 1;
                    let ns = name.unwrap_or(p);
                    add_header(src, head, ns..ns + name_len, hid, cv, p, ws)?;
                    head.consumed = p;
                    return Ok(());
                }
            }
            _ => {
                if lf > 0 || (c == b',' && comsep && !quote) {
                    if name_len == 0 {
                        return Err(Error::Malformed("header"));
                    }
                    let ns = name.unwrap_or(i);
                    add_header(src, head, ns..ns + name_len, hid, cv, i, ws)?;

                    if lf == 0 {
                        // comma separated: next value keeps the name
                        cv = None;
                        i += 1;
                        continue;
                    }

                    comsep = false;
                    name = None;
                    name_len = 0;
                    cv = None;
                    lf = 0;
                }

                if name.is_none() {
                    name = Some(i);
                    name_len = 0;
                    ws = 0;
                }

                if name_len == 0 {
                    if c != b':' {
                        ws = 0;
                        i += 1;
                        continue;
                    }
                    let ns = name.unwrap_or(i);
                    let nl = (i - ns).saturating_sub(ws);
                    if nl == 0 {
                        return Err(Error::Malformed("header name"));
                    }
                    name_len = nl;
                    hid = hash_id(&src[ns..ns + nl]);
                    comsep = comma_separated(hid);
                    i += 1;
                    continue;
                }

                if cv.is_none() {
                    quote = false;
                    cv = Some(i);
                }
                if c == b'"' {
                    quote = !quote;
                }
                ws = 0;
            }
        }
        i += 1;
    }

    Err(Error::NeedMoreData)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::id;

    fn decode_str(input: &str) -> Result<RtspMessage> {
        let mut buf = BytesMut::from(input);
        RtspMessage::decode(&mut buf)
    }

    #[test]
    fn test_request_start_line() {
        let msg = decode_str("OPTIONS * RTSP/1.0\r\n\r\n").unwrap();
        assert_eq!(msg.message_type(), RtspMessageType::Request);
        assert_eq!(msg.method(), "OPTIONS");
        assert_eq!(msg.path(), "*");
        assert_eq!(msg.params(), None);
        assert_eq!(msg.version(), "1.0");
        assert!(msg.headers().is_empty());
    }

    #[test]
    fn test_request_with_params() {
        let msg =
            decode_str("PLAY rtsp://cam/stream?track=1 RTSP/1.0\r\nCSeq: 3\r\n\r\n").unwrap();
        assert_eq!(msg.path(), "rtsp://cam/stream");
        assert_eq!(msg.params(), Some("track=1"));
        assert_eq!(msg.cseq(), Some(3));
    }

    #[test]
    fn test_response_start_line() {
        let msg = decode_str("RTSP/1.0 404 Not Found\r\nCSeq: 2\r\n\r\n").unwrap();
        assert_eq!(msg.message_type(), RtspMessageType::Response);
        assert_eq!(msg.status(), 404);
        assert_eq!(msg.reason(), "Not Found");
        assert_eq!(msg.version(), "1.0");
    }

    #[test]
    fn test_response_empty_reason() {
        let msg = decode_str("RTSP/1.0 200\r\n\r\n").unwrap();
        assert_eq!(msg.status(), 200);
        assert_eq!(msg.reason(), "");
    }

    #[test]
    fn test_options_with_comma_split_require() {
        // the comma splits one Require line into two headers
        let mut buf = BytesMut::from("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: foo, bar\r\n\r\n");
        let msg = RtspMessage::decode(&mut buf).unwrap();
        assert!(buf.is_empty());

        assert_eq!(msg.method(), "OPTIONS");
        assert_eq!(msg.path(), "*");
        assert_eq!(msg.cseq(), Some(1));
        assert_eq!(msg.header_count(id::REQUIRE), 2);

        let values: Vec<&str> = msg
            .headers()
            .iter()
            .filter(|h| h.id == id::REQUIRE)
            .map(|h| msg.header_value(h))
            .collect();
        assert_eq!(values, ["foo", "bar"]);
    }

    #[test]
    fn test_comma_inside_quotes_not_split() {
        let msg = decode_str(
            "SETUP rtsp://cam/1 RTSP/1.0\r\nTransport: \"a,b\", other\r\n\r\n",
        )
        .unwrap();
        assert_eq!(msg.header_count(id::TRANSPORT), 2);
        let first = msg.header(id::TRANSPORT).unwrap();
        assert_eq!(msg.header_value(first), "\"a,b\"");
    }

    #[test]
    fn test_comma_split_only_for_listed_headers() {
        let msg = decode_str("DESCRIBE rtsp://cam/1 RTSP/1.0\r\nSession: a, b\r\n\r\n").unwrap();
        assert_eq!(msg.header_count(id::SESSION), 1);
        let hdr = msg.header(id::SESSION).unwrap();
        assert_eq!(msg.header_value(hdr), "a, b");
    }

    #[test]
    fn test_folded_header_value() {
        let msg = decode_str(
            "DESCRIBE rtsp://cam/1 RTSP/1.0\r\nX-Long: first\r\n second\r\nCSeq: 9\r\n\r\n",
        )
        .unwrap();
        // the folded value keeps its embedded line break
        let hdr = msg.header(hash_id(b"X-Long")).unwrap();
        assert_eq!(msg.header_value(hdr), "first\r\n second");
        assert_eq!(msg.cseq(), Some(9));
    }

    #[test]
    fn test_content_type_and_length() {
        let mut buf = BytesMut::from(
            "ANNOUNCE rtsp://cam/1 RTSP/1.0\r\nContent-Type: application/sdp\r\nContent-Length: 4\r\n\r\nv=0\n",
        );
        let msg = RtspMessage::decode(&mut buf).unwrap();
        assert_eq!(msg.content_type(), Some(("application", "sdp")));
        assert_eq!(msg.content_length(), 4);
        assert_eq!(msg.body().as_ref(), b"v=0\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_content_type_with_parameters() {
        let msg = decode_str(
            "ANNOUNCE rtsp://cam/1 RTSP/1.0\r\nContent-Type: text/parameters;charset=UTF-8\r\n\r\n",
        )
        .unwrap();
        assert_eq!(msg.content_type(), Some(("text", "parameters")));
    }

    #[test]
    fn test_body_split_keeps_remainder() {
        let mut buf = BytesMut::from(
            "SET_PARAMETER rtsp://cam/1 RTSP/1.0\r\nContent-Length: 3\r\n\r\nabcTAIL",
        );
        let msg = RtspMessage::decode(&mut buf).unwrap();
        assert_eq!(msg.body().as_ref(), b"abc");
        assert_eq!(&buf[..], b"TAIL");
    }

    #[test]
    fn test_need_more_data_does_not_consume() {
        let full = "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        for cut in 0..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            match RtspMessage::decode(&mut buf) {
                Err(Error::NeedMoreData) => assert_eq!(buf.len(), cut),
                other => panic!("cut={}: unexpected {:?}", cut, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_body_not_yet_complete() {
        let mut buf =
            BytesMut::from("SET_PARAMETER rtsp://cam/1 RTSP/1.0\r\nContent-Length: 10\r\n\r\nabc");
        let before = buf.len();
        assert!(matches!(
            RtspMessage::decode(&mut buf),
            Err(Error::NeedMoreData)
        ));
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn test_interleaved_data() {
        let mut buf = BytesMut::from(&b"\x24\x00\x00\x04ABCDnext"[..]);
        let msg = RtspMessage::decode(&mut buf).unwrap();
        assert_eq!(msg.message_type(), RtspMessageType::InterleavedData);
        assert_eq!(msg.channel(), 0);
        assert_eq!(msg.content_length(), 4);
        assert_eq!(msg.body().as_ref(), b"ABCD");
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn test_interleaved_data_incomplete() {
        for input in [&b"\x24"[..], &b"\x24\x07"[..], &b"\x24\x07\x00"[..]] {
            let mut buf = BytesMut::from(input);
            assert!(matches!(
                RtspMessage::decode(&mut buf),
                Err(Error::NeedMoreData)
            ));
            assert_eq!(buf.len(), input.len());
        }
        // header complete, payload partial
        let mut buf = BytesMut::from(&b"\x24\x07\x00\x04AB"[..]);
        assert!(matches!(
            RtspMessage::decode(&mut buf),
            Err(Error::NeedMoreData)
        ));
    }

    #[test]
    fn test_start_line_cap() {
        let mut long = vec![b'a'; STARTLINE_MAX + 1];
        long.extend_from_slice(b"more");
        let mut buf = BytesMut::from(&long[..]);
        assert!(matches!(
            RtspMessage::decode(&mut buf),
            Err(Error::Malformed(_))
        ));

        // at the cap it is still just incomplete
        let mut buf = BytesMut::from(&vec![b'a'; STARTLINE_MAX][..]);
        assert!(matches!(
            RtspMessage::decode(&mut buf),
            Err(Error::NeedMoreData)
        ));
    }

    #[test]
    fn test_malformed_start_line() {
        let mut buf = BytesMut::from("not a start line\r\n\r\n");
        assert!(matches!(
            RtspMessage::decode(&mut buf),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_header_line_without_colon() {
        let mut buf = BytesMut::from("OPTIONS * RTSP/1.0\r\ngarbage line\r\n\r\n");
        assert!(matches!(
            RtspMessage::decode(&mut buf),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_leading_crlf_skipped() {
        let mut buf = BytesMut::from("\r\n\r\nOPTIONS * RTSP/1.0\r\nCSeq: 4\r\n\r\n");
        let msg = RtspMessage::decode(&mut buf).unwrap();
        assert_eq!(msg.method(), "OPTIONS");
        assert_eq!(msg.cseq(), Some(4));
    }

    #[test]
    fn test_header_value_whitespace_trimmed() {
        let msg = decode_str("OPTIONS * RTSP/1.0\r\nSession:   abc   \r\n\r\n").unwrap();
        let hdr = msg.header(id::SESSION).unwrap();
        assert_eq!(msg.header_value(hdr), "abc");
    }
}
