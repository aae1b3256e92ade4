//! RTP packet header encoding and decoding (RFC 3550 Section 5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// RTP protocol version, always 2
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header in bytes
pub const RTP_HEADER_SIZE: usize = 12;

/// Optional RTP header extension (RFC 3550 Section 5.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    /// Profile-defined extension type
    pub ext_type: u16,
    /// Extension body; length must be a multiple of 4
    pub data: Bytes,
}

/// Decoded RTP header.
///
/// The CSRC count on the wire is derived from `csrc.len()`. The
/// `extension` flag can be set without an [`RtpExtension`] body for
/// senders that carry the extension at the start of the payload; the
/// decoder always captures the extension into `ext` when the flag is
/// set on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version (2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Media timestamp
    pub timestamp: u32,
    /// Synchronisation source
    pub ssrc: u32,
    /// Contributing sources, at most 15
    pub csrc: Vec<u32>,
    /// Parsed extension header and body
    pub ext: Option<RtpExtension>,
}

impl Default for RtpHeader {
    fn default() -> Self {
        RtpHeader {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            marker: false,
            payload_type: 0,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            ext: None,
        }
    }
}

impl RtpHeader {
    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        RTP_HEADER_SIZE
            + 4 * self.csrc.len()
            + self.ext.as_ref().map_or(0, |x| 4 + x.data.len())
    }

    /// Encode the header into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.csrc.len() > 15 {
            return Err(Error::InvalidArgument("more than 15 CSRCs"));
        }
        if let Some(ext) = &self.ext {
            if ext.data.len() % 4 != 0 {
                return Err(Error::InvalidArgument("extension length not a word multiple"));
            }
            if ext.data.len() / 4 > u16::MAX as usize {
                return Err(Error::InvalidArgument("extension too large"));
            }
        }

        buf.reserve(self.len());

        let ext_bit = self.extension || self.ext.is_some();
        let b0 = (self.version & 0x03) << 6
            | (self.padding as u8) << 5
            | (ext_bit as u8) << 4
            | self.csrc.len() as u8;
        let b1 = (self.marker as u8) << 7 | (self.payload_type & 0x7f);

        buf.put_u8(b0);
        buf.put_u8(b1);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for &csrc in &self.csrc {
            buf.put_u32(csrc);
        }

        if let Some(ext) = &self.ext {
            buf.put_u16(ext.ext_type);
            buf.put_u16((ext.data.len() / 4) as u16);
            buf.extend_from_slice(&ext.data);
        }

        Ok(())
    }

    /// Decode a header from `buf`, validating the length at every
    /// extent. On success the cursor is left at the start of the
    /// payload; the protocol version is not checked here.
    pub fn decode(buf: &mut Bytes) -> Result<RtpHeader> {
        if buf.len() < RTP_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_HEADER_SIZE,
                available: buf.len(),
            });
        }

        let b0 = buf.get_u8();
        let b1 = buf.get_u8();

        let version = (b0 >> 6) & 0x03;
        let padding = (b0 >> 5) & 0x01 == 1;
        let ext_bit = (b0 >> 4) & 0x01 == 1;
        let cc = (b0 & 0x0f) as usize;
        let marker = (b1 >> 7) & 0x01 == 1;
        let payload_type = b1 & 0x7f;

        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.len() < cc * 4 {
            return Err(Error::BufferTooSmall {
                required: cc * 4,
                available: buf.len(),
            });
        }
        let csrc: Vec<u32> = (0..cc).map(|_| buf.get_u32()).collect();

        let ext = if ext_bit {
            if buf.len() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.len(),
                });
            }
            let ext_type = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.len() < words * 4 {
                return Err(Error::BufferTooSmall {
                    required: words * 4,
                    available: buf.len(),
                });
            }
            Some(RtpExtension {
                ext_type,
                data: buf.copy_to_bytes(words * 4),
            })
        } else {
            None
        };

        Ok(RtpHeader {
            version,
            padding,
            extension: ext_bit,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc,
            ext,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_basic() {
        let hdr = RtpHeader {
            marker: true,
            payload_type: 96,
            sequence: 1265,
            timestamp: 4_169_613_229,
            ssrc: 1_744_739_836,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), RTP_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = RtpHeader::decode(&mut bytes).unwrap();
        assert_eq!(decoded, hdr);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_wire_layout() {
        let hdr = RtpHeader {
            payload_type: 0,
            sequence: 0x0102,
            timestamp: 0x03040506,
            ssrc: 0x0708090a,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x80, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a]
        );
    }

    #[test]
    fn test_roundtrip_full() {
        // every field populated: 15 CSRCs and an extension
        let hdr = RtpHeader {
            padding: true,
            marker: true,
            payload_type: 127,
            sequence: 65535,
            timestamp: u32::MAX,
            ssrc: 0xdeadbeef,
            csrc: (0..15).map(|i| 0x1000 + i).collect(),
            ext: Some(RtpExtension {
                ext_type: 0xbede,
                data: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
            }),
            extension: true,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), hdr.len());
        assert_eq!(buf.len(), 12 + 15 * 4 + 4 + 8);

        let mut bytes = buf.freeze();
        let decoded = RtpHeader::decode(&mut bytes).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn test_payload_follows_header() {
        let hdr = RtpHeader {
            sequence: 7,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        buf.extend_from_slice(b"payload");

        let mut bytes = buf.freeze();
        let decoded = RtpHeader::decode(&mut bytes).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert_eq!(bytes.as_ref(), b"payload");
    }

    #[test]
    fn test_truncated_fixed_header() {
        let mut bytes = Bytes::from_static(&[0x80, 0x00, 0x01]);
        assert!(matches!(
            RtpHeader::decode(&mut bytes),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_truncated_csrc() {
        // cc = 2 but only one CSRC present
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(0);
        buf.put_u16(1);
        buf.put_u32(2);
        buf.put_u32(3);
        buf.put_u32(0x11111111);
        let mut bytes = buf.freeze();
        assert!(matches!(
            RtpHeader::decode(&mut bytes),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_truncated_extension() {
        // extension flag set, no extension header
        let mut buf = BytesMut::new();
        buf.put_u8(0x90);
        buf.put_u8(0);
        buf.put_u16(1);
        buf.put_u32(2);
        buf.put_u32(3);
        let mut bytes = buf.freeze();
        assert!(matches!(
            RtpHeader::decode(&mut bytes),
            Err(Error::BufferTooSmall { .. })
        ));

        // extension header claims more words than present
        let mut buf = BytesMut::new();
        buf.put_u8(0x90);
        buf.put_u8(0);
        buf.put_u16(1);
        buf.put_u32(2);
        buf.put_u32(3);
        buf.put_u16(0xbede);
        buf.put_u16(4);
        buf.put_u32(0);
        let mut bytes = buf.freeze();
        assert!(matches!(
            RtpHeader::decode(&mut bytes),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_extension_bit_without_body() {
        // sender flags an extension it embeds in the payload itself
        let hdr = RtpHeader {
            extension: true,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), RTP_HEADER_SIZE);
        assert_eq!(buf[0] & 0x10, 0x10);
    }

    #[test]
    fn test_too_many_csrcs_rejected() {
        let hdr = RtpHeader {
            csrc: vec![0; 16],
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            hdr.encode(&mut buf),
            Err(Error::InvalidArgument(_))
        ));
    }
}
