//! RTCP packet parsing (RFC 3550 Section 6).
//!
//! Only the receive direction is implemented: the endpoint demultiplexes
//! RTCP off the RTP port, feeds the session state and hands the parsed
//! packets to the application. Compound packets are handled by calling
//! [`RtcpMsg::decode`] repeatedly on the same buffer.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};

/// RTCP version (same as RTP, always 2)
pub const RTCP_VERSION: u8 = 2;

/// RTCP packet types as defined in RFC 3550
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Sender Report (SR)
    SenderReport = 200,
    /// Receiver Report (RR)
    ReceiverReport = 201,
    /// Source Description (SDES)
    SourceDescription = 202,
    /// Goodbye (BYE)
    Goodbye = 203,
    /// Application-Defined (APP)
    ApplicationDefined = 204,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            200 => Ok(RtcpPacketType::SenderReport),
            201 => Ok(RtcpPacketType::ReceiverReport),
            202 => Ok(RtcpPacketType::SourceDescription),
            203 => Ok(RtcpPacketType::Goodbye),
            204 => Ok(RtcpPacketType::ApplicationDefined),
            _ => Err(Error::Malformed("unknown RTCP packet type")),
        }
    }
}

/// NTP timestamp representation (64 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,
    /// Fraction of a second
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Convert to a 64-bit representation
    pub fn to_u64(&self) -> u64 {
        (self.seconds as u64) << 32 | self.fraction as u64
    }

    /// The middle 32 bits, as used in the LSR field of report blocks
    pub fn middle_32(&self) -> u32 {
        (self.to_u64() >> 16) as u32
    }
}

/// Report block in RTCP SR/RR packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReportBlock {
    /// SSRC the report is about
    pub ssrc: u32,
    /// Fraction of packets lost since the last report
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits)
    pub cumulative_lost: u32,
    /// Extended highest sequence number received
    pub highest_seq: u32,
    /// Interarrival jitter estimate
    pub jitter: u32,
    /// Last SR timestamp from this source
    pub last_sr: u32,
    /// Delay since last SR, in units of 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl RtcpReportBlock {
    /// Encoded size in bytes
    pub const SIZE: usize = 24;

    fn parse(buf: &mut Bytes) -> Result<Self> {
        need(buf, Self::SIZE)?;
        let ssrc = buf.get_u32();
        let lost = buf.get_u32();
        Ok(RtcpReportBlock {
            ssrc,
            fraction_lost: (lost >> 24) as u8,
            cumulative_lost: lost & 0x00ff_ffff,
            highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }
}

/// Sender Report (SR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSenderReport {
    /// Sender SSRC
    pub ssrc: u32,
    /// Wallclock time of this report
    pub ntp: NtpTimestamp,
    /// RTP timestamp corresponding to `ntp`
    pub rtp_ts: u32,
    /// Packets sent
    pub packet_count: u32,
    /// Payload octets sent
    pub octet_count: u32,
    /// Reception report blocks
    pub report_blocks: Vec<RtcpReportBlock>,
}

/// Receiver Report (RR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReceiverReport {
    /// Reporter SSRC
    pub ssrc: u32,
    /// Reception report blocks
    pub report_blocks: Vec<RtcpReportBlock>,
}

/// One SDES item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    /// Item type; 1 is CNAME
    pub item_type: u8,
    /// Item text
    pub text: String,
}

/// One SDES chunk: an SSRC with its items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    /// Described source
    pub ssrc: u32,
    /// Items in wire order
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    /// The CNAME item, when present
    pub fn cname(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.item_type == 1)
            .map(|i| i.text.as_str())
    }
}

/// Goodbye (BYE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpGoodbye {
    /// Leaving sources
    pub sources: Vec<u32>,
    /// Optional leave reason
    pub reason: Option<String>,
}

/// Application-Defined (APP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpApp {
    /// Subtype from the count field
    pub subtype: u8,
    /// Source
    pub ssrc: u32,
    /// Four-character name
    pub name: [u8; 4],
    /// Application data
    pub data: Bytes,
}

/// Payload of one RTCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender Report
    SenderReport(RtcpSenderReport),
    /// Receiver Report
    ReceiverReport(RtcpReceiverReport),
    /// Source Description
    SourceDescription(Vec<SdesChunk>),
    /// Goodbye
    Goodbye(RtcpGoodbye),
    /// Application-Defined
    App(RtcpApp),
    /// Valid framing with a packet type this stack does not interpret
    Other {
        /// Packet type from the common header
        packet_type: u8,
        /// Undecoded payload
        data: Bytes,
    },
}

/// One parsed RTCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpMsg {
    /// Padding flag from the common header
    pub padding: bool,
    /// Count/subtype field from the common header
    pub count: u8,
    /// The payload
    pub packet: RtcpPacket,
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(Error::BufferTooSmall {
            required: n,
            available: buf.len(),
        });
    }
    Ok(())
}

impl RtcpMsg {
    /// Decode one RTCP packet from `buf`, advancing past it. Call
    /// repeatedly to walk a compound packet.
    pub fn decode(buf: &mut Bytes) -> Result<RtcpMsg> {
        need(buf, 4)?;
        let b0 = buf.get_u8();
        let version = (b0 >> 6) & 0x03;
        if version != RTCP_VERSION {
            return Err(Error::Malformed("rtcp version"));
        }
        let padding = (b0 >> 5) & 0x01 == 1;
        let count = b0 & 0x1f;
        let packet_type = buf.get_u8();
        let length = buf.get_u16() as usize * 4;

        need(buf, length)?;
        let mut body = buf.copy_to_bytes(length);

        let packet = match RtcpPacketType::try_from(packet_type) {
            Ok(RtcpPacketType::SenderReport) => {
                RtcpPacket::SenderReport(parse_sender_report(&mut body, count)?)
            }
            Ok(RtcpPacketType::ReceiverReport) => {
                RtcpPacket::ReceiverReport(parse_receiver_report(&mut body, count)?)
            }
            Ok(RtcpPacketType::SourceDescription) => {
                RtcpPacket::SourceDescription(parse_sdes(&mut body, count)?)
            }
            Ok(RtcpPacketType::Goodbye) => RtcpPacket::Goodbye(parse_goodbye(&mut body, count)?),
            Ok(RtcpPacketType::ApplicationDefined) => {
                RtcpPacket::App(parse_app(&mut body, count)?)
            }
            Err(_) => RtcpPacket::Other {
                packet_type,
                data: body,
            },
        };

        Ok(RtcpMsg {
            padding,
            count,
            packet,
        })
    }
}

fn parse_sender_report(buf: &mut Bytes, count: u8) -> Result<RtcpSenderReport> {
    need(buf, 24)?;
    let ssrc = buf.get_u32();
    let ntp = NtpTimestamp {
        seconds: buf.get_u32(),
        fraction: buf.get_u32(),
    };
    let rtp_ts = buf.get_u32();
    let packet_count = buf.get_u32();
    let octet_count = buf.get_u32();

    let mut report_blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        report_blocks.push(RtcpReportBlock::parse(buf)?);
    }

    Ok(RtcpSenderReport {
        ssrc,
        ntp,
        rtp_ts,
        packet_count,
        octet_count,
        report_blocks,
    })
}

fn parse_receiver_report(buf: &mut Bytes, count: u8) -> Result<RtcpReceiverReport> {
    need(buf, 4)?;
    let ssrc = buf.get_u32();

    let mut report_blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        report_blocks.push(RtcpReportBlock::parse(buf)?);
    }

    Ok(RtcpReceiverReport {
        ssrc,
        report_blocks,
    })
}

fn parse_sdes(buf: &mut Bytes, count: u8) -> Result<Vec<SdesChunk>> {
    let total = buf.len();
    let mut chunks = Vec::with_capacity(count as usize);

    for _ in 0..count {
        need(buf, 4)?;
        let ssrc = buf.get_u32();
        let mut items = Vec::new();

        loop {
            need(buf, 1)?;
            let item_type = buf.get_u8();
            if item_type == 0 {
                // chunk ends; skip padding to the next 32-bit boundary
                let consumed = total - buf.len();
                let pad = (4 - consumed % 4) % 4;
                buf.advance(pad.min(buf.len()));
                break;
            }
            need(buf, 1)?;
            let len = buf.get_u8() as usize;
            need(buf, len)?;
            let text = String::from_utf8_lossy(&buf.copy_to_bytes(len)).into_owned();
            items.push(SdesItem { item_type, text });
        }

        chunks.push(SdesChunk { ssrc, items });
    }

    Ok(chunks)
}

fn parse_goodbye(buf: &mut Bytes, count: u8) -> Result<RtcpGoodbye> {
    let mut sources = Vec::with_capacity(count as usize);
    for _ in 0..count {
        need(buf, 4)?;
        sources.push(buf.get_u32());
    }

    let reason = if buf.has_remaining() {
        let len = buf.get_u8() as usize;
        need(buf, len)?;
        Some(String::from_utf8_lossy(&buf.copy_to_bytes(len)).into_owned())
    } else {
        None
    };

    Ok(RtcpGoodbye { sources, reason })
}

fn parse_app(buf: &mut Bytes, count: u8) -> Result<RtcpApp> {
    need(buf, 8)?;
    let ssrc = buf.get_u32();
    let mut name = [0u8; 4];
    buf.copy_to_slice(&mut name);

    Ok(RtcpApp {
        subtype: count,
        ssrc,
        name,
        data: buf.split_to(buf.len()),
    })
}
