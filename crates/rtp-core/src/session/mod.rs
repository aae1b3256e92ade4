//! RTCP session state.
//!
//! The session tracks what the endpoint itself needs: transmit counters
//! fed by the send path, a per-SSRC member table fed by the receive
//! path (packet counts, extended highest sequence, RFC 3550 A.8
//! interarrival jitter), and bookkeeping from received SR/BYE packets.
//! Generating and scheduling outbound reports is out of scope; the
//! application ships its own packets with
//! [`crate::RtpEndpoint::rtcp_send`].

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::rtcp::{RtcpMsg, RtcpPacket};

/// Transmit-side counters.
#[derive(Debug, Clone, Default)]
pub struct TxStats {
    /// RTP packets sent
    pub packets: u32,
    /// Payload octets sent
    pub octets: u32,
    /// RTP timestamp of the last packet sent
    pub last_ts: u32,
}

/// Snapshot of one received source.
#[derive(Debug, Clone)]
pub struct MemberStats {
    /// RTP packets received from this source
    pub packets: u32,
    /// Payload octets received from this source
    pub octets: u32,
    /// Extended highest sequence number received
    pub extended_seq: u32,
    /// Interarrival jitter estimate, in timestamp units
    pub jitter: u32,
    /// Middle 32 bits of the NTP timestamp in the last SR, 0 if none
    pub last_sr: u32,
}

struct Member {
    packets: u32,
    octets: u32,
    max_seq: u16,
    cycles: u32,
    /// scaled by 16 per RFC 3550 A.8
    jitter: u32,
    /// previous packet's transit time, None until two packets seen
    transit: Option<i64>,
    last_sr: u32,
}

impl Member {
    fn new(seq: u16) -> Self {
        Member {
            packets: 0,
            octets: 0,
            max_seq: seq,
            cycles: 0,
            jitter: 0,
            transit: None,
            last_sr: 0,
        }
    }

    fn extended_seq(&self) -> u32 {
        self.cycles.wrapping_add(self.max_seq as u32)
    }
}

struct Inner {
    enabled: bool,
    cname: Option<String>,
    tx: TxStats,
    members: HashMap<u32, Member>,
}

/// Per-endpoint RTCP session.
pub struct RtcpSession {
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl RtcpSession {
    pub(crate) fn new() -> Self {
        RtcpSession {
            epoch: Instant::now(),
            inner: Mutex::new(Inner {
                enabled: false,
                cname: None,
                tx: TxStats::default(),
                members: HashMap::new(),
            }),
        }
    }

    pub(crate) fn enable(&self, enabled: bool, cname: &str) {
        let mut inner = self.inner.lock();
        inner.enabled = enabled;
        inner.cname = Some(cname.to_string());
    }

    /// True once [`crate::RtpEndpoint::rtcp_start`] ran with a peer.
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Canonical name given at session start.
    pub fn cname(&self) -> Option<String> {
        self.inner.lock().cname.clone()
    }

    /// Account one sent RTP packet.
    pub(crate) fn tx_rtp(&self, ts: u32, payload_len: usize) {
        let mut inner = self.inner.lock();
        inner.tx.packets = inner.tx.packets.wrapping_add(1);
        inner.tx.octets = inner.tx.octets.wrapping_add(payload_len as u32);
        inner.tx.last_ts = ts;
    }

    /// Account one received RTP packet.
    pub(crate) fn rx_rtp(&self, seq: u16, ts: u32, ssrc: u32, payload_len: usize) {
        // arrival time in 8 kHz timestamp units
        let arrival = (self.epoch.elapsed().as_millis() as u64).wrapping_mul(8) as u32;
        self.rx_rtp_at(seq, ts, ssrc, payload_len, arrival);
    }

    fn rx_rtp_at(&self, seq: u16, ts: u32, ssrc: u32, payload_len: usize, arrival: u32) {
        let mut inner = self.inner.lock();
        let member = inner
            .members
            .entry(ssrc)
            .or_insert_with(|| Member::new(seq));

        member.packets = member.packets.wrapping_add(1);
        member.octets = member.octets.wrapping_add(payload_len as u32);

        // extended sequence tracking with wrap detection
        let udelta = seq.wrapping_sub(member.max_seq);
        if udelta != 0 && udelta < 0x8000 {
            if seq < member.max_seq {
                member.cycles = member.cycles.wrapping_add(0x1_0000);
            }
            member.max_seq = seq;
        }

        // interarrival jitter, RFC 3550 Appendix A.8
        let transit = arrival as i64 - ts as i64;
        if let Some(prev) = member.transit {
            let d = (transit - prev).abs();
            let j = member.jitter as i64 + d - ((member.jitter as i64 + 8) >> 4);
            member.jitter = j.max(0) as u32;
        }
        member.transit = Some(transit);
    }

    /// Digest a received RTCP packet.
    pub(crate) fn handle(&self, msg: &RtcpMsg) {
        match &msg.packet {
            RtcpPacket::SenderReport(sr) => {
                let mut inner = self.inner.lock();
                let member = inner
                    .members
                    .entry(sr.ssrc)
                    .or_insert_with(|| Member::new(0));
                member.last_sr = sr.ntp.middle_32();
            }
            RtcpPacket::Goodbye(bye) => {
                let mut inner = self.inner.lock();
                for ssrc in &bye.sources {
                    if inner.members.remove(ssrc).is_some() {
                        debug!("RTCP member 0x{:08x} left", ssrc);
                    }
                }
            }
            _ => {}
        }
    }

    /// Transmit counters.
    pub fn tx_stats(&self) -> TxStats {
        self.inner.lock().tx.clone()
    }

    /// Number of known receive members.
    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Snapshot of one member.
    pub fn member(&self, ssrc: u32) -> Option<MemberStats> {
        let inner = self.inner.lock();
        inner.members.get(&ssrc).map(|m| MemberStats {
            packets: m.packets,
            octets: m.octets,
            extended_seq: m.extended_seq(),
            jitter: m.jitter >> 4,
            last_sr: m.last_sr,
        })
    }
}
