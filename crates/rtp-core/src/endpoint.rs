//! RTP endpoint: socket management, send/receive paths and RTCP demux.
//!
//! An endpoint owns one or two UDP sockets (RTP, optionally RTCP on the
//! next port up) or rides inside an RTSP TCP connection as interleaved
//! data. Received traffic is delivered as [`RtpEvent`]s on the channel
//! returned by the listen constructors; when RTP/RTCP multiplexing is
//! enabled, packets whose payload-type field falls in the RTCP range
//! [64, 95] are routed to the RTCP parser instead of the RTP decoder.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use rmedia_rtsp_core::RtspConnection;

use crate::error::{Error, Result};
use crate::packet::{RtpHeader, RTP_HEADER_SIZE, RTP_VERSION};
use crate::rtcp::RtcpMsg;
use crate::session::RtcpSession;

/// Event channel capacity.
const CHANNEL_CAPACITY: usize = 100;

/// Receive buffer size; large enough for any UDP media packet.
const RECV_BUF_SIZE: usize = 2048;

/// Port probes attempted when binding into a range.
const PORT_TRIES: u16 = 64;

/// Transport an endpoint runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpTransport {
    /// Datagram sockets
    Udp,
    /// Interleaved data on an RTSP TCP connection
    TcpInterleaved,
}

/// Events delivered by an [`RtpEndpoint`].
#[derive(Debug)]
pub enum RtpEvent {
    /// A decoded RTP packet
    Packet {
        /// Sender address
        src: SocketAddr,
        /// Decoded header
        header: RtpHeader,
        /// Payload following the header
        payload: Bytes,
    },
    /// A decoded RTCP packet
    Rtcp {
        /// Sender address
        src: SocketAddr,
        /// Decoded packet
        msg: RtcpMsg,
    },
}

struct EncodeState {
    seq: u16,
    ssrc: u32,
}

struct EndpointInner {
    proto: RtpTransport,
    rtp_sock: Option<Arc<UdpSocket>>,
    rtcp_sock: Option<Arc<UdpSocket>>,
    ild: Option<(u8, RtspConnection)>,
    local: Option<SocketAddr>,
    enc: parking_lot::Mutex<EncodeState>,
    rtcp: Option<Arc<RtcpSession>>,
    rtcp_peer: parking_lot::Mutex<Option<SocketAddr>>,
    rtcp_mux: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// RTP/RTCP endpoint.
///
/// Cheap to clone; all clones refer to the same sockets and encoder
/// state. Dropping the last clone stops the receive tasks and releases
/// the sockets.
#[derive(Clone)]
pub struct RtpEndpoint {
    inner: Arc<EndpointInner>,
}

fn random_encode_state() -> EncodeState {
    let mut rng = rand::thread_rng();
    EncodeState {
        // 15-bit initial sequence leaves room before the first wrap
        seq: rng.gen::<u16>() & 0x7fff,
        ssrc: rng.gen(),
    }
}

impl RtpEndpoint {
    fn from_parts(
        proto: RtpTransport,
        rtp_sock: Option<Arc<UdpSocket>>,
        rtcp_sock: Option<Arc<UdpSocket>>,
        ild: Option<(u8, RtspConnection)>,
        local: Option<SocketAddr>,
        rtcp: Option<Arc<RtcpSession>>,
    ) -> Self {
        RtpEndpoint {
            inner: Arc::new(EndpointInner {
                proto,
                rtp_sock,
                rtcp_sock,
                ild,
                local,
                enc: parking_lot::Mutex::new(random_encode_state()),
                rtcp,
                rtcp_peer: parking_lot::Mutex::new(None),
                rtcp_mux: Arc::new(AtomicBool::new(false)),
                shutdown: Arc::new(Notify::new()),
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Endpoint with fresh encoder counters and no sockets.
    ///
    /// Useful for header encode/decode without any transport.
    pub fn new() -> Self {
        Self::from_parts(RtpTransport::Udp, None, None, None, None, None)
    }

    /// Bind RTP to an even port in `[min_port, max_port]` and RTCP to
    /// the next port up.
    ///
    /// When the range holds fewer than 64 ports every even port is
    /// probed in order; otherwise up to 64 random even ports are tried.
    pub async fn listen(
        local_ip: IpAddr,
        min_port: u16,
        max_port: u16,
        enable_rtcp: bool,
    ) -> Result<(Self, mpsc::Receiver<RtpEvent>)> {
        if min_port >= max_port {
            return Err(Error::InvalidArgument("empty port range"));
        }

        let (rtp_sock, rtcp_sock) = bind_pair(local_ip, min_port, max_port).await?;
        let local = rtp_sock.local_addr()?;
        info!("RTP endpoint bound to {} (RTCP on {})", local, local.port() + 1);

        let rtp_sock = Arc::new(rtp_sock);
        let rtcp_sock = Arc::new(rtcp_sock);
        let rtcp = enable_rtcp.then(|| Arc::new(RtcpSession::new()));

        let endpoint = Self::from_parts(
            RtpTransport::Udp,
            Some(rtp_sock.clone()),
            Some(rtcp_sock.clone()),
            None,
            Some(local),
            rtcp.clone(),
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        endpoint.spawn_rtp_loop(rtp_sock, tx.clone());
        endpoint.spawn_rtcp_loop(rtcp_sock, tx);

        Ok((endpoint, rx))
    }

    /// Single-socket playback endpoint without RTCP.
    ///
    /// Joins the multicast group when `local` is an IPv4 multicast
    /// address.
    pub async fn listen_play(local: SocketAddr) -> Result<(Self, mpsc::Receiver<RtpEvent>)> {
        let sock = UdpSocket::bind(local).await?;

        if let IpAddr::V4(ip) = local.ip() {
            if ip.is_multicast() {
                sock.join_multicast_v4(ip, std::net::Ipv4Addr::UNSPECIFIED)?;
                debug!("joined multicast group {}", ip);
            }
        }

        let local = sock.local_addr()?;
        let sock = Arc::new(sock);
        let endpoint = Self::from_parts(
            RtpTransport::Udp,
            Some(sock.clone()),
            None,
            None,
            Some(local),
            None,
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        endpoint.spawn_rtp_loop(sock, tx);

        Ok((endpoint, rx))
    }

    /// Send-only endpoint on an unbound port.
    pub async fn open(local_ip: IpAddr) -> Result<Self> {
        let sock = UdpSocket::bind((local_ip, 0)).await?;
        let local = sock.local_addr()?;
        Ok(Self::from_parts(
            RtpTransport::Udp,
            Some(Arc::new(sock)),
            None,
            None,
            Some(local),
            None,
        ))
    }

    /// Endpoint sending interleaved data on an RTSP connection; the
    /// channel number takes the place of the RTP port.
    pub fn over_tcp(channel: u8, conn: RtspConnection) -> Self {
        Self::from_parts(
            RtpTransport::TcpInterleaved,
            None,
            None,
            Some((channel, conn)),
            None,
            None,
        )
    }

    fn spawn_rtp_loop(&self, sock: Arc<UdpSocket>, tx: mpsc::Sender<RtpEvent>) {
        let mux = self.inner.rtcp_mux.clone();
        let rtcp = self.inner.rtcp.clone();
        let shutdown = self.inner.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            loop {
                let (n, src) = tokio::select! {
                    _ = shutdown.notified() => break,
                    r = sock.recv_from(&mut buf) => match r {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("RTP receive error: {}", e);
                            break;
                        }
                    },
                };

                let mut pkt = Bytes::copy_from_slice(&buf[..n]);

                // RTCP multiplexed on the RTP port
                if mux.load(Ordering::Relaxed) && n >= 2 {
                    let pt = buf[1] & 0x7f;
                    if (64..=95).contains(&pt) {
                        if !deliver_rtcp(&rtcp, src, pkt, &tx).await {
                            break;
                        }
                        continue;
                    }
                }

                let header = match RtpHeader::decode(&mut pkt) {
                    Ok(h) if h.version == RTP_VERSION => h,
                    Ok(_) => {
                        debug!("dropping RTP packet with bad version from {}", src);
                        continue;
                    }
                    Err(e) => {
                        debug!("dropping malformed RTP packet from {}: {}", src, e);
                        continue;
                    }
                };

                if let Some(sess) = &rtcp {
                    sess.rx_rtp(header.sequence, header.timestamp, header.ssrc, pkt.len());
                }

                if tx
                    .send(RtpEvent::Packet {
                        src,
                        header,
                        payload: pkt,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    fn spawn_rtcp_loop(&self, sock: Arc<UdpSocket>, tx: mpsc::Sender<RtpEvent>) {
        let rtcp = self.inner.rtcp.clone();
        let shutdown = self.inner.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            loop {
                let (n, src) = tokio::select! {
                    _ = shutdown.notified() => break,
                    r = sock.recv_from(&mut buf) => match r {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("RTCP receive error: {}", e);
                            break;
                        }
                    },
                };

                let pkt = Bytes::copy_from_slice(&buf[..n]);
                if !deliver_rtcp(&rtcp, src, pkt, &tx).await {
                    break;
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Append a fresh RTP header to `buf` using the encoder counters.
    /// The sequence number post-increments.
    pub fn encode(
        &self,
        ext: bool,
        marker: bool,
        pt: u8,
        ts: u32,
        buf: &mut BytesMut,
    ) -> Result<()> {
        if pt & !0x7f != 0 {
            return Err(Error::InvalidArgument("payload type exceeds 7 bits"));
        }

        let mut enc = self.inner.enc.lock();
        let header = RtpHeader {
            version: RTP_VERSION,
            extension: ext,
            marker,
            payload_type: pt,
            sequence: enc.seq,
            timestamp: ts,
            ssrc: enc.ssrc,
            ..Default::default()
        };
        enc.seq = enc.seq.wrapping_add(1);
        drop(enc);

        header.encode(buf)
    }

    /// Decode an RTP packet, leaving `buf` at the payload.
    pub fn decode(&self, buf: &mut Bytes) -> Result<RtpHeader> {
        let header = RtpHeader::decode(buf)?;
        if header.version != RTP_VERSION {
            return Err(Error::Malformed("rtp version"));
        }
        Ok(header)
    }

    /// Build and send one RTP packet carrying `payload`.
    pub async fn send(
        &self,
        dst: SocketAddr,
        ext: bool,
        marker: bool,
        pt: u8,
        ts: u32,
        payload: &[u8],
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        self.encode(ext, marker, pt, ts, &mut buf)?;
        buf.extend_from_slice(payload);

        if let Some(sess) = &self.inner.rtcp {
            sess.tx_rtp(ts, payload.len());
        }

        match self.inner.proto {
            RtpTransport::Udp => {
                let sock = self.inner.rtp_sock.as_ref().ok_or(Error::NotConnected)?;
                sock.send_to(&buf, dst).await?;
                Ok(())
            }
            RtpTransport::TcpInterleaved => {
                let (channel, conn) = self.inner.ild.as_ref().ok_or(Error::NotConnected)?;
                conn.send_ild(*channel, &buf).await?;
                Ok(())
            }
        }
    }

    /// Begin the RTCP session: record the peer address and enable the
    /// session state with the given canonical name.
    pub fn rtcp_start(&self, cname: &str, peer: Option<SocketAddr>) {
        *self.inner.rtcp_peer.lock() = peer;
        if let Some(sess) = &self.inner.rtcp {
            sess.enable(peer.is_some(), cname);
        }
    }

    /// Enable or disable RTCP demultiplexing on the RTP port.
    pub fn rtcp_mux(&self, enabled: bool) {
        self.inner.rtcp_mux.store(enabled, Ordering::Relaxed);
    }

    /// Send an RTCP packet to the recorded peer, on the RTP socket when
    /// multiplexing is enabled and on the RTCP socket otherwise.
    pub async fn rtcp_send(&self, packet: &[u8]) -> Result<()> {
        let peer = (*self.inner.rtcp_peer.lock()).ok_or(Error::NotConnected)?;
        let sock = if self.inner.rtcp_mux.load(Ordering::Relaxed) {
            self.inner.rtp_sock.as_ref()
        } else {
            self.inner.rtcp_sock.as_ref()
        }
        .ok_or(Error::NotConnected)?;

        sock.send_to(packet, peer).await?;
        Ok(())
    }

    /// Local RTP address, when bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    /// The endpoint's synchronisation source.
    pub fn ssrc(&self) -> u32 {
        self.inner.enc.lock().ssrc
    }

    /// Transport the endpoint runs on.
    pub fn proto(&self) -> RtpTransport {
        self.inner.proto
    }

    /// Interleaved channel number, for TCP endpoints.
    pub fn channel(&self) -> Option<u8> {
        self.inner.ild.as_ref().map(|(ch, _)| *ch)
    }

    /// The RTCP session, when enabled at listen time.
    pub fn rtcp_session(&self) -> Option<Arc<RtcpSession>> {
        self.inner.rtcp.clone()
    }

    /// Stop the receive tasks and release the sockets.
    pub fn close(&self) {
        self.inner.shutdown.notify_waiters();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Default for RtpEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RtpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.local {
            Some(addr) => write!(f, "RtpEndpoint({})", addr),
            None => write!(f, "RtpEndpoint(unbound)"),
        }
    }
}

/// Parse a compound RTCP packet, feed the session and deliver events.
/// Returns false when the event channel is gone.
async fn deliver_rtcp(
    rtcp: &Option<Arc<RtcpSession>>,
    src: SocketAddr,
    mut buf: Bytes,
    tx: &mpsc::Sender<RtpEvent>,
) -> bool {
    while !buf.is_empty() {
        match RtcpMsg::decode(&mut buf) {
            Ok(msg) => {
                if let Some(sess) = rtcp {
                    sess.handle(&msg);
                }
                if tx.send(RtpEvent::Rtcp { src, msg }).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                debug!("RTCP decode error from {}: {}", src, e);
                break;
            }
        }
    }
    true
}

/// Round down to even, bumped back into range.
fn force_even(port: u16, min_port: u16) -> u16 {
    let port = port & !1;
    if port < min_port {
        port + 2
    } else {
        port
    }
}

/// Bind an even RTP port and the RTCP port above it.
async fn bind_pair(ip: IpAddr, min_port: u16, max_port: u16) -> Result<(UdpSocket, UdpSocket)> {
    let span = max_port - min_port;

    let candidates: Vec<u16> = if span < PORT_TRIES {
        let mut ports = Vec::new();
        let mut port = force_even(min_port, min_port);
        while port < max_port {
            ports.push(port);
            port = match port.checked_add(2) {
                Some(p) => p,
                None => break,
            };
        }
        ports
    } else {
        let mut rng = rand::thread_rng();
        (0..PORT_TRIES)
            .map(|_| force_even(min_port + rng.gen_range(0..span), min_port))
            .collect()
    };

    for port in candidates {
        if port > max_port || port == u16::MAX {
            continue;
        }
        let rtp = match UdpSocket::bind((ip, port)).await {
            Ok(sock) => sock,
            Err(_) => continue,
        };
        match UdpSocket::bind((ip, port + 1)).await {
            Ok(rtcp) => return Ok((rtp, rtcp)),
            Err(_) => continue,
        }
    }

    Err(Error::AddressUnavailable)
}
