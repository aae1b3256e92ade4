//! RTSP server: TCP (optionally TLS) listener, connection management and
//! message send helpers.
//!
//! Every accepted connection runs its own receive task which appends
//! socket reads to a pending buffer and drains complete messages with
//! [`RtspMessage::decode`]. Messages are delivered as [`RtspEvent`]s on
//! the channel returned by [`RtspServer::listen`]. A connection is torn
//! down on decode errors other than "need more data", on input-buffer
//! overflow, on peer close, and when no complete message arrives within
//! the initial (10 s) or idle (600 s) window.

use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout_at, Instant};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::RtspMessage;

/// Close an idle connection after this long without a complete message.
pub const TIMEOUT_IDLE: Duration = Duration::from_secs(600);

/// Close a fresh connection that has not produced a message in time.
pub const TIMEOUT_INIT: Duration = Duration::from_secs(10);

/// Hard cap on per-connection buffered input.
const BUFSIZE_MAX: usize = 524_288;

/// Event channel capacity.
const CHANNEL_CAPACITY: usize = 100;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Events delivered by an [`RtspServer`].
#[derive(Debug)]
pub enum RtspEvent {
    /// A complete message arrived on a connection
    Message {
        /// Connection the message arrived on
        conn: RtspConnection,
        /// The parsed message
        msg: RtspMessage,
    },
    /// A connection was torn down
    Closed {
        /// The connection that went away
        conn: RtspConnection,
        /// Why it was dropped ([`Error::Timeout`], [`Error::Overflow`],
        /// a decode error, or an I/O error); `None` for a peer-initiated
        /// or locally requested close
        error: Option<Error>,
    },
}

/// RTSP listening socket.
///
/// Owns its connections: dropping the server (or calling
/// [`RtspServer::close`]) stops the accept loop and closes every
/// connection.
#[derive(Clone)]
pub struct RtspServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    local_addr: SocketAddr,
    conns: parking_lot::Mutex<Vec<RtspConnection>>,
    closed: AtomicBool,
    accept_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RtspServer {
    /// Listen for plain-TCP RTSP connections.
    pub async fn listen(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<RtspEvent>)> {
        Self::listen_with(addr, None).await
    }

    /// Listen for TLS RTSP connections.
    ///
    /// `cert` is a PEM file carrying the certificate chain and the
    /// private key. Client certificates are not requested.
    pub async fn listen_secure(
        addr: SocketAddr,
        cert: &Path,
    ) -> Result<(Self, mpsc::Receiver<RtspEvent>)> {
        let acceptor = tls_acceptor(cert)?;
        Self::listen_with(addr, Some(acceptor)).await
    }

    async fn listen_with(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) -> Result<(Self, mpsc::Receiver<RtspEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("RTSP server listening on {}", local_addr);

        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let inner = Arc::new(ServerInner {
            local_addr,
            conns: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            accept_task: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(accept_loop(
            Arc::downgrade(&inner),
            listener,
            tls,
            events_tx,
        ));
        *inner.accept_task.lock() = Some(task);

        Ok((RtspServer { inner }, events_rx))
    }

    /// Local listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

impl ServerInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        for conn in self.conns.lock().drain(..) {
            conn.close();
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RtspServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RtspServer({})", self.inner.local_addr)
    }
}

async fn accept_loop(
    server: Weak<ServerInner>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    events_tx: mpsc::Sender<RtspEvent>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("RTSP accept error: {}", e);
                continue;
            }
        };

        let Some(inner) = server.upgrade() else { break };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        let tls = tls.clone();
        let events_tx = events_tx.clone();
        let server = Arc::downgrade(&inner);
        drop(inner);

        tokio::spawn(async move {
            let local = stream.local_addr().ok();
            let (rd, wr) = match setup_stream(stream, tls).await {
                Ok(v) => v,
                Err(e) => {
                    // reject the connection outright
                    warn!("RTSP connection from {} rejected: {}", peer, e);
                    return;
                }
            };

            let Some(inner) = server.upgrade() else { return };
            let conn = RtspConnection::new(Arc::downgrade(&inner), peer, local, wr);
            inner.conns.lock().push(conn.clone());
            drop(inner);

            debug!("RTSP connection from {}", peer);
            conn_task(conn, rd, events_tx).await;
        });
    }
}

async fn setup_stream(stream: TcpStream, tls: Option<TlsAcceptor>) -> Result<(Reader, Writer)> {
    match tls {
        None => {
            let (rd, wr) = tokio::io::split(stream);
            Ok((Box::new(rd), Box::new(wr)))
        }
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            let (rd, wr) = tokio::io::split(stream);
            Ok((Box::new(rd), Box::new(wr)))
        }
    }
}

fn tls_acceptor(cert: &Path) -> Result<TlsAcceptor> {
    let pem = std::fs::read(cert)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Tls(format!("bad certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate in file".into()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Tls(format!("bad private key: {}", e)))?
        .ok_or_else(|| Error::Tls("no private key in file".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Per-connection receive loop: buffer, drain, deliver, re-arm timers.
///
/// The timers are absolute deadlines: the initial window starts at
/// accept and only a complete delivered message re-arms the idle
/// window. Partial reads never touch the deadline, so a peer trickling
/// bytes cannot hold the connection open.
async fn conn_task(conn: RtspConnection, mut rd: Reader, events: mpsc::Sender<RtspEvent>) {
    let mut pending = BytesMut::with_capacity(2048);
    let mut deadline = Instant::now() + TIMEOUT_INIT;

    let error = 'outer: loop {
        let read = tokio::select! {
            _ = conn.inner.shutdown.notified() => break None,
            r = timeout_at(deadline, rd.read_buf(&mut pending)) => r,
        };

        match read {
            Err(_) => break Some(Error::Timeout),
            Ok(Err(e)) => break Some(Error::Io(e)),
            Ok(Ok(0)) => {
                debug!("RTSP connection {} closed by peer", conn.peer());
                break None;
            }
            Ok(Ok(_)) => {}
        }

        if pending.len() > BUFSIZE_MAX {
            break Some(Error::Overflow);
        }

        loop {
            match RtspMessage::decode(&mut pending) {
                Ok(msg) => {
                    deadline = Instant::now() + TIMEOUT_IDLE;
                    if events
                        .send(RtspEvent::Message {
                            conn: conn.clone(),
                            msg,
                        })
                        .await
                        .is_err()
                    {
                        break 'outer None;
                    }
                    if conn.is_closed() {
                        break 'outer None;
                    }
                }
                Err(Error::NeedMoreData) => break,
                Err(e) => break 'outer Some(e),
            }
        }
    };

    match &error {
        Some(Error::Timeout) => debug!("RTSP connection {} timed out", conn.peer()),
        Some(err) => warn!("RTSP connection {} dropped: {}", conn.peer(), err),
        None => {}
    }

    conn.teardown().await;
    let _ = events.send(RtspEvent::Closed { conn, error }).await;
}

/// One accepted RTSP connection.
///
/// Cheap to clone; all clones refer to the same connection. The server
/// owns the connection, a connection only holds a weak back-reference.
#[derive(Clone)]
pub struct RtspConnection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: u64,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    server: Weak<ServerInner>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl RtspConnection {
    fn new(
        server: Weak<ServerInner>,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        writer: Writer,
    ) -> Self {
        RtspConnection {
            inner: Arc::new(ConnInner {
                id: CONN_COUNTER.fetch_add(1, Ordering::Relaxed),
                peer,
                local,
                server,
                writer: tokio::sync::Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Peer address.
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Local address of the accepted socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    /// True once the connection is closed or closing.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. The receive task detaches it from the
    /// server and emits [`RtspEvent::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
    }

    /// Detach from the server list and drop the transport handles.
    async fn teardown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(server) = self.inner.server.upgrade() {
            server.conns.lock().retain(|c| c.inner.id != self.inner.id);
        }
        let mut guard = self.inner.writer.lock().await;
        if let Some(mut wr) = guard.take() {
            let _ = wr.shutdown().await;
        }
    }

    async fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let mut guard = self.inner.writer.lock().await;
        let Some(wr) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        let res = async {
            wr.write_all(data).await?;
            wr.flush().await
        }
        .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                self.close();
                Err(Error::Io(e))
            }
        }
    }

    /// Send a response.
    ///
    /// `headers`, when given, is a pre-formatted header block including
    /// the terminating blank line; otherwise `Content-Length: 0` is
    /// sent. The assembled message is parsed back before the write and a
    /// parse failure aborts the send.
    pub async fn reply(
        &self,
        ver: u8,
        code: u16,
        reason: &str,
        headers: Option<&str>,
    ) -> Result<()> {
        let mut out = format!("RTSP/{}.0 {} {}\r\n", ver, code, reason);
        out.push_str(headers.unwrap_or("Content-Length: 0\r\n\r\n"));
        check_parse(out.as_bytes())?;
        self.write_all(out.as_bytes()).await
    }

    /// Send a response carrying a body.
    ///
    /// `headers`, when given, is a pre-formatted partial header block
    /// (no terminating blank line); Content-Type and Content-Length are
    /// appended here.
    pub async fn creply(
        &self,
        ver: u8,
        code: u16,
        reason: &str,
        ctype: &str,
        body: &[u8],
        headers: Option<&str>,
    ) -> Result<()> {
        let mut head = format!("RTSP/{}.0 {} {}\r\n", ver, code, reason);
        if let Some(h) = headers {
            head.push_str(h);
        }
        let _ = write!(
            head,
            "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
            ctype,
            body.len()
        );

        let mut out = BytesMut::with_capacity(head.len() + body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(body);
        check_parse(&out)?;
        self.write_all(&out).await
    }

    /// Send a request on this connection.
    ///
    /// Returns the self-parsed outbound message.
    pub async fn send_request(
        &self,
        ver: u8,
        method: &str,
        path: &str,
        headers: Option<&str>,
    ) -> Result<RtspMessage> {
        let mut out = format!("{} {} RTSP/{}.0\r\n", method, path, ver);
        out.push_str(headers.unwrap_or("Content-Length: 0\r\n\r\n"));
        let msg = check_parse(out.as_bytes())?;
        self.write_all(out.as_bytes()).await?;
        Ok(msg)
    }

    /// Send a request carrying a body; see [`RtspConnection::creply`]
    /// for the `headers` convention.
    pub async fn send_crequest(
        &self,
        ver: u8,
        method: &str,
        path: &str,
        ctype: &str,
        body: &[u8],
        headers: Option<&str>,
    ) -> Result<RtspMessage> {
        let mut head = format!("{} {} RTSP/{}.0\r\n", method, path, ver);
        if let Some(h) = headers {
            head.push_str(h);
        }
        let _ = write!(
            head,
            "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
            ctype,
            body.len()
        );

        let mut out = BytesMut::with_capacity(head.len() + body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(body);
        let msg = check_parse(&out)?;
        self.write_all(&out).await?;
        Ok(msg)
    }

    /// Send an interleaved-data frame: `0x24 channel length payload`.
    pub async fn send_ild(&self, channel: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument("interleaved payload too large"));
        }
        let mut out = BytesMut::with_capacity(4 + payload.len());
        out.put_u8(0x24);
        out.put_u8(channel);
        out.put_u16(payload.len() as u16);
        out.extend_from_slice(payload);
        self.write_all(&out).await
    }
}

impl fmt::Debug for RtspConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RtspConnection({})", self.inner.peer)
    }
}

/// Parse an assembled outbound message back, as a guard against corrupt
/// header formatting.
fn check_parse(bytes: &[u8]) -> Result<RtspMessage> {
    let mut probe = BytesMut::from(bytes);
    let msg = RtspMessage::decode(&mut probe)?;
    if !probe.is_empty() {
        return Err(Error::Malformed("outbound message has trailing bytes"));
    }
    Ok(msg)
}
