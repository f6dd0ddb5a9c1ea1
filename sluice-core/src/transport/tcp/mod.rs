//! Non-blocking TCP engine
//!
//! Connections are opened with `socket2` (keep-alive and `TCP_NODELAY`
//! applied before connecting) and polled without blocking on every
//! `service` call. Writes the kernel does not take right away are buffered
//! per connection and flushed before the next writable callback, so a write
//! is always accepted in full.
//!
//! Besides raw byte sessions the engine speaks plaintext HTTP/1.1
//! ([`http1`], parsed with `httparse`) and plaintext WebSocket
//! ([`websocket`], framed by `tungstenite`). TLS targets are refused.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use tracing::{debug, trace};

use super::{
    Connection, Event, EventSink, Kind, NoopWake, Target, Token, Transport, Verdict, Wake,
    WriteKind,
};
use crate::error::{Result, SluiceError};
use crate::options::{Keepalive, ReactorOptions};

pub(crate) mod http1;
pub(crate) mod websocket;

use http1::{Http1, Piece};
use websocket::{WsLink, WsRead};

/// Size of the per-engine receive buffer.
pub(crate) const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Inbound chunks delivered per connection per `service` call.
pub(crate) const MAX_READS_PER_SERVICE: usize = 4;

/// Build a keep-alive description for `socket2`.
fn tcp_keepalive(keepalive: &Keepalive) -> TcpKeepalive {
    let ka = TcpKeepalive::new()
        .with_time(keepalive.time)
        .with_interval(keepalive.interval);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd"
    ))]
    let ka = ka.with_retries(keepalive.probes);
    ka
}

/// Open a non-blocking socket and start connecting it.
fn start_connect(addr: SocketAddr, config: &TcpConfig) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(config.nodelay)?;
    socket.set_keepalive(true)?;
    socket.set_tcp_keepalive(&tcp_keepalive(&config.keepalive))?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const EINPROGRESS: i32 = 115;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        const EINPROGRESS: i32 = 36;
        e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(EINPROGRESS)
    }
    #[cfg(not(unix))]
    {
        e.kind() == io::ErrorKind::WouldBlock
    }
}

/// Socket settings shared by outgoing and accepted connections.
#[derive(Debug, Clone)]
pub(crate) struct TcpConfig {
    pub(crate) keepalive: Keepalive,
    pub(crate) nodelay: bool,
    pub(crate) connect_timeout: Duration,
}

impl TcpConfig {
    pub(crate) fn from_options(options: &ReactorOptions) -> Self {
        Self {
            keepalive: options.keepalive,
            nodelay: options.tcp_nodelay,
            connect_timeout: options.connect_timeout,
        }
    }

    /// Make an accepted stream non-blocking and apply keep-alive and nodelay.
    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.nodelay)?;
        let socket = SockRef::from(stream);
        socket.set_keepalive(true)?;
        socket.set_tcp_keepalive(&tcp_keepalive(&self.keepalive))
    }
}

/// Bytes accepted for a stream but not yet taken by the kernel.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pending: Vec<u8>,
}

impl Outbox {
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write as much of `data` as the kernel takes now and keep the rest,
    /// behind anything already buffered.
    pub(crate) fn send(&mut self, stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            return Ok(());
        }
        let written = write_some(stream, data)?;
        self.pending.extend_from_slice(&data[written..]);
        Ok(())
    }

    /// Push buffered bytes to the kernel until it stops taking them.
    pub(crate) fn flush(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        let written = write_some(stream, &self.pending)?;
        self.pending.drain(..written);
        Ok(())
    }
}

fn write_some(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    /// WebSocket upgrade in progress
    Upgrading,
    Open,
    Done,
}

enum Proto {
    Raw,
    Http(Http1),
    WebSocket(WsLink),
}

struct TcpConn {
    stream: TcpStream,
    peer: SocketAddr,
    phase: Phase,
    started: Instant,
    want_writable: bool,
    outbox: Outbox,
    proto: Proto,
}

impl Connection for TcpConn {
    fn write(&mut self, data: &[u8], kind: WriteKind) -> io::Result<usize> {
        match (&mut self.proto, kind) {
            (Proto::Raw, WriteKind::Raw) => {}
            (Proto::Http(http), WriteKind::HttpFinal) => {
                if let Some(head) = http.take_head() {
                    self.outbox.send(&mut self.stream, &head)?;
                }
            }
            (Proto::WebSocket(link), WriteKind::Text | WriteKind::Binary) => {
                link.send(data, kind == WriteKind::Binary)?;
                return Ok(data.len());
            }
            (_, kind) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{kind:?} write does not fit this connection"),
                ));
            }
        }
        self.outbox.send(&mut self.stream, data)?;
        Ok(data.len())
    }

    fn request_writable(&mut self) {
        self.want_writable = true;
    }

    fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        match &mut self.proto {
            Proto::Http(http) => http.append_header(name, value),
            _ => Err(SluiceError::transport("only http requests carry headers")),
        }
    }

    fn set_body_pending(&mut self, pending: bool) {
        if let Proto::Http(http) = &mut self.proto {
            http.body_pending = pending;
        }
    }
}

/// TCP transport engine.
pub struct TcpTransport {
    config: TcpConfig,
    conns: HashMap<Token, TcpConn>,
    buf: Box<[u8]>,
    waker: Arc<NoopWake>,
}

impl TcpTransport {
    pub fn new(options: &ReactorOptions) -> Self {
        Self {
            config: TcpConfig::from_options(options),
            conns: HashMap::new(),
            buf: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            waker: Arc::new(NoopWake),
        }
    }

    /// Factory suitable for [`crate::reactor::Reactor::start`].
    pub fn factory(options: &ReactorOptions) -> Result<Box<dyn Transport>> {
        Ok(Box::new(Self::new(options)))
    }

    /// Number of connections held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn step(
        token: Token,
        conn: &mut TcpConn,
        buf: &mut [u8],
        config: &TcpConfig,
        sink: &mut dyn EventSink,
    ) {
        if conn.phase == Phase::Connecting {
            match Self::poll_connect(conn, config) {
                Ok(false) => return,
                Ok(true) => {
                    debug!(token, peer = %conn.peer, "tcp connected");
                    if !Self::connected(token, conn, sink) {
                        return;
                    }
                }
                Err(e) => {
                    Self::fail(token, conn, sink, &e.to_string());
                    return;
                }
            }
        }

        if conn.phase == Phase::Upgrading {
            let Proto::WebSocket(link) = &mut conn.proto else {
                return;
            };
            match link.resume() {
                Ok(true) => {
                    if !Self::establish(token, conn, sink) {
                        return;
                    }
                }
                Ok(false) => {
                    Self::check_timeout(token, conn, config, sink);
                    return;
                }
                Err(reason) => {
                    Self::fail(token, conn, sink, &reason);
                    return;
                }
            }
        }

        match conn.proto {
            Proto::WebSocket(_) => Self::pump_websocket(token, conn, sink),
            Proto::Raw | Proto::Http(_) => Self::pump_stream(token, conn, buf, sink),
        }
    }

    /// TCP is up: upgrade WebSocket links, establish everything else.
    fn connected(token: Token, conn: &mut TcpConn, sink: &mut dyn EventSink) -> bool {
        let Proto::WebSocket(link) = &mut conn.proto else {
            return Self::establish(token, conn, sink);
        };
        conn.phase = Phase::Upgrading;
        let upgraded = conn
            .stream
            .try_clone()
            .map_err(|e| e.to_string())
            .and_then(|stream| link.begin(stream));
        match upgraded {
            Ok(true) => Self::establish(token, conn, sink),
            Ok(false) => false,
            Err(reason) => {
                Self::fail(token, conn, sink, &reason);
                false
            }
        }
    }

    /// Report `Established`; for HTTP, collect headers and send the head
    /// unless a body follows. Returns `false` if the connection ended.
    fn establish(token: Token, conn: &mut TcpConn, sink: &mut dyn EventSink) -> bool {
        conn.phase = Phase::Open;
        if sink.on_event(token, conn, Event::Established) == Verdict::Teardown {
            Self::close(token, conn, sink);
            return false;
        }
        if !matches!(conn.proto, Proto::Http(_)) {
            return true;
        }

        if sink.on_event(token, conn, Event::AppendHeaders) == Verdict::Teardown {
            Self::close(token, conn, sink);
            return false;
        }
        let Proto::Http(http) = &mut conn.proto else {
            return true;
        };
        if http.body_pending {
            return true;
        }
        let sent = match http.take_head() {
            Some(head) => conn.outbox.send(&mut conn.stream, &head),
            None => Ok(()),
        };
        if let Err(e) = sent {
            Self::fail(token, conn, sink, &e.to_string());
            return false;
        }
        true
    }

    fn pump_stream(token: Token, conn: &mut TcpConn, buf: &mut [u8], sink: &mut dyn EventSink) {
        if let Err(e) = conn.outbox.flush(&mut conn.stream) {
            debug!(token, error = %e, "tcp write failed");
            Self::close(token, conn, sink);
            return;
        }

        if conn.want_writable && conn.outbox.is_empty() {
            conn.want_writable = false;
            if sink.on_event(token, conn, Event::Writable) == Verdict::Teardown {
                Self::close(token, conn, sink);
                return;
            }
        }

        for _ in 0..MAX_READS_PER_SERVICE {
            match conn.stream.read(buf) {
                Ok(0) => {
                    trace!(token, "peer closed");
                    let truncated = match &conn.proto {
                        Proto::Http(http) => http.reader.eof().err(),
                        _ => None,
                    };
                    match truncated {
                        Some(reason) => Self::fail(token, conn, sink, &reason),
                        None => Self::close(token, conn, sink),
                    }
                    return;
                }
                Ok(n) => {
                    if !Self::deliver(token, conn, &buf[..n], sink) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(token, error = %e, "tcp read failed");
                    Self::close(token, conn, sink);
                    return;
                }
            }
        }
    }

    /// Hand inbound bytes to the sink. Returns `false` if the connection
    /// ended.
    fn deliver(token: Token, conn: &mut TcpConn, data: &[u8], sink: &mut dyn EventSink) -> bool {
        let Proto::Http(http) = &mut conn.proto else {
            let event = Event::Received { data, remaining: 0 };
            if sink.on_event(token, conn, event) == Verdict::Teardown {
                Self::close(token, conn, sink);
                return false;
            }
            return true;
        };
        let pieces = match http.reader.feed(data) {
            Ok(pieces) => pieces,
            Err(reason) => {
                Self::fail(token, conn, sink, &reason);
                return false;
            }
        };

        for piece in pieces {
            let verdict = match &piece {
                Piece::Head {
                    status,
                    content_type,
                } => {
                    trace!(token, status, "response head");
                    let head = Event::ResponseHead {
                        status: *status,
                        content_type: content_type.as_deref(),
                    };
                    sink.on_event(token, conn, head)
                }
                Piece::Body { data, remaining } => {
                    let event = Event::Received {
                        data: data.as_slice(),
                        remaining: *remaining,
                    };
                    sink.on_event(token, conn, event)
                }
                Piece::End => Verdict::Teardown,
            };
            if verdict == Verdict::Teardown {
                Self::close(token, conn, sink);
                return false;
            }
        }
        true
    }

    fn pump_websocket(token: Token, conn: &mut TcpConn, sink: &mut dyn EventSink) {
        let Proto::WebSocket(link) = &mut conn.proto else {
            return;
        };
        if let Err(e) = link.flush() {
            debug!(token, error = %e, "websocket write failed");
            Self::close(token, conn, sink);
            return;
        }

        if conn.want_writable {
            conn.want_writable = false;
            if sink.on_event(token, conn, Event::Writable) == Verdict::Teardown {
                Self::close(token, conn, sink);
                return;
            }
        }

        for _ in 0..MAX_READS_PER_SERVICE {
            let Proto::WebSocket(link) = &mut conn.proto else {
                return;
            };
            match link.read() {
                WsRead::Message(data) => {
                    let event = Event::Received {
                        data: &data[..],
                        remaining: 0,
                    };
                    if sink.on_event(token, conn, event) == Verdict::Teardown {
                        Self::close(token, conn, sink);
                        return;
                    }
                }
                WsRead::Idle => break,
                WsRead::Closed => {
                    trace!(token, "websocket closed by peer");
                    Self::close(token, conn, sink);
                    return;
                }
            }
        }
    }

    /// `Ok(true)` once connected, `Ok(false)` while still in progress.
    fn poll_connect(conn: &TcpConn, config: &TcpConfig) -> io::Result<bool> {
        if let Some(e) = conn.stream.take_error()? {
            return Err(e);
        }
        match conn.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                if Self::timed_out(conn, config) {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn timed_out(conn: &TcpConn, config: &TcpConfig) -> bool {
        let timeout = config.connect_timeout;
        !timeout.is_zero() && conn.started.elapsed() > timeout
    }

    fn check_timeout(token: Token, conn: &mut TcpConn, config: &TcpConfig, sink: &mut dyn EventSink) {
        if Self::timed_out(conn, config) {
            Self::fail(token, conn, sink, "websocket upgrade timed out");
        }
    }

    /// End with `ConnectionError` and `Destroyed`.
    fn fail(token: Token, conn: &mut TcpConn, sink: &mut dyn EventSink, reason: &str) {
        debug!(token, reason, "tcp connection failed");
        let _ = conn.stream.shutdown(Shutdown::Both);
        sink.on_event(token, conn, Event::ConnectionError(reason));
        conn.phase = Phase::Done;
        sink.on_event(token, conn, Event::Destroyed);
    }

    fn close(token: Token, conn: &mut TcpConn, sink: &mut dyn EventSink) {
        if let Proto::WebSocket(link) = &mut conn.proto {
            link.close();
        }
        let _ = conn.stream.shutdown(Shutdown::Both);
        sink.on_event(token, conn, Event::Closed);
        conn.phase = Phase::Done;
        sink.on_event(token, conn, Event::Destroyed);
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, token: Token, target: &Target) -> Result<()> {
        if target.tls {
            return Err(SluiceError::connection(format!(
                "{target}: tls not supported by tcp engine"
            )));
        }
        let proto = match target.kind {
            Kind::RawSocket => Proto::Raw,
            Kind::Http => Proto::Http(Http1::new(target)),
            Kind::WebSocket => Proto::WebSocket(WsLink::new(target)?),
        };
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SluiceError::connection(format!("{} did not resolve", target.host)))?;
        let stream = start_connect(addr, &self.config)?;
        trace!(token, %addr, kind = %target.kind, "tcp connecting");
        self.conns.insert(
            token,
            TcpConn {
                stream,
                peer: addr,
                phase: Phase::Connecting,
                started: Instant::now(),
                want_writable: false,
                outbox: Outbox::default(),
                proto,
            },
        );
        Ok(())
    }

    fn service(&mut self, sink: &mut dyn EventSink) -> Result<()> {
        for (token, conn) in &mut self.conns {
            Self::step(*token, conn, &mut self.buf, &self.config, sink);
        }
        self.conns.retain(|_, conn| conn.phase != Phase::Done);
        Ok(())
    }

    fn request_writable(&mut self, token: Token) {
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.want_writable = true;
        }
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }
}
