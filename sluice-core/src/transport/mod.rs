//! Transport engine contract
//!
//! The reactor never speaks a wire protocol itself. Connection setup, TLS,
//! HTTP parsing and WebSocket framing belong to a transport engine, which the
//! reactor drives through this module's traits:
//!
//! - [`Transport`]: the engine context owned by one reactor thread
//! - [`EventSink`]: the reactor's callback, invoked synchronously from
//!   [`Transport::service`] with one [`Event`] at a time
//! - [`Connection`]: what the callback may do to the connection an event
//!   belongs to
//!
//! Event ordering per token:
//! - `Established` once the connection is up (never after `ConnectionError`)
//! - any number of `AppendHeaders`, `ResponseHead`, `Writable`, `Received`
//! - at most one of `Closed` / `ConnectionError`
//! - `Destroyed` last, after which the token is never reported again
//!
//! Returning [`Verdict::Teardown`] from any event closes the connection; the
//! engine then finishes the sequence with `Closed` and `Destroyed`.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::Result;

pub mod scripted;
pub mod tcp;

/// Identifies one connection attempt. Never reused within a reactor.
pub type Token = u64;

/// Which protocol a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Http,
    WebSocket,
    RawSocket,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::WebSocket => write!(f, "websocket"),
            Self::RawSocket => write!(f, "raw"),
        }
    }
}

/// Connection parameters handed to [`Transport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: Kind,
    pub host: String,
    pub port: u16,
    /// Request path (HTTP) or upgrade path (WebSocket)
    pub path: String,
    /// HTTP method, ignored by other kinds
    pub method: String,
    pub tls: bool,
    /// WebSocket sub-protocol selector
    pub protocol: Option<String>,
    pub origin: Option<String>,
}

impl Target {
    /// A target with the given kind and address, no TLS, path `/`.
    pub fn new(kind: Kind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            path: "/".to_string(),
            method: "GET".to_string(),
            tls: false,
            protocol: None,
            origin: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new(Kind::Http, "", 0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match (self.kind, self.tls) {
            (Kind::Http, false) => "http",
            (Kind::Http, true) => "https",
            (Kind::WebSocket, false) => "ws",
            (Kind::WebSocket, true) => "wss",
            (Kind::RawSocket, _) => "tcp",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)?;
        if self.kind != Kind::RawSocket {
            write!(f, "{}", self.path)?;
        }
        Ok(())
    }
}

/// How a buffer passed to [`Connection::write`] is to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Raw bytes on a plain socket
    Raw,
    /// WebSocket text message
    Text,
    /// WebSocket binary message
    Binary,
    /// Last chunk of an HTTP request body
    HttpFinal,
}

/// One callback reason delivered by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// The connection is up.
    Established,
    /// Connecting or the connection itself failed.
    ConnectionError(&'a str),
    /// HTTP only: request headers may be added now.
    AppendHeaders,
    /// HTTP only: status line and content type of the response.
    ResponseHead {
        status: u16,
        content_type: Option<&'a str>,
    },
    /// The connection accepts a write.
    Writable,
    /// Inbound bytes. `remaining` is the engine's count of bytes still due
    /// for the current message, 0 when unknown or complete.
    Received { data: &'a [u8], remaining: usize },
    /// The connection was closed (or the HTTP exchange finished).
    Closed,
    /// The engine dropped its handle. Last event for the token.
    Destroyed,
}

/// Callback answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Teardown,
}

/// Operations available on the connection an event belongs to.
pub trait Connection {
    /// Send `data`. Returns how many bytes the engine accepted.
    ///
    /// WebSocket writes start with [`Transport::headroom`] scratch bytes the
    /// engine may use for framing, followed by the payload.
    fn write(&mut self, data: &[u8], kind: WriteKind) -> io::Result<usize>;

    /// Ask for a [`Event::Writable`] callback.
    fn request_writable(&mut self);

    /// Add an HTTP request header. Only valid during [`Event::AppendHeaders`].
    fn append_header(&mut self, name: &str, value: &str) -> Result<()>;

    /// Announce that an HTTP body follows the headers.
    fn set_body_pending(&mut self, pending: bool);
}

/// The reactor side of the callback interface.
pub trait EventSink {
    fn on_event(&mut self, token: Token, conn: &mut dyn Connection, event: Event<'_>) -> Verdict;
}

/// Engine cancel/wake primitive. Callable from any thread.
pub trait Wake: Send + Sync {
    /// Interrupt a blocking [`Transport::service`] call.
    fn wake(&self);
}

/// A wake primitive for engines whose `service` never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWake;

impl Wake for NoopWake {
    fn wake(&self) {}
}

/// A transport engine context.
///
/// Owned and driven by exactly one reactor thread.
pub trait Transport: Send {
    /// Start connecting `target` under `token`.
    ///
    /// An `Err` means no handle was created: the reactor treats the request
    /// as terminal right away.
    fn connect(&mut self, token: Token, target: &Target) -> Result<()>;

    /// Drive every connection one step and deliver pending events.
    fn service(&mut self, sink: &mut dyn EventSink) -> Result<()>;

    /// Ask for a writable callback on `token` outside of a callback.
    fn request_writable(&mut self, token: Token);

    /// Handle used to interrupt `service` from other threads.
    fn waker(&self) -> Arc<dyn Wake>;

    /// Scratch bytes expected in front of every WebSocket payload.
    fn headroom(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        let t = Target::new(Kind::Http, "example.com", 443)
            .with_tls(true)
            .with_path("/v1/ping");
        assert_eq!(t.to_string(), "https://example.com:443/v1/ping");

        let t = Target::new(Kind::RawSocket, "10.0.0.1", 9000).with_path("/ignored");
        assert_eq!(t.to_string(), "tcp://10.0.0.1:9000");

        let t = Target::new(Kind::WebSocket, "feed", 80).with_path("/ws");
        assert_eq!(t.to_string(), "ws://feed:80/ws");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::RawSocket.to_string(), "raw");
        assert_eq!(Kind::WebSocket.to_string(), "websocket");
    }
}
