//! WebSocket client.

use std::fmt;
use std::sync::Arc;

use sluice_core::error::Result;
use sluice_core::reactor::Reactor;
use sluice_core::request::SocketHandler;
use sluice_core::transport::{Kind, Target};

use crate::session::Session;

/// A WebSocket connection serviced by a [`Reactor`].
///
/// Same lifecycle as [`SocketClient`](crate::SocketClient). Messages are
/// queued together with the scratch space the engine needs in front of each
/// payload for its framing, so the engine never copies a payload to prepend
/// a header.
pub struct WebSocketClient {
    session: Session,
}

impl WebSocketClient {
    /// Create a client for `ws[s]://host:port{path}`.
    pub fn new(
        reactor: Arc<Reactor>,
        handler: Arc<dyn SocketHandler>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        tls: bool,
    ) -> Self {
        let target = Target::new(Kind::WebSocket, host, port)
            .with_path(path)
            .with_tls(tls);
        Self {
            session: Session::new(reactor, handler, target),
        }
    }

    /// Request a subprotocol during the handshake.
    ///
    /// Only takes effect for the next [`connect`](Self::connect).
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.session.target = self.session.target.clone().with_protocol(protocol);
        self
    }

    /// Send this `Origin` instead of the reactor's default.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.session.target = self.session.target.clone().with_origin(Some(origin.into()));
        self
    }

    /// Start connecting. Calling it again while a session is held does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is disabled or shutting down.
    pub fn connect(&self) -> Result<()> {
        self.session.connect()
    }

    /// Queue a text message.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the engine holds no handle for the
    /// session, or the byte ring's error when the message cannot be queued.
    pub fn send(&self, text: &str) -> Result<()> {
        self.send_message(text.as_bytes(), false)
    }

    /// Queue a binary message.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_message(data, true)
    }

    fn send_message(&self, data: &[u8], binary: bool) -> Result<()> {
        self.session
            .with_record(|record| self.session.reactor.write_message(record, data, binary))
    }

    /// Connect again after a disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is disabled or shutting down.
    pub fn reconnect(&self) -> Result<()> {
        self.session.reconnect()
    }

    /// Close the connection and give the session back to the reactor.
    ///
    /// Also done on drop.
    pub fn stop(&self) {
        self.session.stop();
    }

    /// Whether the handshake completed.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Whether the engine holds a handle for the session.
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }
}

impl fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("target", &self.session.target)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
