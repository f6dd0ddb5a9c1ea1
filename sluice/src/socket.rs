//! Raw socket client.

use std::fmt;
use std::sync::Arc;

use sluice_core::error::Result;
use sluice_core::reactor::Reactor;
use sluice_core::request::SocketHandler;
use sluice_core::transport::{Kind, Target};

use crate::session::Session;

/// A raw byte-stream connection serviced by a [`Reactor`].
///
/// Inbound bytes and lifecycle changes are delivered to the
/// [`SocketHandler`] on the reactor thread. Outbound messages are queued in
/// the connection's byte ring and written one per writable event, in order.
///
/// A connection that drops is not re-established automatically: the
/// handler sees `on_disconnected` and the caller decides whether to
/// [`reconnect`](Self::reconnect).
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sluice::prelude::*;
/// use sluice::transport::tcp::TcpTransport;
///
/// struct Print;
///
/// impl SocketHandler for Print {
///     fn on_data(&self, data: &[u8], _remaining: usize) {
///         println!("{}", String::from_utf8_lossy(data));
///     }
/// }
///
/// # fn main() -> sluice::Result<()> {
/// let reactor = Arc::new(Reactor::start(ReactorOptions::default(), TcpTransport::factory));
/// let client = SocketClient::new(reactor, Arc::new(Print), "127.0.0.1", 7000);
/// client.connect()?;
/// while !client.is_connected() {
///     std::thread::yield_now();
/// }
/// client.send(b"hello")?;
/// # Ok(())
/// # }
/// ```
pub struct SocketClient {
    session: Session,
}

impl SocketClient {
    /// Create a client for `host:port`. Nothing happens until
    /// [`connect`](Self::connect).
    pub fn new(
        reactor: Arc<Reactor>,
        handler: Arc<dyn SocketHandler>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let target = Target::new(Kind::RawSocket, host, port);
        Self {
            session: Session::new(reactor, handler, target),
        }
    }

    /// Start connecting. Calling it again while a session is held does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the reactor is disabled or shutting down.
    pub fn connect(&self) -> Result<()> {
        self.session.connect()
    }

    /// Queue `data` as one message.
    ///
    /// Bytes queued before the connection is established are dropped when it
    /// is, so wait for [`is_connected`](Self::is_connected) first.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the engine holds no handle for the
    /// session, or the byte ring's error when the message cannot be queued.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.session
            .with_record(|record| self.session.reactor.write(record, data))
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

    /// Whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Whether the engine holds a handle for the session.
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }
}

impl fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketClient")
            .field("target", &self.session.target)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
