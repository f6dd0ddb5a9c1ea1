//! Plaintext WebSocket client links for the TCP engine
//!
//! `tungstenite` runs the upgrade handshake and the framing over a clone of
//! the engine's non-blocking stream. A handshake that cannot finish in one
//! go is parked as a `MidHandshake` and resumed on later `service` calls.

use std::io;
use std::mem;
use std::net::TcpStream;

use bytes::Bytes;
use tracing::{debug, trace};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::{ClientHandshake, Request, Response};
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::http::HeaderValue;
use tungstenite::{Message, WebSocket};

use crate::error::{Result, SluiceError};
use crate::transport::Target;

type Handshake = std::result::Result<
    (WebSocket<TcpStream>, Response),
    HandshakeError<ClientHandshake<TcpStream>>,
>;

enum LinkState {
    /// TCP still connecting
    Pending(Request),
    Handshaking(MidHandshake<ClientHandshake<TcpStream>>),
    Open(WebSocket<TcpStream>),
    Closed,
}

/// Outcome of one read attempt.
#[derive(Debug)]
pub(crate) enum WsRead {
    Message(Bytes),
    Idle,
    Closed,
}

pub(crate) struct WsLink {
    state: LinkState,
}

impl WsLink {
    /// Build the upgrade request for `target`.
    pub(crate) fn new(target: &Target) -> Result<Self> {
        let uri = format!("ws://{}:{}{}", target.host, target.port, target.path);
        let mut request = uri
            .into_client_request()
            .map_err(|e| SluiceError::connection(format!("invalid websocket target: {e}")))?;
        let headers = request.headers_mut();
        if let Some(protocol) = &target.protocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| SluiceError::connection(format!("invalid protocol: {e}")))?;
            headers.insert("Sec-WebSocket-Protocol", value);
        }
        if let Some(origin) = &target.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| SluiceError::connection(format!("invalid origin: {e}")))?;
            headers.insert("Origin", value);
        }
        Ok(Self {
            state: LinkState::Pending(request),
        })
    }

    /// Start the handshake over `stream`. `Ok(true)` once upgraded.
    pub(crate) fn begin(&mut self, stream: TcpStream) -> std::result::Result<bool, String> {
        match mem::replace(&mut self.state, LinkState::Closed) {
            LinkState::Pending(request) => self.settle(tungstenite::client::client(request, stream)),
            other => {
                self.state = other;
                Err("websocket handshake already started".to_string())
            }
        }
    }

    /// Continue an interrupted handshake. `Ok(true)` once upgraded.
    pub(crate) fn resume(&mut self) -> std::result::Result<bool, String> {
        match mem::replace(&mut self.state, LinkState::Closed) {
            LinkState::Handshaking(mid) => self.settle(mid.handshake()),
            LinkState::Open(ws) => {
                self.state = LinkState::Open(ws);
                Ok(true)
            }
            _ => Err("websocket handshake not started".to_string()),
        }
    }

    fn settle(&mut self, result: Handshake) -> std::result::Result<bool, String> {
        match result {
            Ok((ws, response)) => {
                trace!(status = %response.status(), "websocket upgraded");
                self.state = LinkState::Open(ws);
                Ok(true)
            }
            Err(HandshakeError::Interrupted(mid)) => {
                self.state = LinkState::Handshaking(mid);
                Ok(false)
            }
            Err(HandshakeError::Failure(e)) => Err(format!("websocket handshake failed: {e}")),
        }
    }

    /// Queue one message. Bytes the socket does not take yet stay in the
    /// link's write buffer and go out on later flushes.
    pub(crate) fn send(&mut self, data: &[u8], binary: bool) -> io::Result<()> {
        let LinkState::Open(ws) = &mut self.state else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let message = if binary {
            Message::binary(Bytes::copy_from_slice(data))
        } else {
            let text = std::str::from_utf8(data)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Message::text(text.to_owned())
        };
        pending_ok(ws.write(message))?;
        pending_ok(ws.flush())
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            LinkState::Open(ws) => pending_ok(ws.flush()),
            _ => Ok(()),
        }
    }

    pub(crate) fn read(&mut self) -> WsRead {
        let LinkState::Open(ws) = &mut self.state else {
            return WsRead::Closed;
        };
        loop {
            match ws.read() {
                Ok(message) if message.is_text() || message.is_binary() => {
                    return WsRead::Message(message.into_data());
                }
                Ok(message) if message.is_close() => return WsRead::Closed,
                // Pings are answered by the link itself.
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return WsRead::Idle;
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return WsRead::Closed;
                }
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    return WsRead::Closed;
                }
            }
        }
    }

    /// Send a close frame if the link is open and drop it.
    pub(crate) fn close(&mut self) {
        if let LinkState::Open(mut ws) = mem::replace(&mut self.state, LinkState::Closed) {
            let _ = ws.close(None);
            let _ = ws.flush();
        }
    }
}

/// A write the socket could not take yet is still queued in the link.
fn pending_ok(result: tungstenite::Result<()>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(tungstenite::Error::Io(e)) => Err(e),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Kind;

    #[test]
    fn test_upgrade_request_carries_protocol_and_origin() {
        let target = Target::new(Kind::WebSocket, "feed.test", 9000)
            .with_path("/stream")
            .with_protocol("v2.feed")
            .with_origin(Some("https://app.test".into()));
        let link = WsLink::new(&target).unwrap();
        let LinkState::Pending(request) = &link.state else {
            panic!("link should wait for the tcp connection");
        };
        assert_eq!(request.uri().to_string(), "ws://feed.test:9000/stream");
        assert_eq!(request.headers()["Sec-WebSocket-Protocol"], "v2.feed");
        assert_eq!(request.headers()["Origin"], "https://app.test");
    }

    #[test]
    fn test_invalid_protocol_refused() {
        let target = Target::new(Kind::WebSocket, "feed.test", 9000).with_protocol("bad\nvalue");
        assert!(WsLink::new(&target).is_err());
    }

    #[test]
    fn test_send_before_upgrade_fails() {
        let target = Target::new(Kind::WebSocket, "feed.test", 9000);
        let mut link = WsLink::new(&target).unwrap();
        let err = link.send(b"early", false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(matches!(link.read(), WsRead::Closed));
    }
}
