//! Request records
//!
//! One [`Request`] tracks a logical operation from submission to release:
//! an HTTP exchange, a raw socket session or a WebSocket session. Records are
//! pooled and recycled, so everything in here is reset by [`Request::prepare`].
//!
//! Signals the caller thread reads (handle liveness, completion, shutdown)
//! are atomics. Everything else sits behind a short-held mutex that, in
//! practice, is never contended: callers fill the state before publishing
//! the record and read it back only after completion, and the reactor thread
//! touches it only in between.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::byte_ring::ByteRing;
use crate::completion::Completion;
use crate::options;
use crate::pool::Pooled;
use crate::transport::{Kind, Target, Token};

/// A pooled request record as handed to callers.
pub type Record = Arc<Pooled<Request>>;

/// Request headers. Most requests carry only a handful.
pub type Headers = SmallVec<[(String, String); 8]>;

/// Outgoing HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("POST", path).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Result of an HTTP exchange.
///
/// Failures that never reached the peer carry status 0 (connection errors)
/// or 500 (no request record available) and a description in the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// A synthetic response not produced by the peer.
    pub fn failure(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::from(text.into()),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Completion callback of an asynchronous HTTP request.
///
/// Runs on the reactor thread and must not block.
pub type HttpCallback = Box<dyn FnOnce(HttpResponse) + Send>;

/// Event callbacks of a socket or WebSocket session.
///
/// All methods run on the reactor thread and must not block.
pub trait SocketHandler: Send + Sync {
    fn on_connected(&self) {}

    /// Called once per connection, however it ended.
    fn on_disconnected(&self) {}

    fn on_error(&self, _reason: &str) {}

    /// Inbound bytes. `remaining` is what the engine still expects for the
    /// current message.
    fn on_data(&self, data: &[u8], remaining: usize);
}

/// HTTP variant of a request record.
pub struct HttpExchange {
    pub request: HttpRequest,
    on_complete: Option<HttpCallback>,
    status: u16,
    content_type: Option<String>,
    body: BytesMut,
    response: Option<HttpResponse>,
}

impl HttpExchange {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            on_complete: None,
            status: 0,
            content_type: None,
            body: BytesMut::new(),
            response: None,
        }
    }

    pub fn with_callback(mut self, callback: HttpCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    /// Take the completion callback back, e.g. to report a failed submit.
    pub fn take_callback(&mut self) -> Option<HttpCallback> {
        self.on_complete.take()
    }

    /// Record the response head. Anything received before it is dropped.
    pub(crate) fn set_head(&mut self, status: u16, content_type: Option<&str>) {
        self.status = status;
        self.content_type = content_type.map(str::to_owned);
        self.body.clear();
    }

    pub(crate) fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Replace the body with an error description.
    pub(crate) fn fail(&mut self, text: String) {
        self.body.clear();
        self.body.extend_from_slice(text.as_bytes());
    }

    /// Freeze the accumulated response.
    pub(crate) fn finish(&mut self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            content_type: self.content_type.take(),
            body: self.body.split().freeze(),
        }
    }

    pub(crate) fn store(&mut self, response: HttpResponse) {
        self.response = Some(response);
    }

    pub(crate) fn take_response(&mut self) -> Option<HttpResponse> {
        self.response.take()
    }
}

impl fmt::Debug for HttpExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExchange")
            .field("request", &self.request)
            .field("async", &self.on_complete.is_some())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Socket/WebSocket variant of a request record.
pub struct SocketSession {
    pub(crate) handler: Arc<dyn SocketHandler>,
    /// Set once `on_disconnected` fired for the current connection.
    pub(crate) disconnect_notified: bool,
}

impl SocketSession {
    pub fn new(handler: Arc<dyn SocketHandler>) -> Self {
        Self {
            handler,
            disconnect_notified: false,
        }
    }
}

impl fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSession")
            .field("disconnect_notified", &self.disconnect_notified)
            .finish_non_exhaustive()
    }
}

/// What a record is doing.
#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    Idle,
    Http(HttpExchange),
    Socket(SocketSession),
    WebSocket(SocketSession),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> Option<Kind> {
        match self {
            Self::Idle => None,
            Self::Http(_) => Some(Kind::Http),
            Self::Socket(_) => Some(Kind::RawSocket),
            Self::WebSocket(_) => Some(Kind::WebSocket),
        }
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut SocketSession> {
        match self {
            Self::Socket(s) | Self::WebSocket(s) => Some(s),
            _ => None,
        }
    }
}

/// Mutable part of a record.
#[derive(Debug, Default)]
pub struct RequestState {
    pub target: Target,
    pub payload: Payload,
}

/// One pooled request record.
pub struct Request {
    /// The engine holds a handle for this record
    live: AtomicBool,
    /// The connection reached `Established`
    connected: AtomicBool,
    shutdown: AtomicBool,
    reconnect: AtomicBool,
    /// Published to the reactor and not yet released by it
    submitted: AtomicBool,
    token: AtomicU64,
    completion: Completion,
    send_capacity: usize,
    outbound: OnceLock<ByteRing>,
    state: Mutex<RequestState>,
}

impl Request {
    /// A blank record whose outbound ring, once needed, holds `send_capacity`
    /// bytes rounded to a valid ring size.
    pub fn new(send_capacity: usize) -> Self {
        Self {
            live: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reconnect: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            token: AtomicU64::new(0),
            completion: Completion::new(),
            send_capacity: options::send_capacity(send_capacity),
            outbound: OnceLock::new(),
            state: Mutex::new(RequestState::default()),
        }
    }

    /// Reset the record for a new operation.
    pub(crate) fn prepare(&self, target: Target, payload: Payload) {
        self.live.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.shutdown.store(false, Ordering::Release);
        self.reconnect.store(false, Ordering::Release);
        self.submitted.store(false, Ordering::Release);
        self.completion.arm();
        if let Some(ring) = self.outbound.get() {
            ring.reset();
        }
        *self.state.lock() = RequestState { target, payload };
    }

    /// Drop the payload so handlers and buffers are not kept alive by the pool.
    pub(crate) fn clear(&self) {
        self.submitted.store(false, Ordering::Release);
        *self.state.lock() = RequestState::default();
    }

    /// Whether the reactor holds this record and will release it itself.
    #[inline]
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn set_submitted(&self, submitted: bool) {
        self.submitted.store(submitted, Ordering::Release);
    }

    /// Whether the engine currently holds a handle for this record.
    #[inline]
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    /// Whether the connection is established.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn request_reconnect(&self) {
        self.reconnect.store(true, Ordering::Release);
    }

    pub(crate) fn take_reconnect(&self) -> bool {
        self.reconnect.swap(false, Ordering::AcqRel)
    }

    /// Token of the current connection attempt.
    #[inline]
    #[must_use]
    pub fn token(&self) -> Token {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: Token) {
        self.token.store(token, Ordering::Release);
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Outbound ring, allocated on first use.
    pub fn outbound(&self) -> &ByteRing {
        self.outbound
            .get_or_init(|| ByteRing::new(self.send_capacity))
    }

    /// Whether bytes are queued for sending.
    pub(crate) fn has_outbound(&self) -> bool {
        self.outbound.get().is_some_and(|ring| !ring.is_empty())
    }

    pub fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock()
    }

    #[must_use]
    pub fn kind(&self) -> Option<Kind> {
        self.state.lock().payload.kind()
    }

    /// Take the response of a completed HTTP exchange.
    pub fn take_response(&self) -> Option<HttpResponse> {
        match &mut self.state.lock().payload {
            Payload::Http(exchange) => exchange.take_response(),
            _ => None,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("token", &self.token())
            .field("live", &self.is_live())
            .field("connected", &self.is_connected())
            .field("shutdown", &self.is_shutdown())
            .field("submitted", &self.is_submitted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl SocketHandler for Nop {
        fn on_data(&self, _data: &[u8], _remaining: usize) {}
    }

    #[test]
    fn test_payload_kind() {
        assert_eq!(Payload::Idle.kind(), None);
        let http = Payload::Http(HttpExchange::new(HttpRequest::get("/")));
        assert_eq!(http.kind(), Some(Kind::Http));
        let ws = Payload::WebSocket(SocketSession::new(Arc::new(Nop)));
        assert_eq!(ws.kind(), Some(Kind::WebSocket));
    }

    #[test]
    fn test_exchange_accumulates_response() {
        let mut ex = HttpExchange::new(HttpRequest::get("/"));
        ex.set_head(200, Some("text/plain"));
        ex.append_body(b"hel");
        ex.append_body(b"lo");
        let resp = ex.finish();
        assert!(resp.is_success());
        assert_eq!(resp.content_type.as_deref(), Some("text/plain"));
        assert_eq!(resp.text(), "hello");
    }

    #[test]
    fn test_exchange_failure_replaces_body() {
        let mut ex = HttpExchange::new(HttpRequest::get("/x"));
        ex.append_body(b"partial");
        ex.fail("/x error occurred. refused".to_string());
        let resp = ex.finish();
        assert_eq!(resp.status, 0);
        assert_eq!(resp.text(), "/x error occurred. refused");
    }

    #[test]
    fn test_prepare_resets_signals() {
        let req = Request::new(64);
        req.set_live(true);
        req.set_shutdown();
        req.request_reconnect();
        req.outbound().write(b"stale", 0).unwrap();
        req.completion().complete();

        req.prepare(
            Target::new(Kind::RawSocket, "h", 1),
            Payload::Socket(SocketSession::new(Arc::new(Nop))),
        );
        assert!(!req.is_live());
        assert!(!req.is_shutdown());
        assert!(!req.take_reconnect());
        assert!(!req.completion().is_done());
        assert!(!req.has_outbound());
        assert_eq!(req.kind(), Some(Kind::RawSocket));
    }

    #[test]
    fn test_odd_send_capacity_still_gets_a_ring() {
        let req = Request::new(100);
        assert_eq!(req.outbound().capacity(), 128);
        let tiny = Request::new(0);
        tiny.outbound().write(b"x", 0).unwrap();
        assert_eq!(tiny.outbound().capacity(), 16);
    }

    #[test]
    fn test_request_builders() {
        let r = HttpRequest::post("/submit", "a=1")
            .with_header("X-Trace", "7")
            .with_content_type("application/x-www-form-urlencoded");
        assert_eq!(r.method, "POST");
        assert_eq!(r.headers.len(), 1);
        assert_eq!(&r.body[..], b"a=1");
    }
}
