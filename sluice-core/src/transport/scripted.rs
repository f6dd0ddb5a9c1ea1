//! Deterministic in-memory transport engine
//!
//! Every connection follows a [`Script`]: accept or refuse, fail after
//! connecting, answer an HTTP request with a canned response, truncate
//! writes. A [`ScriptHandle`] kept by the test (or demo) configures the
//! scripts, injects inbound bytes and peer closes, and inspects everything
//! the reactor wrote.
//!
//! One call to `service` advances every connection by one step, so event
//! order is fully reproducible.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{Connection, Event, EventSink, Kind, Target, Token, Transport, Verdict, Wake, WriteKind};
use crate::error::{Result, SluiceError};

/// How a scripted connection attempt ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Outcome {
    /// Connect and stay up
    #[default]
    Accept,
    /// `connect` itself fails; no handle is ever created
    Refuse(String),
    /// The handle is created, then the engine reports a connection error
    Fail(String),
}

/// Canned answer to an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Size of the `Received` chunks the body is delivered in
    pub chunk: usize,
}

impl Default for ScriptedResponse {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: None,
            body: Vec::new(),
            chunk: 1024,
        }
    }
}

impl ScriptedResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }
}

/// Behaviour of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub outcome: Outcome,
    pub response: ScriptedResponse,
    /// Accept at most this many bytes per write
    pub max_write: Option<usize>,
    /// Fail every `append_header` call
    pub reject_headers: bool,
}

impl Script {
    pub fn accept() -> Self {
        Self::default()
    }

    pub fn refuse(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Refuse(reason.into()),
            ..Self::default()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fail(reason.into()),
            ..Self::default()
        }
    }

    pub fn respond(response: ScriptedResponse) -> Self {
        Self {
            response,
            ..Self::default()
        }
    }

    pub fn with_max_write(mut self, max: usize) -> Self {
        self.max_write = Some(max);
        self
    }

    pub fn with_rejected_headers(mut self) -> Self {
        self.reject_headers = true;
        self
    }
}

/// One write observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub token: Token,
    pub kind: WriteKind,
    /// Payload, without WebSocket headroom
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Shared {
    default_script: Script,
    queued: VecDeque<Script>,
    connects: Vec<(Token, Target)>,
    sent: Vec<Sent>,
    headers: HashMap<Token, Vec<(String, String)>>,
    inbound: Vec<(Token, Vec<u8>)>,
    closing: Vec<Token>,
    open: Vec<Token>,
    writable_held: bool,
}

#[derive(Debug, Default)]
struct CountingWake(AtomicUsize);

impl Wake for CountingWake {
    fn wake(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Test-side handle of a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    shared: Arc<Mutex<Shared>>,
    wake: Arc<CountingWake>,
}

impl ScriptHandle {
    /// Script used when no per-connection script is queued.
    pub fn set_default(&self, script: Script) {
        self.shared.lock().default_script = script;
    }

    /// Script for the next connection attempt.
    pub fn push(&self, script: Script) {
        self.shared.lock().queued.push_back(script);
    }

    /// Every connect call so far, in order.
    #[must_use]
    pub fn connects(&self) -> Vec<(Token, Target)> {
        self.shared.lock().connects.clone()
    }

    /// Token of the most recent connect call.
    #[must_use]
    pub fn last_token(&self) -> Option<Token> {
        self.shared.lock().connects.last().map(|(t, _)| *t)
    }

    /// Every write so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Sent> {
        self.shared.lock().sent.clone()
    }

    /// Headers appended for `token`.
    #[must_use]
    pub fn headers(&self, token: Token) -> Vec<(String, String)> {
        self.shared
            .lock()
            .headers
            .get(&token)
            .cloned()
            .unwrap_or_default()
    }

    /// Tokens of connections the engine still holds.
    #[must_use]
    pub fn open(&self) -> Vec<Token> {
        self.shared.lock().open.clone()
    }

    /// Deliver `data` to `token` as if the peer sent it.
    pub fn deliver(&self, token: Token, data: impl Into<Vec<u8>>) {
        self.shared.lock().inbound.push((token, data.into()));
    }

    /// Close `token` from the peer side.
    pub fn close(&self, token: Token) {
        self.shared.lock().closing.push(token);
    }

    /// Suspend or resume writable callbacks.
    pub fn hold_writable(&self, held: bool) {
        self.shared.lock().writable_held = held;
    }

    /// Number of times the reactor woke the engine.
    #[must_use]
    pub fn wakes(&self) -> usize {
        self.wake.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
    Done,
}

struct ScriptedConn {
    token: Token,
    kind: Kind,
    script: Script,
    phase: Phase,
    headroom: usize,
    want_writable: bool,
    headers_open: bool,
    body_pending: bool,
    request_sent: bool,
    peer_closed: bool,
    inbound: VecDeque<Vec<u8>>,
    shared: Arc<Mutex<Shared>>,
}

impl Connection for ScriptedConn {
    fn write(&mut self, data: &[u8], kind: WriteKind) -> io::Result<usize> {
        if self.phase != Phase::Open {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let accepted = self.script.max_write.map_or(data.len(), |max| max.min(data.len()));
        let skip = match kind {
            WriteKind::Text | WriteKind::Binary => self.headroom.min(accepted),
            WriteKind::Raw | WriteKind::HttpFinal => 0,
        };
        if kind == WriteKind::HttpFinal && accepted == data.len() {
            self.body_pending = false;
        }
        self.shared.lock().sent.push(Sent {
            token: self.token,
            kind,
            data: data[skip..accepted].to_vec(),
        });
        Ok(accepted)
    }

    fn request_writable(&mut self) {
        self.want_writable = true;
    }

    fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        if !self.headers_open {
            return Err(SluiceError::transport("headers already sent"));
        }
        if self.script.reject_headers {
            return Err(SluiceError::transport("header buffer full"));
        }
        self.shared
            .lock()
            .headers
            .entry(self.token)
            .or_default()
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn set_body_pending(&mut self, pending: bool) {
        self.body_pending = pending;
    }
}

impl ScriptedConn {
    fn emit(&mut self, sink: &mut dyn EventSink, event: Event<'_>) -> Verdict {
        let token = self.token;
        sink.on_event(token, self, event)
    }

    /// End the connection: `Closed` (when it was up) and `Destroyed`.
    fn finish(&mut self, sink: &mut dyn EventSink, closed: bool) {
        if closed {
            self.emit(sink, Event::Closed);
        }
        self.phase = Phase::Done;
        self.emit(sink, Event::Destroyed);
    }

    fn step(&mut self, sink: &mut dyn EventSink, writable_held: bool) {
        match self.phase {
            Phase::Connecting => self.step_connecting(sink),
            Phase::Open if self.kind == Kind::Http => self.step_http(sink, writable_held),
            Phase::Open => self.step_socket(sink, writable_held),
            Phase::Done => {}
        }
    }

    fn step_connecting(&mut self, sink: &mut dyn EventSink) {
        if let Outcome::Fail(reason) = &self.script.outcome {
            let reason = reason.clone();
            self.emit(sink, Event::ConnectionError(&reason));
            self.finish(sink, false);
            return;
        }
        self.phase = Phase::Open;
        if self.emit(sink, Event::Established) == Verdict::Teardown {
            self.finish(sink, true);
            return;
        }
        if self.kind == Kind::Http {
            self.headers_open = true;
            let verdict = self.emit(sink, Event::AppendHeaders);
            self.headers_open = false;
            if verdict == Verdict::Teardown {
                self.finish(sink, true);
            }
        }
    }

    fn step_http(&mut self, sink: &mut dyn EventSink, writable_held: bool) {
        if !self.request_sent {
            if self.body_pending {
                if !self.want_writable || writable_held {
                    return;
                }
                self.want_writable = false;
                if self.emit(sink, Event::Writable) == Verdict::Teardown {
                    self.finish(sink, true);
                    return;
                }
                if self.body_pending {
                    return;
                }
            }
            self.request_sent = true;
            return;
        }

        let response = self.script.response.clone();
        let head = Event::ResponseHead {
            status: response.status,
            content_type: response.content_type.as_deref(),
        };
        if self.emit(sink, head) == Verdict::Teardown {
            self.finish(sink, true);
            return;
        }
        let mut left = response.body.len();
        for chunk in response.body.chunks(response.chunk.max(1)) {
            left -= chunk.len();
            let event = Event::Received {
                data: chunk,
                remaining: left,
            };
            if self.emit(sink, event) == Verdict::Teardown {
                break;
            }
        }
        self.finish(sink, true);
    }

    fn step_socket(&mut self, sink: &mut dyn EventSink, writable_held: bool) {
        if self.peer_closed {
            self.finish(sink, true);
            return;
        }
        if self.want_writable && !writable_held {
            self.want_writable = false;
            if self.emit(sink, Event::Writable) == Verdict::Teardown {
                self.finish(sink, true);
                return;
            }
        }
        if let Some(data) = self.inbound.pop_front() {
            let event = Event::Received {
                data: &data,
                remaining: 0,
            };
            if self.emit(sink, event) == Verdict::Teardown {
                self.finish(sink, true);
            }
        }
    }
}

/// In-memory engine driven by [`Script`]s.
pub struct ScriptedTransport {
    conns: Vec<ScriptedConn>,
    shared: Arc<Mutex<Shared>>,
    wake: Arc<CountingWake>,
    headroom: usize,
}

impl ScriptedTransport {
    /// Create an engine and the handle that controls it.
    pub fn new() -> (Self, ScriptHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let wake = Arc::new(CountingWake::default());
        let handle = ScriptHandle {
            shared: Arc::clone(&shared),
            wake: Arc::clone(&wake),
        };
        (
            Self {
                conns: Vec::new(),
                shared,
                wake,
                headroom: 0,
            },
            handle,
        )
    }

    /// Expect `headroom` scratch bytes in front of WebSocket payloads.
    #[must_use]
    pub fn with_headroom(mut self, headroom: usize) -> Self {
        self.headroom = headroom;
        self
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, token: Token, target: &Target) -> Result<()> {
        let script = {
            let mut shared = self.shared.lock();
            shared.connects.push((token, target.clone()));
            let script = shared
                .queued
                .pop_front()
                .unwrap_or_else(|| shared.default_script.clone());
            if let Outcome::Refuse(reason) = &script.outcome {
                return Err(SluiceError::connection(reason.clone()));
            }
            shared.open.push(token);
            script
        };
        trace!(token, %target, "scripted connect");
        self.conns.push(ScriptedConn {
            token,
            kind: target.kind,
            script,
            phase: Phase::Connecting,
            headroom: self.headroom,
            want_writable: false,
            headers_open: false,
            body_pending: false,
            request_sent: false,
            peer_closed: false,
            inbound: VecDeque::new(),
            shared: Arc::clone(&self.shared),
        });
        Ok(())
    }

    fn service(&mut self, sink: &mut dyn EventSink) -> Result<()> {
        let (inbound, closing, held) = {
            let mut shared = self.shared.lock();
            (
                std::mem::take(&mut shared.inbound),
                std::mem::take(&mut shared.closing),
                shared.writable_held,
            )
        };
        for (token, data) in inbound {
            if let Some(conn) = self.conns.iter_mut().find(|c| c.token == token) {
                conn.inbound.push_back(data);
            }
        }
        for token in closing {
            if let Some(conn) = self.conns.iter_mut().find(|c| c.token == token) {
                conn.peer_closed = true;
            }
        }

        for conn in &mut self.conns {
            conn.step(sink, held);
        }

        let before = self.conns.len();
        self.conns.retain(|c| c.phase != Phase::Done);
        if self.conns.len() != before {
            let remaining: Vec<Token> = self.conns.iter().map(|c| c.token).collect();
            self.shared.lock().open = remaining;
        }
        Ok(())
    }

    fn request_writable(&mut self, token: Token) {
        if let Some(conn) = self.conns.iter_mut().find(|c| c.token == token) {
            conn.want_writable = true;
        }
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.wake.clone()
    }

    fn headroom(&self) -> usize {
        self.headroom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records events and optionally writes on `Writable`.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        write_on_writable: Option<(Vec<u8>, WriteKind)>,
        headers: Vec<(&'static str, &'static str)>,
        header_errors: usize,
    }

    impl EventSink for Recorder {
        fn on_event(
            &mut self,
            token: Token,
            conn: &mut dyn Connection,
            event: Event<'_>,
        ) -> Verdict {
            self.events.push(format!("{token}:{event:?}"));
            match event {
                Event::AppendHeaders => {
                    for (name, value) in &self.headers {
                        if conn.append_header(name, value).is_err() {
                            self.header_errors += 1;
                        }
                    }
                    if self.write_on_writable.is_some() {
                        conn.set_body_pending(true);
                        conn.request_writable();
                    }
                }
                Event::Writable => {
                    if let Some((data, kind)) = &self.write_on_writable {
                        conn.write(data, *kind).unwrap();
                    }
                }
                _ => {}
            }
            Verdict::Continue
        }
    }

    fn run(engine: &mut ScriptedTransport, sink: &mut Recorder, steps: usize) {
        for _ in 0..steps {
            engine.service(sink).unwrap();
        }
    }

    #[test]
    fn test_refused_connect() {
        let (mut engine, handle) = ScriptedTransport::new();
        handle.push(Script::refuse("no route"));
        let target = Target::new(Kind::Http, "h", 80);
        assert!(matches!(
            engine.connect(1, &target),
            Err(SluiceError::Connection(reason)) if reason == "no route"
        ));
        assert_eq!(handle.connects().len(), 1);
        assert!(handle.open().is_empty());
    }

    #[test]
    fn test_fail_after_connect() {
        let (mut engine, handle) = ScriptedTransport::new();
        handle.set_default(Script::fail("reset by peer"));
        engine.connect(3, &Target::new(Kind::RawSocket, "h", 1)).unwrap();
        let mut sink = Recorder::default();
        run(&mut engine, &mut sink, 2);
        assert_eq!(
            sink.events,
            vec!["3:ConnectionError(\"reset by peer\")", "3:Destroyed"]
        );
    }

    #[test]
    fn test_http_exchange() {
        let (mut engine, handle) = ScriptedTransport::new();
        handle.push(Script::respond(
            ScriptedResponse::new(201, "abcdef").with_chunk(4),
        ));
        engine.connect(9, &Target::new(Kind::Http, "h", 80)).unwrap();
        let mut sink = Recorder {
            headers: vec![("User-Agent", "test")],
            write_on_writable: Some((b"body".to_vec(), WriteKind::HttpFinal)),
            ..Recorder::default()
        };
        run(&mut engine, &mut sink, 4);

        assert_eq!(handle.headers(9), vec![("User-Agent".to_string(), "test".to_string())]);
        assert_eq!(handle.sent()[0].data, b"body");
        assert_eq!(
            sink.events,
            vec![
                "9:Established",
                "9:AppendHeaders",
                "9:Writable",
                "9:ResponseHead { status: 201, content_type: None }",
                "9:Received { data: [97, 98, 99, 100], remaining: 2 }",
                "9:Received { data: [101, 102], remaining: 0 }",
                "9:Closed",
                "9:Destroyed",
            ]
        );
        assert!(handle.open().is_empty());
    }

    #[test]
    fn test_rejected_headers() {
        let (mut engine, handle) = ScriptedTransport::new();
        handle.push(Script::accept().with_rejected_headers());
        engine.connect(1, &Target::new(Kind::Http, "h", 80)).unwrap();
        let mut sink = Recorder {
            headers: vec![("A", "1")],
            ..Recorder::default()
        };
        run(&mut engine, &mut sink, 1);
        assert_eq!(sink.header_errors, 1);
    }

    #[test]
    fn test_socket_writable_hold_and_inbound() {
        let (mut engine, handle) = ScriptedTransport::new();
        engine.connect(5, &Target::new(Kind::RawSocket, "h", 1)).unwrap();
        let mut sink = Recorder {
            write_on_writable: Some((b"ping".to_vec(), WriteKind::Raw)),
            ..Recorder::default()
        };
        run(&mut engine, &mut sink, 1);

        handle.hold_writable(true);
        engine.request_writable(5);
        run(&mut engine, &mut sink, 2);
        assert!(handle.sent().is_empty());

        handle.hold_writable(false);
        handle.deliver(5, b"pong".to_vec());
        run(&mut engine, &mut sink, 1);
        assert_eq!(handle.sent()[0].data, b"ping");
        let received = "5:Received { data: [112, 111, 110, 103], remaining: 0 }".to_string();
        assert!(sink.events.contains(&received));

        handle.close(5);
        run(&mut engine, &mut sink, 1);
        assert_eq!(&sink.events[sink.events.len() - 2..], ["5:Closed", "5:Destroyed"]);
    }

    #[test]
    fn test_short_write_and_headroom() {
        let (engine, handle) = ScriptedTransport::new();
        let mut engine = engine.with_headroom(2);
        handle.push(Script::accept().with_max_write(4));
        engine.connect(1, &Target::new(Kind::WebSocket, "h", 80)).unwrap();
        let mut sink = Recorder {
            write_on_writable: Some((b"..hello".to_vec(), WriteKind::Text)),
            ..Recorder::default()
        };
        run(&mut engine, &mut sink, 1);
        engine.request_writable(1);
        run(&mut engine, &mut sink, 1);
        assert_eq!(handle.sent()[0].data, b"he");
    }

    #[test]
    fn test_waker_counts() {
        let (engine, handle) = ScriptedTransport::new();
        let waker = engine.waker();
        waker.wake();
        waker.wake();
        assert_eq!(handle.wakes(), 2);
    }
}
