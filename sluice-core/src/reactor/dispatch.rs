//! Engine callback handling
//!
//! [`Dispatch`] is the reactor's [`EventSink`]. It maps each event back to
//! the record that owns the token and drives the HTTP or socket state of
//! that record. It runs on the reactor thread only.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, warn};

use super::{Inner, WS_BINARY};
use crate::monitor::ReactorEvent;
use crate::request::{HttpExchange, Payload, Record};
use crate::transport::{Connection, Event, EventSink, Kind, Token, Verdict, WriteKind};

/// A record the engine may report events for.
pub(crate) struct Active {
    pub(crate) record: Record,
    pub(crate) kind: Kind,
}

pub(crate) struct Dispatch {
    pub(crate) active: HashMap<Token, Active>,
    inner: Arc<Inner>,
}

impl Dispatch {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self {
            active: HashMap::new(),
            inner,
        }
    }

    fn on_http(
        &mut self,
        token: Token,
        record: &Record,
        conn: &mut dyn Connection,
        event: Event<'_>,
    ) -> Verdict {
        let mut state = record.state();
        let path = state.target.path.clone();
        let Payload::Http(exchange) = &mut state.payload else {
            return Verdict::Continue;
        };

        match event {
            Event::Established => {
                record.set_connected(true);
                self.inner.emit(ReactorEvent::Connected { token });
            }
            Event::ConnectionError(reason) => {
                debug!(token, %path, reason, "http connection error");
                exchange.fail(format!("{path} error occurred. {reason}"));
                record.set_live(false);
                self.inner.emit(ReactorEvent::ConnectFailed {
                    token,
                    reason: reason.to_string(),
                });
            }
            Event::AppendHeaders => {
                if let Err(text) = self.append_headers(conn, exchange, &path) {
                    debug!(token, %text, "http request aborted");
                    exchange.fail(text);
                    record.set_live(false);
                    return Verdict::Teardown;
                }
            }
            Event::Writable => {
                let body = &exchange.request.body;
                if body.is_empty() {
                    return Verdict::Continue;
                }
                let text = if body.len() > self.inner.options.max_request_body {
                    format!("{path} body exceeds buffer size")
                } else {
                    conn.set_body_pending(false);
                    match conn.write(body, WriteKind::HttpFinal) {
                        Ok(n) if n == body.len() => return Verdict::Continue,
                        _ => format!("{path} failed to write body"),
                    }
                };
                debug!(token, %text, "http request aborted");
                exchange.fail(text);
                record.set_live(false);
                return Verdict::Teardown;
            }
            Event::ResponseHead {
                status,
                content_type,
            } => exchange.set_head(status, content_type),
            Event::Received { data, .. } => exchange.append_body(data),
            Event::Closed | Event::Destroyed => {
                record.set_live(false);
                record.set_connected(false);
            }
        }
        Verdict::Continue
    }

    /// Default and caller headers. On failure returns the response text.
    fn append_headers(
        &self,
        conn: &mut dyn Connection,
        exchange: &HttpExchange,
        path: &str,
    ) -> std::result::Result<(), String> {
        let request = &exchange.request;
        conn.append_header("User-Agent", &self.inner.options.user_agent)
            .map_err(|_| format!("{path} failed to add User-Agent header"))?;
        for (name, value) in &request.headers {
            conn.append_header(name, value)
                .map_err(|_| format!("{path} failed to add header {name}: {value}"))?;
        }
        if let Some(content_type) = &request.content_type {
            conn.append_header("Content-Type", content_type)
                .map_err(|_| format!("{path} failed to add header Content-Type:{content_type}"))?;
        }
        if !request.body.is_empty() {
            let size = request.body.len().to_string();
            conn.append_header("Content-Length", &size)
                .map_err(|_| format!("{path} failed to add header Content-Length:{size}"))?;
            conn.set_body_pending(true);
            conn.request_writable();
        }
        Ok(())
    }

    fn on_socket(
        &mut self,
        token: Token,
        record: &Record,
        kind: Kind,
        conn: &mut dyn Connection,
        event: Event<'_>,
    ) -> Verdict {
        let (handler, first_disconnect) = {
            let mut state = record.state();
            let Some(session) = state.payload.session_mut() else {
                return Verdict::Continue;
            };
            let first_disconnect = match event {
                Event::Closed | Event::Destroyed => {
                    !std::mem::replace(&mut session.disconnect_notified, true)
                }
                Event::Established => {
                    session.disconnect_notified = false;
                    false
                }
                _ => false,
            };
            (Arc::clone(&session.handler), first_disconnect)
        };

        if let Event::Closed | Event::Destroyed = event {
            record.set_live(false);
            record.set_connected(false);
            if first_disconnect {
                debug!(token, "disconnected");
                handler.on_disconnected();
                self.inner.emit(ReactorEvent::Disconnected { token });
            }
            return Verdict::Continue;
        }

        if record.is_shutdown() {
            return Verdict::Teardown;
        }

        match event {
            Event::Established => {
                debug!(token, %kind, "connected");
                record.outbound().reset();
                record.set_connected(true);
                handler.on_connected();
                self.inner.emit(ReactorEvent::Connected { token });
            }
            Event::ConnectionError(reason) => {
                debug!(token, reason, "connection error");
                record.set_live(false);
                handler.on_error(reason);
                self.inner.emit(ReactorEvent::ConnectFailed {
                    token,
                    reason: reason.to_string(),
                });
            }
            Event::Writable => return Self::send_one(token, record, kind, conn),
            Event::Received { data, remaining } => handler.on_data(data, remaining),
            Event::AppendHeaders
            | Event::ResponseHead { .. }
            | Event::Closed
            | Event::Destroyed => {}
        }
        Verdict::Continue
    }

    /// Send the next queued message, one per writable event.
    fn send_one(token: Token, record: &Record, kind: Kind, conn: &mut dyn Connection) -> Verdict {
        let ring = record.outbound();
        let Some(frame) = ring.read() else {
            return Verdict::Continue;
        };
        let (data, write_kind) = match kind {
            Kind::WebSocket => match frame.split_first() {
                Some((&WS_BINARY, rest)) => (rest, WriteKind::Binary),
                Some((_, rest)) => (rest, WriteKind::Text),
                None => return Verdict::Continue,
            },
            Kind::RawSocket | Kind::Http => (&frame[..], WriteKind::Raw),
        };

        match conn.write(data, write_kind) {
            Ok(n) if n == data.len() => {
                drop(frame);
                if !ring.is_empty() {
                    conn.request_writable();
                }
                Verdict::Continue
            }
            Ok(n) => {
                warn!(token, written = n, expected = data.len(), "short write, closing connection");
                record.set_live(false);
                Verdict::Teardown
            }
            Err(e) => {
                warn!(token, error = %e, "write failed, closing connection");
                record.set_live(false);
                Verdict::Teardown
            }
        }
    }

    /// Record the outcome of a connect call that never produced a handle.
    pub(crate) fn connect_failed(&mut self, token: Token, record: &Record, reason: &str) {
        record.set_live(false);
        let handler = {
            let mut state = record.state();
            let path = state.target.path.clone();
            match &mut state.payload {
                Payload::Http(exchange) => {
                    exchange.fail(format!("{path} error occurred. {reason}"));
                    None
                }
                Payload::Socket(session) | Payload::WebSocket(session) => {
                    Some(Arc::clone(&session.handler))
                }
                Payload::Idle => None,
            }
        };
        if let Some(handler) = handler {
            handler.on_error(reason);
        }
        self.inner.emit(ReactorEvent::ConnectFailed {
            token,
            reason: reason.to_string(),
        });
    }
}

impl EventSink for Dispatch {
    fn on_event(&mut self, token: Token, conn: &mut dyn Connection, event: Event<'_>) -> Verdict {
        let Some(active) = self.active.get(&token) else {
            return Verdict::Continue;
        };
        let record = Arc::clone(&active.record);
        let kind = active.kind;
        match kind {
            Kind::Http => self.on_http(token, &record, conn, event),
            kind => self.on_socket(token, &record, kind, conn, event),
        }
    }
}
