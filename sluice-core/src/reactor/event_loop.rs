//! The reactor thread body
//!
//! Each iteration:
//! 1. takes at most one new submission and issues its connect call
//! 2. services the engine if anything is active
//! 3. sweeps the active set for records whose handle went away
//!
//! When nothing is active the thread idles according to
//! [`IdleStrategy`](crate::options::IdleStrategy).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use super::dispatch::{Active, Dispatch};
use super::Inner;
use crate::monitor::ReactorEvent;
use crate::options::IdleStrategy;
use crate::request::{Payload, Record};
use crate::submission::Drain;
use crate::transport::{Kind, Token, Transport};

pub(crate) struct EventLoop {
    inner: Arc<Inner>,
    engine: Box<dyn Transport>,
    drain: Drain<Record>,
    dispatch: Dispatch,
    next_token: Token,
}

impl EventLoop {
    pub(crate) fn new(inner: Arc<Inner>, engine: Box<dyn Transport>, drain: Drain<Record>) -> Self {
        Self {
            dispatch: Dispatch::new(Arc::clone(&inner)),
            inner,
            engine,
            drain,
            next_token: 1,
        }
    }

    pub(crate) fn run(mut self) {
        let cpu = self.inner.options.resolved_cpu();
        if let Some(init) = &self.inner.options.thread_init {
            init(cpu);
        }
        info!(?cpu, "reactor started");

        while self.inner.running.load(Ordering::Acquire) {
            if let Some(record) = self.drain.try_pop() {
                self.start(record);
            }

            if self.dispatch.active.is_empty() {
                self.idle();
                continue;
            }

            if let Err(e) = self.engine.service(&mut self.dispatch) {
                warn!(error = %e, "transport service failed");
            }
            self.sweep();
        }

        self.abort_all();
        info!("reactor stopped");
    }

    fn idle(&self) {
        match self.inner.options.idle {
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Park(timeout) => {
                if self.drain.pending() == 0 {
                    thread::park_timeout(timeout);
                }
            }
        }
    }

    /// Issue the connect call for `record` under a fresh token.
    fn start(&mut self, record: Record) {
        let token = self.next_token;
        self.next_token += 1;
        record.set_token(token);

        let (target, kind) = {
            let mut state = record.state();
            if state.target.origin.is_none() {
                state.target.origin.clone_from(&self.inner.options.origin);
            }
            (state.target.clone(), state.payload.kind())
        };
        let Some(kind) = kind else {
            warn!(token, "submitted record carries no request, releasing");
            self.inner.release(record);
            return;
        };

        debug!(
            token,
            host = %target.host,
            port = target.port,
            path = %target.path,
            %kind,
            "connecting"
        );
        self.inner.emit(ReactorEvent::Connecting {
            token,
            target: target.to_string(),
        });

        match self.engine.connect(token, &target) {
            Ok(()) => record.set_live(true),
            Err(e) => self.dispatch.connect_failed(token, &record, &e.to_string()),
        }
        self.dispatch.active.insert(token, Active { record, kind });
    }

    fn sweep(&mut self) {
        let mut finished: SmallVec<[Token; 8]> = SmallVec::new();
        let mut reconnect: SmallVec<[Token; 8]> = SmallVec::new();

        for (&token, active) in &self.dispatch.active {
            let record = &active.record;
            if record.is_live() {
                if active.kind != Kind::Http && (record.has_outbound() || record.is_shutdown()) {
                    self.engine.request_writable(token);
                }
                continue;
            }
            match active.kind {
                Kind::Http => finished.push(token),
                Kind::RawSocket | Kind::WebSocket => {
                    if record.is_shutdown() {
                        finished.push(token);
                    } else if record.take_reconnect() {
                        reconnect.push(token);
                    }
                }
            }
        }

        for token in finished {
            if let Some(active) = self.dispatch.active.remove(&token) {
                match active.kind {
                    Kind::Http => self.complete_http(token, active.record),
                    Kind::RawSocket | Kind::WebSocket => {
                        debug!(token, "session shut down");
                        self.inner.release(active.record);
                    }
                }
            }
        }

        for token in reconnect {
            if let Some(active) = self.dispatch.active.remove(&token) {
                debug!(token, "reconnecting");
                self.start(active.record);
            }
        }
    }

    /// Freeze the response and hand it to the callback or the waiting caller.
    fn complete_http(&self, token: Token, record: Record) {
        let (response, callback) = {
            let mut state = record.state();
            let Payload::Http(exchange) = &mut state.payload else {
                return;
            };
            (exchange.finish(), exchange.take_callback())
        };
        debug!(token, status = response.status, "request completed");
        self.inner.emit(ReactorEvent::Completed {
            token,
            status: response.status,
        });

        match callback {
            Some(callback) => {
                callback(response);
                self.inner.release(record);
            }
            None => {
                if let Payload::Http(exchange) = &mut record.state().payload {
                    exchange.store(response);
                }
                if !record.completion().complete() {
                    debug!(token, "caller gave up waiting, releasing");
                    self.inner.release(record);
                }
            }
        }
    }

    /// Fail every queued and active request when the loop exits.
    fn abort_all(&mut self) {
        let mut pending: Vec<(Token, Record)> = Vec::new();
        // Callers that passed the running check before the stop are still
        // publishing. Keep draining so a full ring cannot stall them.
        loop {
            let quiet = self.inner.submitting.load(Ordering::SeqCst) == 0;
            while let Some(record) = self.drain.try_pop() {
                pending.push((record.token(), record));
            }
            if quiet {
                break;
            }
            thread::yield_now();
        }
        pending.extend(
            self.dispatch
                .active
                .drain()
                .map(|(token, active)| (token, active.record)),
        );

        for (token, record) in pending {
            let was_connected = record.is_connected();
            record.set_live(false);
            record.set_connected(false);
            let (is_http, orphaned) = {
                let mut state = record.state();
                let path = state.target.path.clone();
                match &mut state.payload {
                    Payload::Http(exchange) => {
                        exchange.fail(format!("{path} error occurred. reactor stopped"));
                        (true, None)
                    }
                    Payload::Socket(session) | Payload::WebSocket(session) => {
                        let notify = was_connected
                            && !std::mem::replace(&mut session.disconnect_notified, true);
                        (false, notify.then(|| Arc::clone(&session.handler)))
                    }
                    Payload::Idle => (false, None),
                }
            };
            if let Some(handler) = orphaned {
                handler.on_disconnected();
                self.inner.emit(ReactorEvent::Disconnected { token });
            }
            if is_http {
                self.complete_http(token, record);
            } else if record.is_shutdown() {
                self.inner.release(record);
            }
        }
    }
}
