//! Connection bookkeeping shared by the socket and WebSocket clients.

use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::error::{Result, SluiceError};
use sluice_core::reactor::Reactor;
use sluice_core::request::{Payload, Record, SocketHandler, SocketSession};
use sluice_core::transport::{Kind, Target};
use tracing::debug;

pub(crate) struct Session {
    pub(crate) reactor: Arc<Reactor>,
    handler: Arc<dyn SocketHandler>,
    pub(crate) target: Target,
    record: Mutex<Option<Record>>,
}

impl Session {
    pub(crate) fn new(
        reactor: Arc<Reactor>,
        handler: Arc<dyn SocketHandler>,
        target: Target,
    ) -> Self {
        Self {
            reactor,
            handler,
            target,
            record: Mutex::new(None),
        }
    }

    /// Submit a session record unless one is already held.
    pub(crate) fn connect(&self) -> Result<()> {
        let mut slot = self.record.lock();
        if slot.is_some() {
            return Ok(());
        }

        let session = SocketSession::new(Arc::clone(&self.handler));
        let payload = match self.target.kind {
            Kind::WebSocket => Payload::WebSocket(session),
            Kind::RawSocket | Kind::Http => Payload::Socket(session),
        };
        let record = self.reactor.acquire(self.target.clone(), payload).ok_or_else(|| {
            SluiceError::EngineUnavailable(
                self.reactor.disabled_reason().unwrap_or_default().to_string(),
            )
        })?;
        if let Err(e) = self.reactor.submit(&record) {
            self.reactor.release(record);
            return Err(e);
        }
        debug!(peer = %self.target, "session submitted");
        *slot = Some(record);
        Ok(())
    }

    /// Run `f` against the held record, or fail with `NotConnected`.
    pub(crate) fn with_record<T>(&self, f: impl FnOnce(&Record) -> Result<T>) -> Result<T> {
        match &*self.record.lock() {
            Some(record) => f(record),
            None => Err(SluiceError::NotConnected),
        }
    }

    pub(crate) fn reconnect(&self) -> Result<()> {
        let held = self.record.lock().clone();
        match held {
            Some(record) => self.reactor.reconnect(&record),
            None => self.connect(),
        }
    }

    /// Hand the record back to the reactor for teardown and release.
    pub(crate) fn stop(&self) {
        if let Some(record) = self.record.lock().take() {
            debug!(peer = %self.target, "session stopping");
            self.reactor.shutdown(&record);
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.record
            .lock()
            .as_ref()
            .is_some_and(|record| record.is_connected())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.record.lock().as_ref().is_some_and(|record| record.is_live())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
