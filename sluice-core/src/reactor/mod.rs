//! The reactor: one thread driving one transport engine
//!
//! Caller threads talk to the reactor through a [`Reactor`] handle:
//!
//! ```text
//! caller thread                         reactor thread
//! -------------                         --------------
//! acquire()  -> record from the pool
//! submit()   -> submission ring  ---->  connect through the engine
//! write()    -> record's byte ring      service(): engine callbacks
//! wait()     <- completion flag  <----  sweep: complete / release
//! ```
//!
//! The handle never touches the engine. Everything a caller does is a pool
//! operation, a ring operation or an atomic flag, followed by a wake-up.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Instant;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{error, info, warn};

use crate::error::{Result, SluiceError};
use crate::monitor::{create_monitor, ReactorEvent, ReactorEventSender, ReactorMonitor};
use crate::options::{ReactorOptions, WaitStrategy};
use crate::pool::ObjectPool;
use crate::request::{Payload, Record, Request};
use crate::submission::{self, Submitter};
use crate::transport::{Target, Transport, Wake};

mod dispatch;
mod event_loop;

use event_loop::EventLoop;

/// Name of every reactor thread.
pub const THREAD_NAME: &str = "sluice-reactor";

/// First byte of a queued WebSocket frame: text message.
pub(crate) const WS_TEXT: u8 = 1;
/// First byte of a queued WebSocket frame: binary message.
pub(crate) const WS_BINARY: u8 = 2;

/// State shared between the handle and the reactor thread.
pub(crate) struct Inner {
    pub(crate) options: ReactorOptions,
    pub(crate) pool: ObjectPool<Request>,
    submitter: Submitter<Record>,
    pub(crate) running: AtomicBool,
    /// Callers between their running check and publishing on the ring
    pub(crate) submitting: AtomicUsize,
    waker: Arc<dyn Wake>,
    headroom: usize,
    thread: OnceLock<Thread>,
    monitors: Mutex<Vec<ReactorEventSender>>,
    has_monitors: AtomicBool,
}

impl Inner {
    pub(crate) fn emit(&self, event: ReactorEvent) {
        if !self.has_monitors.load(Ordering::Acquire) {
            return;
        }
        let mut monitors = self.monitors.lock();
        monitors.retain(|tx| tx.send(event.clone()).is_ok());
        if monitors.is_empty() {
            self.has_monitors.store(false, Ordering::Release);
        }
    }

    /// Clear a record and hand it back to the pool.
    pub(crate) fn release(&self, record: Record) {
        let token = record.token();
        record.clear();
        self.pool.release(record);
        self.emit(ReactorEvent::Released { token });
    }

    fn wake(&self) {
        self.waker.wake();
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

/// Handle to one reactor thread.
///
/// Cheap operations only: every method is safe to call from any thread and
/// none of them blocks on the reactor, except the explicit waits.
pub struct Reactor {
    inner: Option<Arc<Inner>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    disabled: Option<String>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("enabled", &self.is_enabled())
            .field("running", &self.is_running())
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Create the engine with `factory` and start the reactor thread.
    ///
    /// If the engine cannot be created, or the thread cannot be spawned, the
    /// reactor is returned disabled: [`Reactor::acquire`] yields `None` and
    /// callers report the failure themselves.
    pub fn start<F>(options: ReactorOptions, factory: F) -> Self
    where
        F: FnOnce(&ReactorOptions) -> Result<Box<dyn Transport>>,
    {
        let options = options.normalized();
        let engine = match factory(&options) {
            Ok(engine) => engine,
            Err(e) => {
                error!(error = %e, "failed to create transport engine, reactor disabled");
                return Self::disabled(e.to_string());
            }
        };

        let send_capacity = options.send_buffer_capacity;
        let pool = ObjectPool::with_init(options.pool_capacity, |_| Request::new(send_capacity));
        let (submitter, drain) = submission::channel(options.queue_capacity);
        let inner = Arc::new(Inner {
            waker: engine.waker(),
            headroom: engine.headroom(),
            options,
            pool,
            submitter,
            running: AtomicBool::new(true),
            submitting: AtomicUsize::new(0),
            thread: OnceLock::new(),
            monitors: Mutex::new(Vec::new()),
            has_monitors: AtomicBool::new(false),
        });

        let event_loop = EventLoop::new(Arc::clone(&inner), engine, drain);
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || event_loop.run());

        match spawned {
            Ok(handle) => {
                let _ = inner.thread.set(handle.thread().clone());
                Self {
                    inner: Some(inner),
                    handle: Mutex::new(Some(handle)),
                    disabled: None,
                }
            }
            Err(e) => {
                error!(error = %e, "failed to spawn reactor thread, reactor disabled");
                Self::disabled(e.to_string())
            }
        }
    }

    fn disabled(reason: String) -> Self {
        Self {
            inner: None,
            handle: Mutex::new(None),
            disabled: Some(reason),
        }
    }

    /// Whether the engine was created and the thread started.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Why the reactor is disabled, if it is.
    #[must_use]
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled.as_deref()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.running.load(Ordering::Acquire))
    }

    /// Options the reactor was started with.
    #[must_use]
    pub fn options(&self) -> Option<&ReactorOptions> {
        self.inner.as_ref().map(|inner| &inner.options)
    }

    /// Scratch bytes the engine expects in front of WebSocket payloads.
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.headroom)
    }

    /// Take a record from the pool and prepare it for `payload`.
    ///
    /// Returns `None` when the reactor is disabled.
    pub fn acquire(&self, target: Target, payload: Payload) -> Option<Record> {
        let inner = self.inner.as_ref()?;
        let send_capacity = inner.options.send_buffer_capacity;
        let record = inner.pool.acquire_or_else(|| Request::new(send_capacity));
        record.prepare(target, payload);
        Some(record)
    }

    /// Hand a prepared record to the reactor thread.
    ///
    /// Once this returns `Ok` the reactor owns the record: it completes it,
    /// or fails it when the loop stops, and releases it unless a waiting
    /// caller takes it back.
    pub fn submit(&self, record: &Record) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Err(self.unavailable());
        };
        // Paired with the drain in the loop's exit path: either the loop
        // sees this submit in flight, or this submit sees the stop.
        inner.submitting.fetch_add(1, Ordering::SeqCst);
        let result = if inner.running.load(Ordering::SeqCst) {
            record.set_submitted(true);
            inner.submitter.submit(Arc::clone(record))
        } else {
            Err(SluiceError::ShuttingDown)
        };
        inner.submitting.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => inner.wake(),
            Err(_) => record.set_submitted(false),
        }
        result
    }

    /// Wait for a submitted HTTP record to complete.
    pub fn wait(&self, record: &Record) {
        let strategy = self
            .inner
            .as_ref()
            .map_or(WaitStrategy::Spin, |inner| inner.options.wait);
        record.completion().wait(strategy);
    }

    /// Wait for completion until `deadline`.
    ///
    /// On `false` the wait was abandoned: the reactor releases the record
    /// when it eventually completes, and the caller must drop it unreleased.
    pub fn wait_until(&self, record: &Record, deadline: Instant) -> bool {
        let strategy = self
            .inner
            .as_ref()
            .map_or(WaitStrategy::Spin, |inner| inner.options.wait);
        record.completion().wait_until(strategy, deadline)
    }

    /// Return a record the caller owns to the pool.
    ///
    /// A record the reactor still holds (a live socket session, or an HTTP
    /// request that has not completed) is not recycled: it is shut down
    /// instead and the reactor releases it once the engine lets go.
    pub fn release(&self, record: Record) {
        let Some(inner) = &self.inner else {
            return;
        };
        if record.is_submitted() && !record.completion().is_done() {
            warn!(
                token = record.token(),
                "record still held by the reactor, shutting it down instead of releasing"
            );
            record.completion().abandon();
            record.set_shutdown();
            inner.wake();
            return;
        }
        inner.release(record);
    }

    /// Queue one message on a live socket record.
    pub fn write(&self, record: &Record, data: &[u8]) -> Result<()> {
        if !record.is_live() {
            return Err(SluiceError::NotConnected);
        }
        record.outbound().write(data, 0)
    }

    /// Queue `header` followed by `payload` as one message.
    ///
    /// The header is reserved first and the payload appended with the
    /// partial-write protocol, without concatenating the two.
    pub fn write_parts(&self, record: &Record, header: &[u8], payload: &[u8]) -> Result<()> {
        if !record.is_live() {
            return Err(SluiceError::NotConnected);
        }
        let ring = record.outbound();
        match (header.is_empty(), payload.is_empty()) {
            (true, _) => ring.write(payload, 0),
            (false, true) => ring.write(header, 0),
            (false, false) => {
                ring.write(header, payload.len())?;
                ring.write(payload, 0)
            }
        }
    }

    /// Queue a WebSocket message with room for the engine's framing.
    pub fn write_message(&self, record: &Record, payload: &[u8], binary: bool) -> Result<()> {
        let mut header: SmallVec<[u8; 32]> = SmallVec::new();
        header.push(if binary { WS_BINARY } else { WS_TEXT });
        header.resize(1 + self.headroom(), 0);
        self.write_parts(record, &header, payload)
    }

    /// Ask the reactor to close a socket session and release its record.
    pub fn shutdown(&self, record: &Record) {
        record.set_shutdown();
        if let Some(inner) = &self.inner {
            inner.wake();
        }
    }

    /// Ask the reactor to connect a disconnected socket session again.
    ///
    /// A no-op while the engine still holds a handle for the record.
    pub fn reconnect(&self, record: &Record) -> Result<()> {
        let inner = self.running_inner()?;
        if record.is_live() {
            return Ok(());
        }
        record.request_reconnect();
        inner.wake();
        Ok(())
    }

    /// Subscribe to lifecycle events.
    pub fn monitor(&self) -> ReactorMonitor {
        let (tx, rx) = create_monitor();
        if let Some(inner) = &self.inner {
            inner.monitors.lock().push(tx);
            inner.has_monitors.store(true, Ordering::Release);
        }
        rx
    }

    /// Stop the reactor thread and wait for it to exit.
    ///
    /// Pending HTTP requests complete with an error response. Calling this
    /// from a reactor callback only signals the stop.
    pub fn stop(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.running.swap(false, Ordering::SeqCst) {
            info!("stopping reactor");
        }
        inner.wake();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }

    fn running_inner(&self) -> Result<&Arc<Inner>> {
        match &self.inner {
            Some(inner) if inner.running.load(Ordering::Acquire) => Ok(inner),
            Some(_) => Err(SluiceError::ShuttingDown),
            None => Err(self.unavailable()),
        }
    }

    fn unavailable(&self) -> SluiceError {
        SluiceError::EngineUnavailable(self.disabled.clone().unwrap_or_default())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}
