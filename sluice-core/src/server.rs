//! Raw TCP server
//!
//! The listening counterpart of the raw socket client. One thread accepts
//! connections and services every client without blocking:
//!
//! ```text
//! any thread                         server thread
//! ----------                         -------------
//! send(client, bytes) -> client's    accept new clients
//!                        byte ring   drain rings into the sockets
//! close(client)       -> flag        read sockets, call the handler
//! ```
//!
//! Each client gets its own [`ByteRing`], so sends to different clients
//! never contend. A ring has a single writer: concurrent sends to the same
//! client fail with `ConcurrentWrite`.

use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::byte_ring::ByteRing;
use crate::error::{Result, SluiceError};
use crate::options::{IdleStrategy, ReactorOptions};
use crate::transport::tcp::{Outbox, TcpConfig, MAX_READS_PER_SERVICE, READ_BUFFER_SIZE};

/// Name of every server thread.
pub const THREAD_NAME: &str = "sluice-server";

/// Pending connections the kernel queues for `accept`.
const LISTEN_BACKLOG: i32 = 128;

/// Identifies one accepted connection. Never reused within a server.
pub type ClientId = u64;

/// Server callbacks.
///
/// All methods run on the server thread and must not block. Sending from a
/// callback is allowed, but spins while that client's ring is full.
pub trait ServerHandler: Send + Sync {
    fn on_connected(&self, _server: &ServerHandle, _client: ClientId, _peer: SocketAddr) {}

    /// Called once per client, however the connection ended.
    fn on_disconnected(&self, _server: &ServerHandle, _client: ClientId) {}

    fn on_data(&self, server: &ServerHandle, client: ClientId, data: &[u8]);
}

struct ClientSlot {
    outbound: ByteRing,
    closing: AtomicBool,
}

struct Shared {
    clients: RwLock<HashMap<ClientId, Arc<ClientSlot>>>,
    running: AtomicBool,
    thread: OnceLock<Thread>,
    local_addr: SocketAddr,
}

/// Cloneable handle for sending to and closing clients from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.shared.local_addr)
            .field("clients", &self.clients())
            .finish()
    }
}

impl ServerHandle {
    /// Queue `data` for `client`.
    pub fn send(&self, client: ClientId, data: &[u8]) -> Result<()> {
        let slot = self.slot(client)?;
        slot.outbound.write(data, 0)?;
        self.wake();
        Ok(())
    }

    /// Disconnect `client` once its queued bytes had one chance to go out.
    pub fn close(&self, client: ClientId) -> Result<()> {
        let slot = self.slot(client)?;
        slot.closing.store(true, Ordering::Release);
        self.wake();
        Ok(())
    }

    /// Number of connected clients.
    #[must_use]
    pub fn clients(&self) -> usize {
        self.shared.clients.read().len()
    }

    #[must_use]
    pub fn is_connected(&self, client: ClientId) -> bool {
        self.slot(client).is_ok()
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn slot(&self, client: ClientId) -> Result<Arc<ClientSlot>> {
        match self.shared.clients.read().get(&client) {
            Some(slot) if !slot.closing.load(Ordering::Acquire) => Ok(Arc::clone(slot)),
            _ => Err(SluiceError::NotConnected),
        }
    }

    fn wake(&self) {
        if let Some(thread) = self.shared.thread.get() {
            thread.unpark();
        }
    }
}

/// A listening socket and the thread serving its clients.
///
/// Dereferences to its [`ServerHandle`]. Dropping the server stops it.
pub struct SocketServer {
    handle: ServerHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketServer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl SocketServer {
    /// Listen on every interface at `port` (0 picks a free one).
    pub fn serve(
        port: u16,
        options: &ReactorOptions,
        handler: Arc<dyn ServerHandler>,
    ) -> Result<Self> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port)), options, handler)
    }

    /// Listen on `addr`.
    ///
    /// Uses the options' send buffer size per client, keep-alive, nodelay,
    /// idle strategy, CPU affinity and thread hook.
    pub fn bind(
        addr: SocketAddr,
        options: &ReactorOptions,
        handler: Arc<dyn ServerHandler>,
    ) -> Result<Self> {
        let options = options.clone().normalized();
        let listener = listen(addr)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            clients: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
            thread: OnceLock::new(),
            local_addr,
        });
        let handle = ServerHandle {
            shared: Arc::clone(&shared),
        };
        let server_loop = ServerLoop {
            listener,
            config: TcpConfig::from_options(&options),
            handle: handle.clone(),
            handler,
            conns: HashMap::new(),
            next_id: 1,
            buf: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            options,
        };

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || server_loop.run())?;
        let _ = shared.thread.set(thread.thread().clone());
        info!(%local_addr, "socket server listening");

        Ok(Self {
            handle,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// A handle that outlives borrows of the server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stop accepting, disconnect every client and wait for the thread.
    ///
    /// Calling this from a handler callback only signals the stop.
    pub fn stop(&self) {
        if self.handle.shared.running.swap(false, Ordering::AcqRel) {
            debug!(addr = %self.handle.local_addr(), "stopping socket server");
        }
        self.handle.wake();

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("socket server thread panicked");
            }
        }
    }
}

impl Deref for SocketServer {
    type Target = ServerHandle;

    fn deref(&self) -> &ServerHandle {
        &self.handle
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

struct ServerConn {
    stream: TcpStream,
    slot: Arc<ClientSlot>,
    outbox: Outbox,
}

enum Pump {
    Idle,
    Busy,
    Gone,
}

struct ServerLoop {
    listener: TcpListener,
    config: TcpConfig,
    handle: ServerHandle,
    handler: Arc<dyn ServerHandler>,
    conns: HashMap<ClientId, ServerConn>,
    next_id: ClientId,
    buf: Box<[u8]>,
    options: ReactorOptions,
}

impl ServerLoop {
    fn run(mut self) {
        let cpu = self.options.resolved_cpu();
        if let Some(init) = &self.options.thread_init {
            init(cpu);
        }

        while self.handle.is_running() {
            let mut busy = self.accept();
            let mut gone: SmallVec<[ClientId; 8]> = SmallVec::new();
            for (&id, conn) in &mut self.conns {
                match Self::pump(id, conn, &mut self.buf, &*self.handler, &self.handle) {
                    Pump::Idle => {}
                    Pump::Busy => busy = true,
                    Pump::Gone => gone.push(id),
                }
            }
            for id in gone {
                self.disconnect(id);
            }
            if !busy {
                self.idle();
            }
        }

        let ids: Vec<ClientId> = self.conns.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        info!("socket server stopped");
    }

    fn idle(&self) {
        match self.options.idle {
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Park(timeout) => thread::park_timeout(timeout),
        }
    }

    /// Take every pending connection. Returns whether any arrived.
    fn accept(&mut self) -> bool {
        let mut accepted = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.config.apply(&stream) {
                        warn!(%peer, error = %e, "failed to configure client socket");
                        continue;
                    }
                    let id = self.next_id;
                    self.next_id += 1;
                    let slot = Arc::new(ClientSlot {
                        outbound: ByteRing::new(self.options.send_buffer_capacity),
                        closing: AtomicBool::new(false),
                    });
                    self.handle
                        .shared
                        .clients
                        .write()
                        .insert(id, Arc::clone(&slot));
                    self.conns.insert(
                        id,
                        ServerConn {
                            stream,
                            slot,
                            outbox: Outbox::default(),
                        },
                    );
                    debug!(client = id, %peer, "client connected");
                    self.handler.on_connected(&self.handle, id, peer);
                    accepted = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        accepted
    }

    fn pump(
        id: ClientId,
        conn: &mut ServerConn,
        buf: &mut [u8],
        handler: &dyn ServerHandler,
        handle: &ServerHandle,
    ) -> Pump {
        let mut busy = false;
        // Sampled first so bytes sent before `close` are drained below.
        let closing = conn.slot.closing.load(Ordering::Acquire);

        if let Err(e) = conn.outbox.flush(&mut conn.stream) {
            debug!(client = id, error = %e, "client write failed");
            return Pump::Gone;
        }
        while conn.outbox.is_empty() {
            let Some(frame) = conn.slot.outbound.read() else {
                break;
            };
            busy = true;
            if let Err(e) = conn.outbox.send(&mut conn.stream, &frame) {
                debug!(client = id, error = %e, "client write failed");
                return Pump::Gone;
            }
        }

        if closing {
            return Pump::Gone;
        }

        for _ in 0..MAX_READS_PER_SERVICE {
            match conn.stream.read(buf) {
                Ok(0) => return Pump::Gone,
                Ok(n) => {
                    busy = true;
                    handler.on_data(handle, id, &buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(client = id, error = %e, "client read failed");
                    return Pump::Gone;
                }
            }
        }

        if busy {
            Pump::Busy
        } else {
            Pump::Idle
        }
    }

    fn disconnect(&mut self, id: ClientId) {
        self.handle.shared.clients.write().remove(&id);
        if let Some(conn) = self.conns.remove(&id) {
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            debug!(client = id, "client disconnected");
            self.handler.on_disconnected(&self.handle, id);
        }
    }
}
