//! Reactor configuration options
//!
//! This module provides the tunables of one reactor instance: pool and queue
//! sizing, per-connection send buffering, thread placement, keep-alive and the
//! strategies used while idle or while a caller waits for completion.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default number of pre-allocated request records.
pub const DEFAULT_POOL_CAPACITY: usize = 65536;

/// Default number of submission slots.
pub const DEFAULT_QUEUE_CAPACITY: usize = 65536;

/// Default outbound ring size per socket/WebSocket record (8KB).
pub const DEFAULT_SEND_BUFFER_CAPACITY: usize = 8192;

/// Default largest HTTP request body written in one final write.
pub const DEFAULT_MAX_REQUEST_BODY: usize = 2048;

/// Smallest outbound ring that still holds a frame header.
pub const MIN_SEND_BUFFER_CAPACITY: usize = 16;

/// Largest outbound ring; frame offsets are kept in a `u32`.
pub const MAX_SEND_BUFFER_CAPACITY: usize = 1 << 31;

/// Round `capacity` up to a power of two no smaller than `min`.
///
/// Values past the largest representable power of two saturate to it.
#[must_use]
pub fn round_capacity(capacity: usize, min: usize) -> usize {
    capacity
        .max(min)
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

/// Hook run on the reactor thread before the loop starts.
///
/// Receives the resolved CPU index when affinity was requested, so an external
/// pinning routine can apply it.
pub type ThreadInit = Arc<dyn Fn(Option<usize>) + Send + Sync>;

/// What the reactor thread does when no request is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Yield the processor and poll again (lowest latency).
    Yield,
    /// Park the thread for at most the given duration; submissions unpark it.
    Park(Duration),
}

/// How a synchronous caller waits for its request to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Spin on the completion flag, yielding between checks.
    Spin,
    /// Block on a condition variable until the reactor signals completion.
    Park,
}

/// TCP keep-alive parameters handed to the transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe
    pub time: Duration,
    /// Interval between probes
    pub interval: Duration,
    /// Number of unanswered probes before the connection is dropped
    pub probes: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(5),
            interval: Duration::from_secs(1),
            probes: 5,
        }
    }
}

/// Reactor configuration options.
///
/// # Examples
///
/// ```
/// use sluice_core::options::{IdleStrategy, ReactorOptions};
/// use std::time::Duration;
///
/// let opts = ReactorOptions::default()
///     .with_pool_capacity(1024)
///     .with_idle(IdleStrategy::Park(Duration::from_millis(1)));
/// assert_eq!(opts.pool_capacity, 1024);
/// ```
#[derive(Clone)]
pub struct ReactorOptions {
    /// Number of pre-allocated request records (power of two)
    ///
    /// Acquisitions beyond this fall back to heap allocation.
    pub pool_capacity: usize,

    /// Number of submission slots (power of two)
    pub queue_capacity: usize,

    /// Outbound ring size of every socket/WebSocket record (power of two)
    pub send_buffer_capacity: usize,

    /// Processor the reactor thread should run on
    ///
    /// - `None`: no preference (default)
    /// - `Some(n)`: wrapped modulo the number of logical CPUs
    pub cpu_affinity: Option<usize>,

    /// Hook invoked on the reactor thread before the loop starts
    pub thread_init: Option<ThreadInit>,

    /// CA bundle used by TLS-capable engines
    ///
    /// Also the key under which shared reactors are registered.
    pub ca_file: Option<PathBuf>,

    /// Keep-alive parameters for engine connections
    pub keepalive: Keepalive,

    /// Disable Nagle's algorithm on engine connections
    pub tcp_nodelay: bool,

    /// Connection timeout
    ///
    /// Maximum time an engine waits for a connection to complete.
    /// - Default: 0 (no deadline, use OS default)
    pub connect_timeout: Duration,

    /// Behaviour of the reactor thread when nothing is active
    pub idle: IdleStrategy,

    /// Behaviour of synchronous callers waiting for completion
    pub wait: WaitStrategy,

    /// Largest HTTP request body accepted by the writable callback
    pub max_request_body: usize,

    /// Value of the `User-Agent` header added to every HTTP request
    pub user_agent: String,

    /// Optional `Origin` forwarded with HTTP and WebSocket connections
    pub origin: Option<String>,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_buffer_capacity: DEFAULT_SEND_BUFFER_CAPACITY,
            cpu_affinity: None,
            thread_init: None,
            ca_file: None,
            keepalive: Keepalive::default(),
            tcp_nodelay: true,
            connect_timeout: Duration::ZERO,
            idle: IdleStrategy::Yield,
            wait: WaitStrategy::Spin,
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
            user_agent: "sluice".to_string(),
            origin: None,
        }
    }
}

impl fmt::Debug for ReactorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorOptions")
            .field("pool_capacity", &self.pool_capacity)
            .field("queue_capacity", &self.queue_capacity)
            .field("send_buffer_capacity", &self.send_buffer_capacity)
            .field("cpu_affinity", &self.cpu_affinity)
            .field("thread_init", &self.thread_init.is_some())
            .field("ca_file", &self.ca_file)
            .field("keepalive", &self.keepalive)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle", &self.idle)
            .field("wait", &self.wait)
            .field("max_request_body", &self.max_request_body)
            .field("user_agent", &self.user_agent)
            .field("origin", &self.origin)
            .finish()
    }
}

impl ReactorOptions {
    /// Create new reactor options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of pre-allocated request records.
    ///
    /// Rounded up to the next power of two.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = round_capacity(capacity, 1);
        self
    }

    /// Set the number of submission slots.
    ///
    /// Rounded up to the next power of two.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = round_capacity(capacity, 1);
        self
    }

    /// Set the outbound ring size per socket record.
    ///
    /// # Examples
    ///
    /// ```
    /// use sluice_core::options::ReactorOptions;
    ///
    /// let opts = ReactorOptions::new().with_send_buffer_capacity(5000);
    /// assert_eq!(opts.send_buffer_capacity, 8192);
    /// ```
    pub fn with_send_buffer_capacity(mut self, capacity: usize) -> Self {
        self.send_buffer_capacity = send_capacity(capacity);
        self
    }

    /// Request that the reactor thread runs on a given CPU.
    pub fn with_cpu_affinity(mut self, cpu: usize) -> Self {
        self.cpu_affinity = Some(cpu);
        self
    }

    /// Install a hook run on the reactor thread at startup.
    pub fn with_thread_init<F>(mut self, init: F) -> Self
    where
        F: Fn(Option<usize>) + Send + Sync + 'static,
    {
        self.thread_init = Some(Arc::new(init));
        self
    }

    /// Set the CA bundle path.
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Set keep-alive parameters.
    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Enable or disable TCP_NODELAY on engine connections.
    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the idle strategy of the reactor thread.
    pub fn with_idle(mut self, idle: IdleStrategy) -> Self {
        self.idle = idle;
        self
    }

    /// Set the wait strategy of synchronous callers.
    pub fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    /// Set the largest accepted HTTP request body.
    pub fn with_max_request_body(mut self, size: usize) -> Self {
        self.max_request_body = size;
        self
    }

    /// Set the `User-Agent` header value.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Set the `Origin` forwarded with connections.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Bring capacities assigned directly to the public fields back into
    /// range, the way the `with_*` builders would have.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.pool_capacity = round_capacity(self.pool_capacity, 1);
        self.queue_capacity = round_capacity(self.queue_capacity, 1);
        self.send_buffer_capacity = send_capacity(self.send_buffer_capacity);
        self
    }

    /// CPU index the reactor thread should be pinned to, if any.
    ///
    /// The requested index wraps around the number of logical CPUs.
    #[must_use]
    pub fn resolved_cpu(&self) -> Option<usize> {
        self.cpu_affinity.map(|cpu| cpu % num_cpus::get().max(1))
    }

    /// Registry key derived from the TLS configuration.
    #[must_use]
    pub fn registry_key(&self) -> String {
        self.ca_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

/// Outbound ring size for a requested `capacity`.
pub(crate) fn send_capacity(capacity: usize) -> usize {
    round_capacity(capacity.min(MAX_SEND_BUFFER_CAPACITY), MIN_SEND_BUFFER_CAPACITY)
}
