//! Sluice Core
//!
//! This crate contains the reactor kernel behind the `sluice` clients:
//! - Fixed-capacity record recycling (`pool`)
//! - Ordered multi-producer submission ring (`submission`)
//! - Framed single-writer outbound byte ring (`byte_ring`)
//! - Request records and their HTTP / socket variants (`request`)
//! - Transport engine contract plus scripted and TCP engines (`transport`)
//! - The reactor thread and its handle (`reactor`)
//! - Shared reactors keyed by TLS configuration (`registry`)
//! - Raw TCP server with per-client outbound rings (`server`)
//! - Lifecycle events (`monitor`)
//! - Error types (`error`)

// The ring modules opt back in with their own allow
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod byte_ring;
pub mod completion;
pub mod error;
pub mod monitor;
pub mod options;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod request;
pub mod server;
pub mod submission;
pub mod transport;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::byte_ring::{ByteRing, Frame};
    pub use crate::error::{Result, SluiceError};
    pub use crate::monitor::{ReactorEvent, ReactorMonitor};
    pub use crate::options::{IdleStrategy, Keepalive, ReactorOptions, WaitStrategy};
    pub use crate::pool::{ObjectPool, Pooled};
    pub use crate::reactor::Reactor;
    pub use crate::registry::ReactorRegistry;
    pub use crate::request::{
        HttpExchange, HttpRequest, HttpResponse, Payload, Record, SocketHandler, SocketSession,
    };
    pub use crate::server::{ClientId, ServerHandle, ServerHandler, SocketServer};
    pub use crate::transport::{Kind, Target, Transport};
}
