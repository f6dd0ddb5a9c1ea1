//! # Sluice
//!
//! HTTP, WebSocket and raw socket clients that share one reactor thread.
//!
//! ## Architecture
//!
//! - **`sluice-core`**: object pool, submission ring, framed byte rings,
//!   request records, the reactor loop and the transport engine contract
//! - **`sluice`**: client API surface (this crate)
//!
//! Callers never touch the transport engine. They take a record from a
//! fixed-capacity pool, publish it on the submission ring and either wait on
//! its completion flag or get called back on the reactor thread. Outbound
//! socket traffic goes through a per-connection byte ring that the reactor
//! drains one message per writable event.
//!
//! ## Quick Start
//!
//! ### HTTP
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice::prelude::*;
//! use sluice::transport::tcp::TcpTransport;
//!
//! let reactor = Arc::new(Reactor::start(ReactorOptions::default(), TcpTransport::factory));
//! let client = HttpClient::for_port(reactor, "api.example.com", 80);
//!
//! let response = client.get("/v1/ping");
//! if !response.is_success() {
//!     eprintln!("{}: {}", response.status, response.text());
//! }
//! ```
//!
//! ### Shared reactors
//!
//! ```rust
//! use sluice::prelude::*;
//! use sluice::transport::tcp::TcpTransport;
//!
//! let options = ReactorOptions::new().with_pool_capacity(16);
//! let registry = ReactorRegistry::new();
//! let a = registry.get_or_start(options.clone(), TcpTransport::factory);
//! let b = registry.get_or_start(options, TcpTransport::factory);
//! assert!(std::sync::Arc::ptr_eq(&a, &b));
//! registry.shutdown();
//! ```
//!
//! ## Transport engines
//!
//! The reactor drives any [`transport::Transport`]. Two ship with the core:
//! a non-blocking TCP engine speaking raw sockets, HTTP/1.1 and WebSocket
//! over plaintext connections, and a scripted in-memory engine for tests and
//! demos. TLS targets need an engine that supports them; the TCP engine
//! fails them with a connection error.
//!
//! ## Servers
//!
//! [`SocketServer`] accepts raw TCP clients on its own thread and hands
//! their bytes to a [`ServerHandler`]. Replies go through a per-client
//! outbound ring, so any thread can send.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;
pub use sluice_core::error::{Result, SluiceError};
pub use sluice_core::monitor::{ReactorEvent, ReactorMonitor};
pub use sluice_core::options::{IdleStrategy, Keepalive, ReactorOptions, WaitStrategy};
pub use sluice_core::reactor::Reactor;
pub use sluice_core::registry::ReactorRegistry;
pub use sluice_core::request::{HttpRequest, HttpResponse, SocketHandler};
pub use sluice_core::server::{ClientId, ServerHandle, ServerHandler, SocketServer};
pub use sluice_core::transport;

pub mod dev_tracing;
mod http;
mod session;
mod socket;
mod websocket;

pub use http::HttpClient;
pub use socket::SocketClient;
pub use websocket::WebSocketClient;

/// Everything needed to start a reactor and use the clients.
pub mod prelude {
    pub use crate::{
        ClientId, HttpClient, HttpRequest, HttpResponse, IdleStrategy, ReactorEvent,
        ReactorOptions, ReactorRegistry, Reactor, ServerHandle, ServerHandler, SocketClient,
        SocketHandler, SocketServer, SluiceError, WaitStrategy, WebSocketClient,
    };
}
