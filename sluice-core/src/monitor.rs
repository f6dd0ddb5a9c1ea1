//! Reactor event monitoring.
//!
//! Provides event streams for tracking request lifecycle events like
//! connections, disconnections, completions and releases.

use std::fmt;

use crate::transport::Token;

/// Request lifecycle events emitted by the reactor thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorEvent {
    /// A connect call was issued.
    Connecting { token: Token, target: String },

    /// The connection is established.
    Connected { token: Token },

    /// Connecting failed or the connection reported an error.
    ConnectFailed { token: Token, reason: String },

    /// The connection closed.
    Disconnected { token: Token },

    /// An HTTP exchange finished.
    Completed { token: Token, status: u16 },

    /// The record went back to the pool.
    Released { token: Token },
}

impl fmt::Display for ReactorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { token, target } => write!(f, "[{token}] Connecting to {target}"),
            Self::Connected { token } => write!(f, "[{token}] Connected"),
            Self::ConnectFailed { token, reason } => {
                write!(f, "[{token}] Connect failed: {reason}")
            }
            Self::Disconnected { token } => write!(f, "[{token}] Disconnected"),
            Self::Completed { token, status } => write!(f, "[{token}] Completed with {status}"),
            Self::Released { token } => write!(f, "[{token}] Released"),
        }
    }
}

/// Handle for receiving reactor events.
pub type ReactorMonitor = flume::Receiver<ReactorEvent>;

/// Sending side of a monitor channel.
pub type ReactorEventSender = flume::Sender<ReactorEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ReactorEventSender, ReactorMonitor) {
    flume::unbounded()
}
