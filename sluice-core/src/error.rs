//! Sluice Error Types
//!
//! Error handling for pool, ring, reactor and transport operations.

use std::io;
use thiserror::Error;

/// Main error type for Sluice operations
#[derive(Error, Debug)]
pub enum SluiceError {
    /// IO error reported by a transport engine
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No request record could be obtained
    #[error("Request pool exhausted")]
    PoolExhausted,

    /// The transport engine context could not be created
    #[error("Transport engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Message does not fit into the outbound ring
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Zero-length writes are rejected
    #[error("Empty message")]
    EmptyMessage,

    /// The outbound ring is being reset
    #[error("Outbound buffer is resetting")]
    Resetting,

    /// Another writer is already active on the same ring
    #[error("Concurrent write on outbound buffer")]
    ConcurrentWrite,

    /// The rest of a multi-part write was dropped
    #[error("Write discarded")]
    Discarded,

    /// The request has no live connection handle
    #[error("Not connected")]
    NotConnected,

    /// The reactor is stopping or already stopped
    #[error("Reactor shutting down")]
    ShuttingDown,

    /// Connection-level failure reported by the engine
    #[error("Connection error: {0}")]
    Connection(String),

    /// Engine-level failure that is not tied to one connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// A reservation larger than the ring itself
    #[error("Requested {requested} slots (capacity: {capacity})")]
    CapacityExceeded { requested: usize, capacity: usize },
}

/// Result type alias for Sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

impl SluiceError {
    /// Create a connection error with a message
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a transport error with a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Check if retrying the same call later can succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Resetting | Self::ConcurrentWrite | Self::NotConnected => true,
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SluiceError::MessageTooLarge { size: 9000, max: 8187 };
        assert_eq!(err.to_string(), "Message too large: 9000 bytes (max: 8187)");
        assert_eq!(
            SluiceError::connection("refused").to_string(),
            "Connection error: refused"
        );
    }

    #[test]
    fn test_classification() {
        assert!(SluiceError::Resetting.is_recoverable());
        assert!(SluiceError::Io(io::ErrorKind::WouldBlock.into()).is_recoverable());
        assert!(!SluiceError::PoolExhausted.is_recoverable());
        assert!(SluiceError::NotConnected.is_connection_error());
        assert!(!SluiceError::EmptyMessage.is_connection_error());
    }
}
