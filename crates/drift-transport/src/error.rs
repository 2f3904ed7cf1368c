//! Transport error taxonomy.

use crate::socket::SocketId;
use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation attempted on, or interrupted by, a closed socket
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Fixed-peer connect failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No data arrived before the receive deadline
    #[error("Read timed out")]
    Timeout,

    /// One or more fragment writes of a send batch failed
    #[error("Failed to send data: {failed} of {total} fragments failed, first error: {first}")]
    Send {
        /// Number of fragments whose write failed
        failed: usize,
        /// Number of fragments in the batch
        total: usize,
        /// Description of the first failure encountered
        first: String,
    },

    /// A service callback failed or its arguments could not be built
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A receive is already outstanding on the socket
    #[error("A receive is already pending on socket {0}")]
    AlreadyPending(SocketId),

    /// The reactor refused or failed the socket registration
    #[error("Registration failed: {0}")]
    Registration(String),

    /// The reactor pool is shutting down
    #[error("Reactor pool is shutting down")]
    ShuttingDown,

    /// A receive asked for fewer than one byte
    #[error("Requested byte length need to be 1 or more")]
    InvalidLength,
}

impl TransportError {
    /// Whether this error is a receive deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether this error reports a closed socket.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
