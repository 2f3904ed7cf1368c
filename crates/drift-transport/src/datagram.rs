//! Datagram value type.

use bytes::Bytes;
use std::net::SocketAddr;

/// One unit of payload plus peer address.
///
/// The peer is the sender on receive and the destination on send. The
/// payload is an immutable [`Bytes`] view, so a received datagram can be
/// shared between tasks without copying and without any holder being able
/// to mutate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    data: Bytes,
    peer: SocketAddr,
}

impl Datagram {
    /// Create a datagram from a payload and a peer address.
    pub fn new(data: impl Into<Bytes>, peer: SocketAddr) -> Self {
        Self {
            data: data.into(),
            peer,
        }
    }

    /// Payload bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Sender (inbound) or destination (outbound) address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Split into payload and peer address.
    #[must_use]
    pub fn into_parts(self) -> (Bytes, SocketAddr) {
        (self.data, self.peer)
    }
}
