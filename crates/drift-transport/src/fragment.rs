//! Fragmenting send pipeline.
//!
//! A payload longer than the fragment bound is cut into consecutive slices,
//! each written as its own wire datagram to the same destination. No header
//! or sequence number is added and the receiving side does no reassembly, so
//! a peer observes `ceil(len / fragment_size)` ordinary datagrams.
//!
//! Every fragment's write is attempted; the batch then resolves once with
//! either a [`SendReport`] or a single aggregated [`TransportError::Send`].

use crate::datagram::Datagram;
use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

/// Default fragment bound in bytes
pub const DEFAULT_FRAGMENT_SIZE: usize = 8192;

/// Something that can attempt a non-blocking datagram write.
pub trait DatagramSink: Send + Sync {
    /// Write `buf` as one datagram to `dest`.
    ///
    /// Returns [`io::ErrorKind::WouldBlock`] when the socket is not writable.
    fn try_send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

/// Retry policy for a fragment whose socket is not writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First delay after a `WouldBlock`
    pub initial: Duration,
    /// Delay ceiling
    pub max: Duration,
    /// Write attempts per fragment before giving up
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(64),
            attempts: 16,
        }
    }
}

/// One bounded slice of an outbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    index: usize,
    data: Bytes,
    dest: SocketAddr,
}

impl Fragment {
    /// Position within the batch.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Fragment bytes (a view into the original payload).
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Destination address, identical for every fragment of a batch.
    #[must_use]
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }
}

/// Split `payload` into consecutive slices of at most `size` bytes.
///
/// An empty payload yields a single empty slice so it still goes out as one
/// datagram. `size` must be non-zero.
pub fn split(payload: &Bytes, size: usize) -> Vec<Bytes> {
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    (0..payload.len())
        .step_by(size)
        .map(|start| payload.slice(start..(start + size).min(payload.len())))
        .collect()
}

/// Outcome of a fully successful batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Datagrams written
    pub fragments: usize,
    /// Payload bytes written
    pub bytes: usize,
}

/// The fragments of one outbound datagram and their combined completion.
#[derive(Debug, Clone)]
pub struct SendBatch {
    fragments: Vec<Fragment>,
    backoff: Backoff,
}

impl SendBatch {
    /// Fragment `datagram` with bound `fragment_size`.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidConfig`] if `fragment_size` is zero.
    pub fn new(datagram: &Datagram, fragment_size: usize) -> TransportResult<Self> {
        if fragment_size == 0 {
            return Err(TransportError::InvalidConfig(
                "fragment size must be at least 1 byte".to_string(),
            ));
        }
        let dest = datagram.peer();
        let fragments = split(datagram.data(), fragment_size)
            .into_iter()
            .enumerate()
            .map(|(index, data)| Fragment { index, data, dest })
            .collect();
        Ok(Self {
            fragments,
            backoff: Backoff::default(),
        })
    }

    /// Replace the not-writable retry policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fragments in payload order.
    #[must_use]
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Number of fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Always false; a batch holds at least one fragment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Attempt every fragment in order, then resolve once.
    ///
    /// Fragments written before a failure stay sent; nothing is retried
    /// beyond the writability backoff.
    ///
    /// # Errors
    /// Returns [`TransportError::Send`] describing the first failure if any
    /// fragment could not be written.
    pub async fn send<S>(&self, sink: &S) -> TransportResult<SendReport>
    where
        S: DatagramSink + ?Sized,
    {
        let total = self.fragments.len();
        let mut failed = 0;
        let mut first: Option<String> = None;
        let mut bytes = 0;

        for fragment in &self.fragments {
            match self.write(sink, fragment).await {
                Ok(n) => bytes += n,
                Err(e) => {
                    debug!(
                        index = fragment.index,
                        dest = %fragment.dest,
                        error = %e,
                        "Fragment write failed"
                    );
                    failed += 1;
                    first.get_or_insert_with(|| e.to_string());
                }
            }
        }

        match first {
            None => {
                trace!(fragments = total, bytes, "Send batch complete");
                Ok(SendReport {
                    fragments: total,
                    bytes,
                })
            }
            Some(first) => Err(TransportError::Send {
                failed,
                total,
                first,
            }),
        }
    }

    async fn write<S>(&self, sink: &S, fragment: &Fragment) -> io::Result<usize>
    where
        S: DatagramSink + ?Sized,
    {
        let mut delay = self.backoff.initial;
        let mut attempt = 0;
        loop {
            match sink.try_send_to(&fragment.data, fragment.dest) {
                Ok(n) if n == fragment.data.len() => return Ok(n),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write: {} of {} bytes", n, fragment.data.len()),
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempt += 1;
                    if attempt >= self.backoff.attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.backoff.max);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
