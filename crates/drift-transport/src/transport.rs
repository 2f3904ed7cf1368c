//! Transport lifecycle manager.
//!
//! [`UdpTransport`] owns one socket from bind to close:
//! `Created -> Bound -> (Connected) -> Registered -> Closing -> Closed`.
//! Receives go through the pool's correlation tables and are served by
//! whichever side (reactor or caller) completes the pending/ready match.

use crate::config::ResolvedEndpoint;
use crate::correlation::PendingReceive;
use crate::datagram::Datagram;
use crate::error::{TransportError, TransportResult};
use crate::fragment::{SendBatch, SendReport};
use crate::reactor::{self, ReactorPool};
use crate::socket::{self, SocketEntry, SocketId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock-free counters behind [`TransportStats`], updated from any thread.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet bound
    Created,
    /// Bound to a local address
    Bound,
    /// Associated with a fixed remote peer
    Connected,
    /// Registered with a reactor; receives are possible
    Registered,
    /// Close in progress
    Closing,
    /// Closed; every operation fails with [`TransportError::Closed`]
    Closed,
}

/// A registered UDP socket.
pub struct UdpTransport {
    pool: Arc<ReactorPool>,
    entry: Arc<SocketEntry>,
    state: Mutex<LifecycleState>,
    receiving: AtomicBool,
    read_timeout: Option<Duration>,
    fragment_size: usize,
}

impl UdpTransport {
    /// Bind, optionally connect, and register a socket with `pool`.
    ///
    /// # Errors
    /// - [`TransportError::BindFailed`] if the local address cannot be bound
    /// - [`TransportError::ConnectionFailed`] if the fixed peer cannot be set
    /// - [`TransportError::Registration`] / [`TransportError::ShuttingDown`]
    ///   if the reactor does not accept the socket
    pub async fn open(pool: &Arc<ReactorPool>, endpoint: &ResolvedEndpoint) -> TransportResult<Self> {
        let mut state = LifecycleState::Created;

        let udp = socket::bind(endpoint.local)?;
        state = transition(state, LifecycleState::Bound);

        if let Some(peer) = endpoint.remote {
            socket::connect(&udp, peer)?;
            state = transition(state, LifecycleState::Connected);
        }

        let entry = Arc::new(SocketEntry::new(udp, endpoint.remote)?);
        pool.register(entry.clone()).await?;
        state = transition(state, LifecycleState::Registered);

        debug!(
            socket = %entry.id(),
            local = %entry.local_addr(),
            peer = ?entry.peer(),
            "Transport opened"
        );

        Ok(Self {
            pool: pool.clone(),
            entry,
            state: Mutex::new(state),
            receiving: AtomicBool::new(false),
            read_timeout: endpoint.read_timeout,
            fragment_size: endpoint.fragment_size,
        })
    }

    /// Socket identifier.
    pub fn id(&self) -> SocketId {
        self.entry.id()
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.entry.local_addr()
    }

    /// Fixed remote peer, if connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.entry.peer()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Whether the transport still accepts operations.
    pub fn is_open(&self) -> bool {
        self.entry.is_open()
    }

    /// Deadline applied to each receive.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Counters for this socket.
    pub fn stats(&self) -> TransportStats {
        self.entry.stats().snapshot()
    }

    /// Receive one whole datagram.
    ///
    /// # Errors
    /// - [`TransportError::Timeout`] if nothing arrives within the read timeout
    /// - [`TransportError::Closed`] if the transport is or becomes closed
    /// - [`TransportError::AlreadyPending`] if another receive is outstanding
    pub async fn receive(&self) -> TransportResult<Datagram> {
        self.receive_inner(None).await
    }

    /// Receive one datagram, keeping at most `len` bytes of it.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidLength`] if `len` is zero, otherwise
    /// the same errors as [`receive`](Self::receive).
    pub async fn receive_up_to(&self, len: usize) -> TransportResult<Datagram> {
        if len < 1 {
            return Err(TransportError::InvalidLength);
        }
        self.receive_inner(Some(len)).await
    }

    async fn receive_inner(&self, max_len: Option<usize>) -> TransportResult<Datagram> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let mut guard = ReceiveGuard::acquire(self)?;
        let id = self.entry.id();
        let tables = self.pool.tables();

        let (tx, rx) = oneshot::channel();
        let pending = PendingReceive::new(max_len, tx);
        let ticket = pending.ticket();
        tables.mark_pending(id, pending)?;
        guard.ticket = Some(ticket);

        if !self.is_open() {
            // Closed between the first check and the insert; clear() may have run already.
            if let Some(pending) = tables.take_pending(id, ticket) {
                pending.complete(Err(TransportError::Closed));
            }
        } else {
            self.pool.supervisor().arm(&self.entry, ticket, self.read_timeout);
            if let Some((pending, ready)) = tables.try_match(id) {
                reactor::service(pending, ready, tables);
            }
        }

        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Send a datagram to its peer address, fragmenting if needed.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] on a closed transport and
    /// [`TransportError::Send`] if any fragment write failed.
    pub async fn send_datagram(&self, datagram: &Datagram) -> TransportResult<SendReport> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        SendBatch::new(datagram, self.fragment_size)?
            .send(&*self.entry)
            .await
    }

    /// Send bytes to the fixed peer of a connected transport.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidConfig`] if the transport is not
    /// connected, otherwise as [`send_datagram`](Self::send_datagram).
    pub async fn send_bytes(&self, data: impl Into<Bytes>) -> TransportResult<SendReport> {
        let peer = self
            .entry
            .peer()
            .ok_or_else(|| TransportError::InvalidConfig("transport is not connected".to_string()))?;
        self.send_datagram(&Datagram::new(data, peer)).await
    }

    /// Close the socket. Idempotent.
    ///
    /// An outstanding receive completes with [`TransportError::Closed`].
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, LifecycleState::Closing | LifecycleState::Closed) {
                return;
            }
            *state = LifecycleState::Closing;
        }

        self.entry.mark_closed();
        self.pool.deregister(&self.entry);
        self.pool.tables().clear(self.entry.id());

        *self.state.lock() = LifecycleState::Closed;
        debug!(socket = %self.entry.id(), "Transport closed");
    }
}

fn transition(from: LifecycleState, to: LifecycleState) -> LifecycleState {
    trace!(?from, ?to, "Transport state change");
    to
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("socket", &self.entry)
            .field("state", &self.state())
            .field("read_timeout", &self.read_timeout)
            .field("fragment_size", &self.fragment_size)
            .finish()
    }
}

/// Single outstanding receive per transport.
///
/// Dropping the guard (including when the receive future is cancelled)
/// removes a still-pending request from the tables.
struct ReceiveGuard<'a> {
    transport: &'a UdpTransport,
    ticket: Option<u64>,
}

impl<'a> ReceiveGuard<'a> {
    fn acquire(transport: &'a UdpTransport) -> TransportResult<Self> {
        if transport.receiving.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyPending(transport.id()));
        }
        Ok(Self {
            transport,
            ticket: None,
        })
    }
}

impl Drop for ReceiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket {
            let _ = self
                .transport
                .pool
                .tables()
                .take_pending(self.transport.id(), ticket);
        }
        self.transport.receiving.store(false, Ordering::Release);
    }
}
