//! Non-blocking datagram sockets and their identities.
//!
//! Sockets are created with `socket2` for buffer tuning, switched to
//! non-blocking mode and wrapped in a [`SocketEntry`] that carries the
//! stable identifier every other component keys on. Identifiers come from a
//! process-wide monotonic counter and are never reused.

use crate::error::{TransportError, TransportResult};
use crate::fragment::DatagramSink;
use crate::transport::StatsCounters;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Kernel socket buffer size requested for every socket (2MB)
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Id 0 is reserved for the reactor waker token.
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Stable, collision-free socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0 as u64)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Open a non-blocking UDP socket bound to `addr`.
///
/// Port 0 lets the OS pick an ephemeral port.
pub(crate) fn bind(addr: SocketAddr) -> TransportResult<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    // The kernel may clamp these; a smaller buffer is not fatal.
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "Could not raise receive buffer size");
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "Could not raise send buffer size");
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;

    Ok(socket.into())
}

/// Associate a bound socket with one fixed remote peer.
pub(crate) fn connect(socket: &UdpSocket, peer: SocketAddr) -> TransportResult<()> {
    socket
        .connect(peer)
        .map_err(|e| TransportError::ConnectionFailed(format!("{peer}: {e}")))
}

/// A registered (or registrable) datagram socket.
///
/// Owned by its [`UdpTransport`](crate::transport::UdpTransport); the reactor
/// and the correlation tables only hold shared references to it.
pub struct SocketEntry {
    id: SocketId,
    socket: UdpSocket,
    local_addr: SocketAddr,
    peer: Option<SocketAddr>,
    open: AtomicBool,
    /// Read interest is armed in the owning reactor.
    armed: AtomicBool,
    reactor: OnceLock<usize>,
    registry: OnceLock<Registry>,
    stats: StatsCounters,
}

impl SocketEntry {
    pub(crate) fn new(socket: UdpSocket, peer: Option<SocketAddr>) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            id: SocketId::next(),
            socket,
            local_addr,
            peer,
            open: AtomicBool::new(true),
            armed: AtomicBool::new(true),
            reactor: OnceLock::new(),
            registry: OnceLock::new(),
            stats: StatsCounters::default(),
        })
    }

    /// Socket identifier.
    #[must_use]
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Bound local address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fixed remote peer, if the socket is connected.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the socket is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stats(&self) -> &StatsCounters {
        &self.stats
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn assign_reactor(&self, index: usize) {
        let _ = self.reactor.set(index);
    }

    pub(crate) fn reactor(&self) -> Option<usize> {
        self.reactor.get().copied()
    }

    /// Register for read readiness. Must run on the owning reactor thread.
    pub(crate) fn register(&self, registry: &Registry) -> io::Result<()> {
        let fd = self.raw_fd();
        registry.register(&mut SourceFd(&fd), self.id.token(), Interest::READABLE)?;
        self.armed.store(true, Ordering::Release);
        let _ = self.registry.set(registry.try_clone()?);
        Ok(())
    }

    pub(crate) fn deregister(&self, registry: &Registry) {
        let fd = self.raw_fd();
        if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
            trace!(socket = %self.id, error = %e, "Deregister failed");
        }
    }

    /// Readiness observed; further events are not needed until a read is served.
    pub(crate) fn clear_interest(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Re-arm read interest if it was cleared.
    ///
    /// Re-registering also re-reports readiness when datagrams are still
    /// queued on the socket.
    pub(crate) fn restore_interest(&self) {
        if !self.is_open() || self.armed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.get() {
            let fd = self.raw_fd();
            if let Err(e) =
                registry.reregister(&mut SourceFd(&fd), self.id.token(), Interest::READABLE)
            {
                debug!(socket = %self.id, error = %e, "Failed to restore read interest");
            }
        }
    }

    /// Non-blocking read of one datagram.
    ///
    /// Connected sockets report the fixed peer as the sender.
    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let result = match self.peer {
            Some(peer) => self.socket.recv(buf).map(|n| (n, peer)),
            None => self.socket.recv_from(buf),
        };
        match &result {
            Ok((n, _)) => self.stats.record_recv(*n),
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => self.stats.record_recv_error(),
            Err(_) => {}
        }
        result
    }
}

impl DatagramSink for SocketEntry {
    fn try_send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        // Connected sockets may refuse an explicit destination on some platforms.
        let result = match self.peer {
            Some(peer) if peer == dest => self.socket.send(buf),
            _ => self.socket.send_to(buf, dest),
        };
        match &result {
            Ok(n) => self.stats.record_send(*n),
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => self.stats.record_send_error(),
            Err(_) => {}
        }
        result
    }
}

impl fmt::Debug for SocketEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketEntry")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
