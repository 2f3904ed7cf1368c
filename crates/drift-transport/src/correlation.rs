//! Pending/ready correlation tables.
//!
//! A receive request and a readiness notification for the same socket can
//! arrive in either order and from different threads: the application side
//! registers a [`PendingReceive`], the reactor marks the socket ready. Both
//! sides call [`CorrelationTables::try_match`] after their insert; a per-socket
//! lock makes exactly one of them take the pair and perform the read.

use crate::datagram::Datagram;
use crate::error::{TransportError, TransportResult};
use crate::socket::{SocketEntry, SocketId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::trace;

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Single-fire completion of a receive.
pub type ReceiveCompletion = oneshot::Sender<TransportResult<Datagram>>;

/// An outstanding receive request.
///
/// Completing consumes the request, so it can be fulfilled at most once.
pub struct PendingReceive {
    ticket: u64,
    max_len: Option<usize>,
    completion: Option<ReceiveCompletion>,
    timer: Option<AbortHandle>,
}

impl PendingReceive {
    /// Create a request reading at most `max_len` bytes (`None` reads the whole datagram).
    pub fn new(max_len: Option<usize>, completion: ReceiveCompletion) -> Self {
        Self {
            ticket: NEXT_TICKET.fetch_add(1, Ordering::Relaxed),
            max_len,
            completion: Some(completion),
            timer: None,
        }
    }

    /// Unique ticket identifying this request.
    #[must_use]
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Requested maximum length.
    #[must_use]
    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    /// Fulfil the request, cancelling its deadline timer.
    pub fn complete(mut self, result: TransportResult<Datagram>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.send(result);
    }

    /// Fulfil the request from its own expired timer.
    pub(crate) fn expire(mut self) {
        self.timer = None;
        self.send(Err(TransportError::Timeout));
    }

    fn send(&mut self, result: TransportResult<Datagram>) {
        if let Some(completion) = self.completion.take() {
            if completion.send(result).is_err() {
                trace!(ticket = self.ticket, "Receiver dropped before completion");
            }
        }
    }
}

impl Drop for PendingReceive {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl fmt::Debug for PendingReceive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReceive")
            .field("ticket", &self.ticket)
            .field("max_len", &self.max_len)
            .field("armed", &self.timer.is_some())
            .finish()
    }
}

/// Marker that a socket is readable and nobody has claimed the data yet.
#[derive(Debug, Clone)]
pub struct ReadyNotification {
    entry: Arc<SocketEntry>,
}

impl ReadyNotification {
    /// Mark `entry` as readable.
    pub fn new(entry: Arc<SocketEntry>) -> Self {
        Self { entry }
    }

    /// The readable socket.
    #[must_use]
    pub fn entry(&self) -> &Arc<SocketEntry> {
        &self.entry
    }
}

/// A second receive was issued while one is outstanding.
#[derive(Debug, thiserror::Error)]
#[error("A receive is already pending on socket {id}")]
pub struct AlreadyPending {
    /// Socket the request targeted
    pub id: SocketId,
    /// The rejected request, still unfulfilled
    pub request: PendingReceive,
}

impl From<AlreadyPending> for TransportError {
    fn from(err: AlreadyPending) -> Self {
        TransportError::AlreadyPending(err.id)
    }
}

/// Pending and ready tables keyed by socket id.
#[derive(Debug, Default)]
pub struct CorrelationTables {
    pending: DashMap<SocketId, PendingReceive>,
    ready: DashMap<SocketId, ReadyNotification>,
    locks: DashMap<SocketId, Arc<Mutex<()>>>,
}

impl CorrelationTables {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: SocketId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Record an outstanding receive for `id`.
    ///
    /// # Errors
    /// Returns [`AlreadyPending`], carrying the rejected request, if one is
    /// already outstanding.
    pub fn mark_pending(&self, id: SocketId, request: PendingReceive) -> Result<(), AlreadyPending> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(AlreadyPending { id, request }),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    /// Record that `id` is readable. Idempotent.
    pub fn mark_ready(&self, id: SocketId, notification: ReadyNotification) {
        self.ready.entry(id).or_insert(notification);
    }

    /// Take both entries for `id` if both exist.
    ///
    /// The caller that receives the pair owns the read and the completion.
    pub fn try_match(&self, id: SocketId) -> Option<(PendingReceive, ReadyNotification)> {
        let lock = self.lock_for(id);
        let _guard = lock.lock();
        if !self.pending.contains_key(&id) || !self.ready.contains_key(&id) {
            return None;
        }
        let (_, pending) = self.pending.remove(&id)?;
        match self.ready.remove(&id) {
            Some((_, ready)) => {
                trace!(socket = %id, ticket = pending.ticket(), "Matched receive with readiness");
                Some((pending, ready))
            }
            None => {
                self.pending.insert(id, pending);
                None
            }
        }
    }

    /// Remove the pending request for `id` if it is still the one with `ticket`.
    pub fn take_pending(&self, id: SocketId, ticket: u64) -> Option<PendingReceive> {
        let lock = self.lock_for(id);
        let _guard = lock.lock();
        self.pending
            .remove_if(&id, |_, pending| pending.ticket == ticket)
            .map(|(_, pending)| pending)
    }

    /// Attach a deadline timer to the pending request with `ticket`.
    ///
    /// If the request is already gone the timer is aborted.
    pub fn attach_timer(&self, id: SocketId, ticket: u64, timer: AbortHandle) {
        match self.pending.get_mut(&id) {
            Some(mut pending) if pending.ticket == ticket => pending.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Drop all state for a closing socket.
    ///
    /// An outstanding receive completes with [`TransportError::Closed`].
    pub fn clear(&self, id: SocketId) {
        let lock = self.lock_for(id);
        let (pending, _ready) = {
            let _guard = lock.lock();
            (self.pending.remove(&id), self.ready.remove(&id))
        };
        self.locks.remove(&id);
        if let Some((_, pending)) = pending {
            trace!(socket = %id, "Cancelling pending receive on close");
            pending.complete(Err(TransportError::Closed));
        }
    }

    /// Whether a receive is outstanding for `id`.
    #[must_use]
    pub fn is_pending(&self, id: SocketId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Whether `id` has an unclaimed readiness marker.
    #[must_use]
    pub fn is_ready(&self, id: SocketId) -> bool {
        self.ready.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::bind;

    fn entry() -> Arc<SocketEntry> {
        let socket = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        Arc::new(SocketEntry::new(socket, None).unwrap())
    }

    fn request() -> (PendingReceive, oneshot::Receiver<TransportResult<Datagram>>) {
        let (tx, rx) = oneshot::channel();
        (PendingReceive::new(None, tx), rx)
    }

    #[test]
    fn test_second_pending_is_rejected() {
        let tables = CorrelationTables::new();
        let id = entry().id();

        let (first, _rx1) = request();
        let (second, _rx2) = request();
        let second_ticket = second.ticket();

        tables.mark_pending(id, first).unwrap();
        let err = tables.mark_pending(id, second).unwrap_err();
        assert_eq!(err.id, id);
        assert_eq!(err.request.ticket(), second_ticket);
        assert!(matches!(
            TransportError::from(err),
            TransportError::AlreadyPending(rejected) if rejected == id
        ));
    }

    #[test]
    fn test_mark_ready_is_idempotent() {
        let tables = CorrelationTables::new();
        let entry = entry();
        let id = entry.id();

        tables.mark_ready(id, ReadyNotification::new(entry.clone()));
        tables.mark_ready(id, ReadyNotification::new(entry.clone()));
        assert!(tables.is_ready(id));

        let (pending, _rx) = request();
        tables.mark_pending(id, pending).unwrap();
        assert!(tables.try_match(id).is_some());
        assert!(!tables.is_ready(id));
        assert!(tables.try_match(id).is_none());
    }

    #[test]
    fn test_match_requires_both_sides() {
        let tables = CorrelationTables::new();
        let entry = entry();
        let id = entry.id();

        let (pending, _rx) = request();
        tables.mark_pending(id, pending).unwrap();
        assert!(tables.try_match(id).is_none());
        assert!(tables.is_pending(id));

        tables.mark_ready(id, ReadyNotification::new(entry.clone()));
        let (matched, ready) = tables.try_match(id).expect("pair");
        assert_eq!(ready.entry().id(), id);
        assert!(matched.max_len().is_none());
        assert!(!tables.is_pending(id));
        assert!(!tables.is_ready(id));
    }

    #[test]
    fn test_match_from_many_threads_happens_once() {
        let tables = Arc::new(CorrelationTables::new());
        let entry = entry();
        let id = entry.id();

        let (pending, _rx) = request();
        tables.mark_pending(id, pending).unwrap();
        tables.mark_ready(id, ReadyNotification::new(entry.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tables = tables.clone();
                std::thread::spawn(move || tables.try_match(id).is_some())
            })
            .collect();
        let matches = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|matched| *matched)
            .count();
        assert_eq!(matches, 1);
    }

    #[test]
    fn test_take_pending_checks_ticket() {
        let tables = CorrelationTables::new();
        let id = entry().id();

        let (pending, _rx) = request();
        let ticket = pending.ticket();
        tables.mark_pending(id, pending).unwrap();

        assert!(tables.take_pending(id, ticket + 1_000).is_none());
        assert!(tables.is_pending(id));
        assert!(tables.take_pending(id, ticket).is_some());
        assert!(!tables.is_pending(id));
    }

    #[test]
    fn test_clear_completes_pending_with_closed() {
        let tables = CorrelationTables::new();
        let entry = entry();
        let id = entry.id();

        let (pending, mut rx) = request();
        tables.mark_pending(id, pending).unwrap();
        tables.mark_ready(id, ReadyNotification::new(entry.clone()));

        tables.clear(id);

        assert!(!tables.is_pending(id));
        assert!(!tables.is_ready(id));
        let result = rx.try_recv().expect("completed");
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn test_expire_completes_with_timeout() {
        let (pending, mut rx) = request();
        pending.expire();
        assert!(matches!(rx.try_recv(), Ok(Err(TransportError::Timeout))));
    }
}
