//! Deadlines for outstanding receives.

use crate::correlation::CorrelationTables;
use crate::socket::SocketEntry;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Arms a timer per pending receive and expires it if no read claims it first.
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    tables: Arc<CorrelationTables>,
}

impl TimeoutSupervisor {
    /// Supervise receives recorded in `tables`.
    #[must_use]
    pub fn new(tables: Arc<CorrelationTables>) -> Self {
        Self { tables }
    }

    /// Arm a deadline for the pending receive `ticket` on `entry`.
    ///
    /// Must be called after the request is in the pending table and from
    /// within a Tokio runtime. A `None` deadline arms nothing. When the timer
    /// fires and the request is still unclaimed it completes with
    /// [`TransportError::Timeout`](crate::TransportError::Timeout) and read
    /// interest is restored so later data can satisfy a later receive.
    pub fn arm(&self, entry: &Arc<SocketEntry>, ticket: u64, deadline: Option<Duration>) {
        let Some(deadline) = deadline else {
            return;
        };

        let tables = self.tables.clone();
        let entry_ref = entry.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(pending) = tables.take_pending(entry_ref.id(), ticket) {
                debug!(socket = %entry_ref.id(), ?deadline, "Receive timed out");
                pending.expire();
                entry_ref.restore_interest();
            }
        });

        self.tables
            .attach_timer(entry.id(), ticket, timer.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportError;
    use crate::correlation::PendingReceive;
    use crate::socket::bind;
    use tokio::sync::oneshot;

    fn entry() -> Arc<SocketEntry> {
        let socket = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        Arc::new(SocketEntry::new(socket, None).unwrap())
    }

    #[tokio::test]
    async fn test_unclaimed_receive_times_out() {
        let tables = Arc::new(CorrelationTables::new());
        let supervisor = TimeoutSupervisor::new(tables.clone());
        let entry = entry();

        let (tx, rx) = oneshot::channel();
        let pending = PendingReceive::new(None, tx);
        let ticket = pending.ticket();
        tables.mark_pending(entry.id(), pending).unwrap();
        supervisor.arm(&entry, ticket, Some(Duration::from_millis(20)));

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(!tables.is_pending(entry.id()));
    }

    #[tokio::test]
    async fn test_claimed_receive_is_not_expired() {
        let tables = Arc::new(CorrelationTables::new());
        let supervisor = TimeoutSupervisor::new(tables.clone());
        let entry = entry();

        let (tx, mut rx) = oneshot::channel();
        let pending = PendingReceive::new(None, tx);
        let ticket = pending.ticket();
        tables.mark_pending(entry.id(), pending).unwrap();
        supervisor.arm(&entry, ticket, Some(Duration::from_millis(20)));

        let claimed = tables.take_pending(entry.id(), ticket).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());

        let peer = entry.local_addr();
        claimed.complete(Ok(crate::Datagram::new(&b"late"[..], peer)));
        assert_eq!(rx.await.unwrap().unwrap().data().as_ref(), b"late");
    }

    #[tokio::test]
    async fn test_no_deadline_arms_nothing() {
        let tables = Arc::new(CorrelationTables::new());
        let supervisor = TimeoutSupervisor::new(tables.clone());
        let entry = entry();

        let (tx, _rx) = oneshot::channel();
        let pending = PendingReceive::new(None, tx);
        let ticket = pending.ticket();
        tables.mark_pending(entry.id(), pending).unwrap();
        supervisor.arm(&entry, ticket, None);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tables.is_pending(entry.id()));
    }
}
