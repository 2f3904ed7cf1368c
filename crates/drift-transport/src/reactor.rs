//! Readiness reactor pool.
//!
//! A small, fixed set of reactor threads shared by every socket in the
//! process:
//! - Each thread owns one `mio::Poll` and the sockets assigned to it
//! - Registration is queued and applied only by the owning thread
//! - A readable event clears the socket's interest, marks it ready and tries
//!   to match it against an outstanding receive
//! - Graceful or immediate shutdown
//!
//! The pool is built explicitly at startup and passed to every endpoint as an
//! `Arc<ReactorPool>`.

use crate::MAX_DATAGRAM_SIZE;
use crate::correlation::{CorrelationTables, PendingReceive, ReadyNotification};
use crate::datagram::Datagram;
use crate::error::{TransportError, TransportResult};
use crate::socket::{SocketEntry, SocketId};
use crate::timeout::TimeoutSupervisor;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, unbounded};
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

const WAKER_TOKEN: Token = Token(0);

/// Reactor pool configuration
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of reactor threads (0 = auto-detect from CPU count)
    pub threads: usize,
    /// Readiness events collected per wait
    pub event_capacity: usize,
    /// Upper bound on a graceful shutdown before threads are abandoned
    pub graceful_timeout: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            event_capacity: 1024,
            graceful_timeout: Duration::from_secs(60),
        }
    }
}

/// How to stop the reactor pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wake every reactor, let queued registrations drain, wait (bounded) for exit
    Graceful,
    /// Wake every reactor and return without waiting
    Immediate,
}

enum Command {
    Register {
        entry: Arc<SocketEntry>,
        done: oneshot::Sender<TransportResult<()>>,
    },
    Deregister {
        id: SocketId,
    },
}

/// Submission side of one reactor thread.
struct Lane {
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

struct ReactorThread {
    id: usize,
    handle: JoinHandle<()>,
    exited: Receiver<()>,
}

/// Process-wide pool of readiness reactors
pub struct ReactorPool {
    lanes: Vec<Lane>,
    threads: Mutex<Vec<ReactorThread>>,
    next: AtomicUsize,
    running: Arc<AtomicBool>,
    tables: Arc<CorrelationTables>,
    supervisor: TimeoutSupervisor,
    graceful_timeout: Duration,
}

impl ReactorPool {
    /// Start a reactor pool.
    ///
    /// # Errors
    /// Returns an error if a poll instance, waker or thread cannot be created.
    ///
    /// # Examples
    /// ```no_run
    /// use drift_transport::{ReactorConfig, ReactorPool};
    ///
    /// let pool = ReactorPool::new(ReactorConfig { threads: 2, ..Default::default() }).unwrap();
    /// assert_eq!(pool.num_reactors(), 2);
    /// ```
    pub fn new(config: ReactorConfig) -> TransportResult<Arc<Self>> {
        let num_reactors = if config.threads == 0 {
            num_cpus::get()
        } else {
            config.threads
        };

        info!(
            reactors = num_reactors,
            event_capacity = config.event_capacity,
            "Starting reactor pool"
        );

        let tables = Arc::new(CorrelationTables::new());
        let running = Arc::new(AtomicBool::new(true));
        let mut lanes = Vec::with_capacity(num_reactors);
        let mut threads = Vec::with_capacity(num_reactors);

        for id in 0..num_reactors {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (commands_tx, commands_rx) = unbounded();
            let (exited_tx, exited_rx) = bounded(1);

            let reactor = Reactor {
                id,
                poll,
                events: Events::with_capacity(config.event_capacity.max(1)),
                commands: commands_rx,
                sockets: HashMap::new(),
                tables: tables.clone(),
                running: running.clone(),
            };

            let handle = thread::Builder::new()
                .name(format!("drift-reactor-{}", id))
                .spawn(move || {
                    reactor.run();
                    let _ = exited_tx.send(());
                })?;

            lanes.push(Lane {
                commands: commands_tx,
                waker,
            });
            threads.push(ReactorThread {
                id,
                handle,
                exited: exited_rx,
            });
        }

        Ok(Arc::new(Self {
            lanes,
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
            running,
            supervisor: TimeoutSupervisor::new(tables.clone()),
            tables,
            graceful_timeout: config.graceful_timeout,
        }))
    }

    /// Number of reactor threads.
    pub fn num_reactors(&self) -> usize {
        self.lanes.len()
    }

    /// Whether the pool still accepts registrations.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Correlation tables shared by all sockets of this pool.
    pub fn tables(&self) -> &Arc<CorrelationTables> {
        &self.tables
    }

    /// Timeout supervisor for receives on this pool.
    pub fn supervisor(&self) -> &TimeoutSupervisor {
        &self.supervisor
    }

    /// Hand a socket to a reactor with read interest.
    ///
    /// Resolves once the owning reactor thread applied the registration.
    ///
    /// # Errors
    /// Returns [`TransportError::ShuttingDown`] if the pool is stopping and
    /// [`TransportError::Registration`] if the reactor could not register the
    /// socket (for example because it was closed first).
    pub async fn register(&self, entry: Arc<SocketEntry>) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::ShuttingDown);
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        entry.assign_reactor(index);
        let lane = &self.lanes[index];

        let (done, registered) = oneshot::channel();
        lane.commands
            .send(Command::Register { entry, done })
            .map_err(|_| TransportError::ShuttingDown)?;
        lane.waker.wake()?;

        registered.await.map_err(|_| TransportError::ShuttingDown)?
    }

    /// Remove a socket from its reactor.
    pub fn deregister(&self, entry: &SocketEntry) {
        let Some(index) = entry.reactor() else {
            return;
        };
        let lane = &self.lanes[index];
        if lane
            .commands
            .send(Command::Deregister { id: entry.id() })
            .is_err()
        {
            trace!(socket = %entry.id(), "Reactor already stopped");
            return;
        }
        if let Err(e) = lane.waker.wake() {
            debug!(socket = %entry.id(), error = %e, "Failed to wake reactor");
        }
    }

    /// Stop every reactor thread.
    ///
    /// Sockets still registered have their pending receives completed with
    /// [`TransportError::Closed`]; queued registrations fail with
    /// [`TransportError::ShuttingDown`].
    pub fn shutdown(&self, mode: ShutdownMode) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(reactors = self.lanes.len(), ?mode, "Shutting down reactor pool");

        for lane in &self.lanes {
            if let Err(e) = lane.waker.wake() {
                warn!(error = %e, "Failed to wake reactor for shutdown");
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        if mode == ShutdownMode::Immediate {
            return;
        }

        let deadline = Instant::now() + self.graceful_timeout;
        for thread in threads {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match thread.exited.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if thread.handle.join().is_err() {
                        error!(reactor = thread.id, "Reactor thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(reactor = thread.id, "Reactor did not stop in time, detaching");
                }
            }
        }

        info!("Reactor pool shutdown complete");
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Immediate);
    }
}

impl std::fmt::Debug for ReactorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorPool")
            .field("reactors", &self.lanes.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// One reactor thread's state.
struct Reactor {
    id: usize,
    poll: Poll,
    events: Events,
    commands: Receiver<Command>,
    sockets: HashMap<SocketId, Arc<SocketEntry>>,
    tables: Arc<CorrelationTables>,
    running: Arc<AtomicBool>,
}

impl Reactor {
    fn run(mut self) {
        debug!(reactor = self.id, "Reactor starting");

        while self.running.load(Ordering::Acquire) {
            self.apply_commands();

            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(reactor = self.id, error = %e, "Readiness wait failed");
                }
                continue;
            }

            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.on_read_ready(SocketId::from_token(event.token()));
            }
        }

        self.drain();
        info!(
            reactor = self.id,
            sockets = self.sockets.len(),
            "Reactor shutting down"
        );
    }

    fn apply_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Register { entry, done }) => self.register(entry, done),
                Ok(Command::Deregister { id }) => self.deregister(id),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn register(&mut self, entry: Arc<SocketEntry>, done: oneshot::Sender<TransportResult<()>>) {
        let result = if !entry.is_open() {
            Err(TransportError::Registration("udp already closed".to_string()))
        } else {
            entry
                .register(self.poll.registry())
                .map_err(|e| TransportError::Registration(e.to_string()))
        };

        if result.is_ok() {
            debug!(reactor = self.id, socket = %entry.id(), "Socket registered");
            self.sockets.insert(entry.id(), entry);
        }
        let _ = done.send(result);
    }

    fn deregister(&mut self, id: SocketId) {
        if let Some(entry) = self.sockets.remove(&id) {
            entry.deregister(self.poll.registry());
            debug!(reactor = self.id, socket = %id, "Socket deregistered");
        }
    }

    fn on_read_ready(&self, id: SocketId) {
        let Some(entry) = self.sockets.get(&id) else {
            return;
        };
        if !entry.is_open() {
            return;
        }
        // No further events until this readiness is served.
        entry.clear_interest();
        self.tables
            .mark_ready(id, ReadyNotification::new(entry.clone()));
        if let Some((pending, ready)) = self.tables.try_match(id) {
            service(pending, ready, &self.tables);
        }
    }

    fn drain(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Register { done, .. } => {
                    let _ = done.send(Err(TransportError::ShuttingDown));
                }
                Command::Deregister { id } => self.deregister(id),
            }
        }
        for (id, entry) in self.sockets.drain() {
            entry.deregister(self.poll.registry());
            self.tables.clear(id);
        }
    }
}

/// Perform the read for a matched pending/ready pair and complete the receive.
///
/// Runs on whichever thread won the match.
pub(crate) fn service(pending: PendingReceive, ready: ReadyNotification, tables: &CorrelationTables) {
    let entry = ready.entry().clone();
    let mut buf = vec![0u8; pending.max_len().unwrap_or(MAX_DATAGRAM_SIZE)];

    match entry.recv(&mut buf) {
        Ok((len, peer)) => {
            buf.truncate(len);
            entry.restore_interest();
            trace!(socket = %entry.id(), len, %peer, "Datagram received");
            pending.complete(Ok(Datagram::new(buf, peer)));
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            // Spurious readiness: hand the request back and wait for the next event.
            trace!(socket = %entry.id(), "Readiness without data");
            if let Err(rejected) = tables.mark_pending(entry.id(), pending) {
                rejected
                    .request
                    .complete(Err(TransportError::AlreadyPending(rejected.id)));
            }
            entry.restore_interest();
        }
        Err(e) => {
            debug!(socket = %entry.id(), error = %e, "Error while data receive");
            entry.restore_interest();
            let err = if entry.is_open() {
                TransportError::Io(e)
            } else {
                TransportError::Closed
            };
            pending.complete(Err(err));
        }
    }
}
