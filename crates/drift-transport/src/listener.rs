//! Listener endpoint.
//!
//! A listener owns one connectionless transport and an inbound loop that
//! receives datagrams and hands them to the attached service's
//! [`Dispatcher`]. Receive deadlines are reported to the error callback as
//! `"Read timed out"` and listening continues.

use crate::config::EndpointConfig;
use crate::dispatch::{Dispatcher, Service, ServiceDescriptor};
use crate::error::{TransportError, TransportResult};
use crate::reactor::{ReactorPool, ShutdownMode};
use crate::transport::{TransportStats, UdpTransport};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

type Slot = Arc<RwLock<Option<Dispatcher>>>;

/// UDP listener dispatching to a service
pub struct Listener {
    transport: Arc<UdpTransport>,
    dispatcher: Slot,
    retired: Mutex<Vec<Dispatcher>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind a listener on `config.local_host:config.local_port`.
    ///
    /// Remote settings in `config` are ignored.
    ///
    /// # Errors
    /// Returns configuration, bind or registration errors.
    pub async fn bind(pool: &Arc<ReactorPool>, config: &EndpointConfig) -> TransportResult<Self> {
        let mut endpoint = config.validate()?;
        endpoint.remote = None;
        let transport = Arc::new(UdpTransport::open(pool, &endpoint).await?);
        let (stop, _) = watch::channel(false);

        info!(local = %transport.local_addr(), "Listener bound");

        Ok(Self {
            transport,
            dispatcher: Arc::new(RwLock::new(None)),
            retired: Mutex::new(Vec::new()),
            stop,
            task: Mutex::new(None),
        })
    }

    /// Attach `service`, replacing any service already attached.
    ///
    /// Must be called within a Tokio runtime.
    pub fn attach(&self, service: Arc<dyn Service>, descriptor: ServiceDescriptor) {
        let dispatcher = Dispatcher::new(service, descriptor);
        let previous = self.dispatcher.write().replace(dispatcher);
        if let Some(previous) = previous {
            debug!(local = %self.local_addr(), "Replaced attached service");
            self.retire(previous);
        }
    }

    /// Detach the service. Datagrams arriving afterwards are discarded.
    ///
    /// Invocations already dispatched keep running and are still awaited by
    /// a graceful [`close`](Self::close).
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidConfig`] if no service is attached.
    pub fn detach(&self) -> TransportResult<()> {
        let previous = self.dispatcher.write().take();
        match previous {
            Some(previous) => {
                self.retire(previous);
                Ok(())
            }
            None => Err(TransportError::InvalidConfig(
                "service is not attached".to_string(),
            )),
        }
    }

    fn retire(&self, dispatcher: Dispatcher) {
        let mut retired = self.retired.lock();
        retired.retain(|d| d.in_flight() > 0);
        if dispatcher.in_flight() > 0 {
            retired.push(dispatcher);
        }
    }

    /// Start the inbound loop.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] if the listener was closed and
    /// [`TransportError::InvalidConfig`] if it is already started.
    pub fn start(&self) -> TransportResult<()> {
        if !self.transport.is_open() {
            return Err(TransportError::Closed);
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(TransportError::InvalidConfig(
                "listener already started".to_string(),
            ));
        }
        *task = Some(tokio::spawn(run_inbound(
            self.transport.clone(),
            self.dispatcher.clone(),
            self.stop.subscribe(),
        )));
        Ok(())
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Socket counters.
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Stop listening and close the socket.
    ///
    /// [`ShutdownMode::Graceful`] waits for dispatched callbacks to finish
    /// first, so their replies can still be sent.
    pub async fn close(&self, mode: ShutdownMode) {
        self.stop.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        if mode == ShutdownMode::Graceful {
            let mut pending: Vec<Dispatcher> = std::mem::take(&mut *self.retired.lock());
            pending.extend(self.dispatcher.read().clone());
            for dispatcher in pending {
                dispatcher.drain().await;
            }
        }

        self.transport.close();
        info!(local = %self.transport.local_addr(), ?mode, "Listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.transport.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("transport", &self.transport)
            .field("attached", &self.dispatcher.read().is_some())
            .finish()
    }
}

async fn run_inbound(transport: Arc<UdpTransport>, dispatcher: Slot, mut stop: watch::Receiver<bool>) {
    debug!(local = %transport.local_addr(), "Inbound loop started");

    while !*stop.borrow() {
        let result = tokio::select! {
            _ = stop.changed() => break,
            result = transport.receive() => result,
        };

        let current = dispatcher.read().clone();
        match (result, current) {
            (Err(TransportError::Closed), _) => break,
            (Ok(datagram), Some(dispatcher)) => dispatcher.dispatch(datagram, &transport),
            (Ok(datagram), None) => {
                trace!(peer = %datagram.peer(), "No service attached, discarding");
            }
            (Err(e), Some(dispatcher)) => dispatcher.dispatch_error(e.to_string()),
            (Err(e), None) => debug!(error = %e, "Receive failed with no service attached"),
        }
    }

    debug!(local = %transport.local_addr(), "Inbound loop stopped");
}
