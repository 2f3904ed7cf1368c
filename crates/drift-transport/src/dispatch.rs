//! Inbound dispatch engine.
//!
//! A listener hands each received datagram to a [`Dispatcher`], which picks
//! the callback declared in the [`ServiceDescriptor`], builds its arguments
//! and invokes it through the [`Service`] trait:
//!
//! - Isolated callbacks run as soon as they are dispatched, possibly
//!   overlapping each other
//! - All other callbacks go through one single-flight queue per service and
//!   run strictly in arrival order
//!
//! Failures (argument construction, callback errors, reply sends) are routed
//! to the error callback when one is declared and logged otherwise.

use crate::datagram::Datagram;
use crate::error::{TransportError, TransportResult};
use crate::fragment::SendReport;
use crate::transport::UdpTransport;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

/// Callbacks a service can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackName {
    /// Raw payload bytes
    OnBytes,
    /// Payload plus sender address
    OnDatagram,
    /// Failure message from another callback
    OnError,
}

impl CallbackName {
    /// Conventional callback name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackName::OnBytes => "onBytes",
            CallbackName::OnDatagram => "onDatagram",
            CallbackName::OnError => "onError",
        }
    }
}

impl fmt::Display for CallbackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which inbound callback a service declares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// `onBytes`
    Bytes,
    /// `onDatagram`
    Datagram,
}

impl InboundKind {
    /// The callback invoked for this kind.
    #[must_use]
    pub fn callback(self) -> CallbackName {
        match self {
            InboundKind::Bytes => CallbackName::OnBytes,
            InboundKind::Datagram => CallbackName::OnDatagram,
        }
    }
}

/// A parameter requested by an inbound callback, in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Payload bytes (only valid for `onBytes`)
    Bytes,
    /// The whole datagram (only valid for `onDatagram`)
    Datagram,
    /// Handle for replying to the sender
    Caller,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InboundCallback {
    kind: InboundKind,
    params: Vec<Param>,
}

/// Precomputed description of a service's callbacks.
///
/// `onBytes` and `onDatagram` are mutually exclusive; declaring one replaces
/// the other.
///
/// # Examples
/// ```
/// use drift_transport::{CallbackName, InboundKind, Param, ServiceDescriptor};
///
/// let descriptor = ServiceDescriptor::new()
///     .on_datagram([Param::Datagram, Param::Caller])
///     .on_error()
///     .isolated(CallbackName::OnDatagram);
///
/// assert_eq!(descriptor.inbound(), Some(InboundKind::Datagram));
/// assert!(descriptor.is_isolated(CallbackName::OnDatagram));
/// assert!(!descriptor.is_isolated(CallbackName::OnError));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    inbound: Option<InboundCallback>,
    has_error_callback: bool,
    isolated: HashSet<CallbackName>,
}

impl ServiceDescriptor {
    /// A service declaring no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `onBytes` taking `params`.
    #[must_use]
    pub fn on_bytes(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.inbound = Some(InboundCallback {
            kind: InboundKind::Bytes,
            params: params.into_iter().collect(),
        });
        self
    }

    /// Declare `onDatagram` taking `params`.
    #[must_use]
    pub fn on_datagram(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.inbound = Some(InboundCallback {
            kind: InboundKind::Datagram,
            params: params.into_iter().collect(),
        });
        self
    }

    /// Declare `onError`.
    #[must_use]
    pub fn on_error(mut self) -> Self {
        self.has_error_callback = true;
        self
    }

    /// Mark `callback` safe to run concurrently with itself.
    #[must_use]
    pub fn isolated(mut self, callback: CallbackName) -> Self {
        self.isolated.insert(callback);
        self
    }

    /// Declared inbound callback, if any.
    #[must_use]
    pub fn inbound(&self) -> Option<InboundKind> {
        self.inbound.as_ref().map(|callback| callback.kind)
    }

    /// Parameters of the inbound callback.
    #[must_use]
    pub fn params(&self) -> &[Param] {
        self.inbound
            .as_ref()
            .map(|callback| callback.params.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `onError` is declared.
    #[must_use]
    pub fn has_error_callback(&self) -> bool {
        self.has_error_callback
    }

    /// Whether `callback` is isolated.
    #[must_use]
    pub fn is_isolated(&self, callback: CallbackName) -> bool {
        self.isolated.contains(&callback)
    }
}

/// Reply handle passed to inbound callbacks.
#[derive(Debug, Clone)]
pub struct Caller {
    remote: SocketAddr,
    transport: Arc<UdpTransport>,
}

impl Caller {
    pub(crate) fn new(remote: SocketAddr, transport: Arc<UdpTransport>) -> Self {
        Self { remote, transport }
    }

    /// Sender of the datagram being handled.
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Reply to the sender on the listener socket.
    ///
    /// # Errors
    /// See [`UdpTransport::send_datagram`].
    pub async fn send_bytes(&self, data: impl Into<Bytes>) -> TransportResult<SendReport> {
        self.transport
            .send_datagram(&Datagram::new(data, self.remote))
            .await
    }

    /// Send a datagram to its own address on the listener socket.
    ///
    /// # Errors
    /// See [`UdpTransport::send_datagram`].
    pub async fn send_datagram(&self, datagram: &Datagram) -> TransportResult<SendReport> {
        self.transport.send_datagram(datagram).await
    }

    async fn reply(&self, reply: Reply) -> TransportResult<()> {
        match reply {
            Reply::Bytes(data) => self.send_bytes(data).await?,
            Reply::Datagram(datagram) => self.send_datagram(&datagram).await?,
        };
        Ok(())
    }
}

/// One argument handed to a callback.
#[derive(Debug, Clone)]
pub enum CallbackArg {
    /// Payload bytes
    Bytes(Bytes),
    /// Payload plus sender
    Datagram(Datagram),
    /// Reply handle
    Caller(Caller),
    /// Failure message (`onError` only)
    Error(String),
}

impl CallbackArg {
    /// The bytes, if this is a bytes argument.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            CallbackArg::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// The datagram, if this is a datagram argument.
    pub fn as_datagram(&self) -> Option<&Datagram> {
        match self {
            CallbackArg::Datagram(datagram) => Some(datagram),
            _ => None,
        }
    }

    /// The caller, if this is a caller argument.
    pub fn as_caller(&self) -> Option<&Caller> {
        match self {
            CallbackArg::Caller(caller) => Some(caller),
            _ => None,
        }
    }

    /// The message, if this is an error argument.
    pub fn as_error(&self) -> Option<&str> {
        match self {
            CallbackArg::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Value returned by an inbound callback to be sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bytes sent to the original sender
    Bytes(Bytes),
    /// Datagram sent to its own address
    Datagram(Datagram),
}

impl Reply {
    /// Whether there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Reply::Bytes(data) => data.is_empty(),
            Reply::Datagram(datagram) => datagram.is_empty(),
        }
    }
}

/// Application service invoked by a listener.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Invoke `callback` with `args` built from the descriptor's parameter list.
    ///
    /// A returned [`Reply`] is sent back through the caller handle.
    async fn invoke(
        &self,
        callback: CallbackName,
        args: Vec<CallbackArg>,
    ) -> anyhow::Result<Option<Reply>>;
}

struct Invocation {
    callback: CallbackName,
    args: Vec<CallbackArg>,
    reply_to: Option<Caller>,
}

struct Shared {
    service: Arc<dyn Service>,
    descriptor: ServiceDescriptor,
    queue: mpsc::UnboundedSender<Invocation>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Dispatches inbound datagrams to one service.
///
/// Cloning is cheap; clones share the same sequential queue.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Start dispatching to `service`. Must be called within a Tokio runtime.
    pub fn new(service: Arc<dyn Service>, descriptor: ServiceDescriptor) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            service,
            descriptor,
            queue,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        tokio::spawn(run_sequential(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    /// The service's descriptor.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.shared.descriptor
    }

    /// Invocations submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Hand a received datagram to the declared inbound callback.
    ///
    /// Returns immediately; the callback runs according to its policy.
    pub fn dispatch(&self, datagram: Datagram, transport: &Arc<UdpTransport>) {
        let Some(inbound) = &self.shared.descriptor.inbound else {
            trace!(peer = %datagram.peer(), "No inbound callback declared, discarding");
            return;
        };

        let caller = Caller::new(datagram.peer(), transport.clone());
        match build_args(inbound, &datagram, &caller) {
            Ok(args) => self.shared.submit(Invocation {
                callback: inbound.kind.callback(),
                args,
                reply_to: Some(caller),
            }),
            Err(e) => self.shared.route_error(e.to_string()),
        }
    }

    /// Route a failure message to the error callback.
    pub fn dispatch_error(&self, message: impl Into<String>) {
        self.shared.route_error(message.into());
    }

    /// Wait until every submitted invocation has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("descriptor", &self.shared.descriptor)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn build_args(
    inbound: &InboundCallback,
    datagram: &Datagram,
    caller: &Caller,
) -> TransportResult<Vec<CallbackArg>> {
    inbound
        .params
        .iter()
        .map(|param| match (param, inbound.kind) {
            (Param::Bytes, InboundKind::Bytes) => Ok(CallbackArg::Bytes(datagram.data().clone())),
            (Param::Datagram, InboundKind::Datagram) => Ok(CallbackArg::Datagram(datagram.clone())),
            (Param::Caller, _) => Ok(CallbackArg::Caller(caller.clone())),
            (param, kind) => Err(TransportError::Dispatch(format!(
                "{} cannot take a {:?} parameter",
                kind.callback(),
                param
            ))),
        })
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sequential worker. Holds the dispatcher weakly so dropping every
/// [`Dispatcher`] closes the queue and ends the task.
async fn run_sequential(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<Invocation>) {
    while let Some(invocation) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.execute(invocation).await;
    }
    trace!("Sequential dispatch queue closed");
}

impl Shared {
    fn submit(self: &Arc<Self>, invocation: Invocation) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.descriptor.is_isolated(invocation.callback) {
            tokio::spawn(self.clone().execute(invocation));
        } else if self.queue.send(invocation).is_err() {
            debug!("Dispatch queue closed, dropping invocation");
            self.finish();
        }
    }

    fn execute(self: Arc<Self>, invocation: Invocation) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let Invocation {
                callback,
                args,
                reply_to,
            } = invocation;

            // A panic inside the callback is reported like any other failure.
            let service = self.service.clone();
            let outcome = tokio::spawn(async move { service.invoke(callback, args).await }).await;
            let result = match outcome {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                    "{callback} panicked: {}",
                    panic_message(e.into_panic())
                )),
                Err(e) => Err(anyhow::anyhow!("{callback} was cancelled: {e}")),
            };

            match result {
                Ok(Some(reply)) if !reply.is_empty() => {
                    if let Some(caller) = reply_to {
                        if let Err(e) = caller.reply(reply).await {
                            self.route_error(e.to_string());
                        }
                    }
                }
                Ok(_) => {}
                Err(e) if callback == CallbackName::OnError => {
                    let message = format!("{e:#}");
                    warn!(error = %message, "Error callback failed");
                }
                Err(e) => self.route_error(format!("{e:#}")),
            }

            self.finish();
        })
    }

    fn route_error(self: &Arc<Self>, message: String) {
        if !self.descriptor.has_error_callback {
            warn!(error = %message, "Unhandled dispatch failure, no error callback declared");
            return;
        }
        self.submit(Invocation {
            callback: CallbackName::OnError,
            args: vec![CallbackArg::Error(message)],
            reply_to: None,
        });
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
