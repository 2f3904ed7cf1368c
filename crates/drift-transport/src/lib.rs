//! # DRIFT Transport
//!
//! Asynchronous UDP transport engine.
//!
//! This crate provides:
//! - A shared pool of readiness reactors multiplexing non-blocking datagram sockets
//! - Pending/ready correlation of receive requests with per-receive deadlines
//! - A fragmenting send pipeline with a single combined completion
//! - Connectionless and connected clients
//! - Listeners that dispatch inbound datagrams to a service under a
//!   sequential or isolated ordering policy
//!
//! The reactor pool is constructed once at startup and handed to every
//! endpoint:
//!
//! ```no_run
//! use drift_transport::{Client, Datagram, EndpointConfig, ReactorConfig, ReactorPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ReactorPool::new(ReactorConfig::default())?;
//! let client = Client::bind(&pool, &EndpointConfig::default()).await?;
//!
//! client
//!     .send_datagram(&Datagram::new(&b"hello"[..], "127.0.0.1:9000".parse()?))
//!     .await?;
//! let reply = client.receive_datagram().await?;
//! println!("{} bytes from {}", reply.len(), reply.peer());
//! # Ok(())
//! # }
//! ```
//!
//! Only Unix targets are supported: sockets are registered with the reactor by
//! raw file descriptor.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod correlation;
pub mod datagram;
pub mod dispatch;
pub mod error;
pub mod fragment;
pub mod listener;
pub mod reactor;
pub mod socket;
pub mod timeout;
pub mod transport;

pub use client::{Client, ConnectClient};
pub use config::{EndpointConfig, ResolvedEndpoint};
pub use datagram::Datagram;
pub use dispatch::{
    Caller, CallbackArg, CallbackName, Dispatcher, InboundKind, Param, Reply, Service,
    ServiceDescriptor,
};
pub use error::{TransportError, TransportResult};
pub use fragment::{Backoff, DEFAULT_FRAGMENT_SIZE, Fragment, SendBatch, SendReport};
pub use listener::Listener;
pub use reactor::{ReactorConfig, ReactorPool, ShutdownMode};
pub use socket::SocketId;
pub use transport::{LifecycleState, TransportStats, UdpTransport};

/// Largest payload a single UDP datagram can carry; the "whole buffer" read size.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;
