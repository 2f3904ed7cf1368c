//! Client endpoints.
//!
//! [`Client`] is connectionless: every send names its destination and every
//! receive reports its sender. [`ConnectClient`] is bound to one fixed peer
//! and exchanges raw bytes only.

use crate::config::EndpointConfig;
use crate::datagram::Datagram;
use crate::error::{TransportError, TransportResult};
use crate::fragment::SendReport;
use crate::reactor::ReactorPool;
use crate::transport::{TransportStats, UdpTransport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Connectionless UDP client
#[derive(Debug)]
pub struct Client {
    transport: UdpTransport,
}

impl Client {
    /// Bind a client on `config.local_host` (port `config.local_port`, 0 = ephemeral).
    ///
    /// Any remote host in `config` is ignored.
    ///
    /// # Errors
    /// Returns configuration, bind or registration errors.
    pub async fn bind(pool: &Arc<ReactorPool>, config: &EndpointConfig) -> TransportResult<Self> {
        let mut endpoint = config.validate()?;
        endpoint.remote = None;
        let transport = UdpTransport::open(pool, &endpoint).await?;
        Ok(Self { transport })
    }

    /// Send a datagram to its peer address.
    ///
    /// # Errors
    /// See [`UdpTransport::send_datagram`].
    pub async fn send_datagram(&self, datagram: &Datagram) -> TransportResult<SendReport> {
        self.transport.send_datagram(datagram).await
    }

    /// Receive the next datagram from any sender.
    ///
    /// # Errors
    /// See [`UdpTransport::receive`].
    pub async fn receive_datagram(&self) -> TransportResult<Datagram> {
        self.transport.receive().await
    }

    /// Receive the next datagram, keeping at most `len` bytes.
    ///
    /// # Errors
    /// See [`UdpTransport::receive_up_to`].
    pub async fn receive_datagram_up_to(&self, len: usize) -> TransportResult<Datagram> {
        self.transport.receive_up_to(len).await
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Socket counters.
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &UdpTransport {
        &self.transport
    }

    /// Close the socket, failing any outstanding receive.
    pub fn close(&self) {
        self.transport.close();
    }
}

/// UDP client bound to one fixed peer
#[derive(Debug)]
pub struct ConnectClient {
    transport: UdpTransport,
}

impl ConnectClient {
    /// Bind and connect to `config.remote_host:config.remote_port`.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidConfig`] if no remote peer is
    /// configured, otherwise configuration, bind, connect or registration
    /// errors.
    pub async fn connect(pool: &Arc<ReactorPool>, config: &EndpointConfig) -> TransportResult<Self> {
        let endpoint = config.validate()?;
        if endpoint.remote.is_none() {
            return Err(TransportError::InvalidConfig(
                "connected client needs remote host and port".to_string(),
            ));
        }
        let transport = UdpTransport::open(pool, &endpoint).await?;
        Ok(Self { transport })
    }

    /// Send bytes to the peer.
    ///
    /// # Errors
    /// See [`UdpTransport::send_bytes`].
    pub async fn write_bytes(&self, data: impl Into<Bytes>) -> TransportResult<SendReport> {
        self.transport.send_bytes(data).await
    }

    /// Read the next datagram payload from the peer.
    ///
    /// # Errors
    /// See [`UdpTransport::receive`].
    pub async fn read_bytes(&self) -> TransportResult<Bytes> {
        Ok(self.transport.receive().await?.into_parts().0)
    }

    /// Read at most `len` bytes of the next datagram.
    ///
    /// # Errors
    /// See [`UdpTransport::receive_up_to`].
    pub async fn read_bytes_up_to(&self, len: usize) -> TransportResult<Bytes> {
        Ok(self.transport.receive_up_to(len).await?.into_parts().0)
    }

    /// The fixed peer.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.transport.peer()
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Socket counters.
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Close the socket, failing any outstanding read.
    pub fn close(&self) {
        self.transport.close();
    }
}
