//! Endpoint configuration.

use crate::error::{TransportError, TransportResult};
use crate::fragment::DEFAULT_FRAGMENT_SIZE;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Endpoint configuration
///
/// Deserializable from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Local host to bind (unspecified address if absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
    /// Local port (0 = ephemeral)
    pub local_port: u16,
    /// Fixed remote host; must be given together with `remote_port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    /// Fixed remote port; must be given together with `remote_host`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Receive deadline in seconds (`None` waits indefinitely)
    pub read_timeout: Option<f64>,
    /// Fragment bound for outbound payloads in bytes
    pub fragment_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            local_host: None,
            local_port: 0,
            remote_host: None,
            remote_port: None,
            read_timeout: Some(default_read_timeout()),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }
}

fn default_read_timeout() -> f64 {
    300.0
}

impl EndpointConfig {
    /// Listener defaults: no receive deadline.
    #[must_use]
    pub fn listener(port: u16) -> Self {
        Self {
            local_port: port,
            read_timeout: None,
            ..Self::default()
        }
    }

    /// Set the fixed remote peer.
    #[must_use]
    pub fn with_remote(mut self, host: impl Into<String>, port: u16) -> Self {
        self.remote_host = Some(host.into());
        self.remote_port = Some(port);
        self
    }

    /// Set the local host.
    #[must_use]
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    /// Check the configuration and resolve host names.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidConfig`] if only one of the remote
    /// host and port is set, the timeout is not a positive finite number that
    /// fits a [`Duration`], the fragment size is zero, or a host does not
    /// resolve.
    pub fn validate(&self) -> TransportResult<ResolvedEndpoint> {
        let remote = match (&self.remote_host, self.remote_port) {
            (Some(host), Some(port)) => Some(resolve(host, port)?),
            (None, None) => None,
            _ => {
                return Err(TransportError::InvalidConfig(
                    "remote host and remote port must be given together".to_string(),
                ));
            }
        };

        let read_timeout = match self.read_timeout {
            None => None,
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Some(Duration::try_from_secs_f64(secs).map_err(|e| {
                    TransportError::InvalidConfig(format!("read timeout {secs} is out of range: {e}"))
                })?)
            }
            Some(secs) => {
                return Err(TransportError::InvalidConfig(format!(
                    "read timeout must be a positive number of seconds, got {secs}"
                )));
            }
        };

        if self.fragment_size == 0 {
            return Err(TransportError::InvalidConfig(
                "fragment size must be at least 1 byte".to_string(),
            ));
        }

        let local = match &self.local_host {
            Some(host) => resolve(host, self.local_port)?,
            None => {
                let ip = match remote {
                    Some(SocketAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                    _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                };
                SocketAddr::new(ip, self.local_port)
            }
        };

        Ok(ResolvedEndpoint {
            local,
            remote,
            read_timeout,
            fragment_size: self.fragment_size,
        })
    }
}

fn resolve(host: &str, port: u16) -> TransportResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::InvalidConfig(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::InvalidConfig(format!("no address for {host}")))
}

/// A validated endpoint with resolved addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// Local bind address
    pub local: SocketAddr,
    /// Fixed remote peer
    pub remote: Option<SocketAddr>,
    /// Per-receive deadline
    pub read_timeout: Option<Duration>,
    /// Fragment bound in bytes
    pub fragment_size: usize,
}
