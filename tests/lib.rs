//! Shared helpers for DRIFT integration tests.

use async_trait::async_trait;
use bytes::Bytes;
use drift_transport::{
    CallbackArg, CallbackName, EndpointConfig, ReactorConfig, ReactorPool, Reply, Service,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A two-reactor pool for one test.
pub fn test_pool() -> Arc<ReactorPool> {
    init_tracing();
    ReactorPool::new(ReactorConfig {
        threads: 2,
        graceful_timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .expect("reactor pool")
}

/// Endpoint bound on 127.0.0.1 with an ephemeral port.
pub fn loopback() -> EndpointConfig {
    EndpointConfig::default().with_local_host("127.0.0.1")
}

/// Something the recording service observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An inbound callback started for this payload
    Enter(String),
    /// An inbound callback finished for this payload
    Exit(String),
    /// The error callback ran with this message
    Error(String),
}

/// Service that records every invocation and optionally replies.
#[derive(Debug, Default)]
pub struct RecordingService {
    events: Mutex<Vec<Event>>,
    /// Time each inbound invocation spends between enter and exit
    pub hold: Duration,
    /// Reply sent back for every inbound datagram
    pub reply: Option<Bytes>,
}

impl RecordingService {
    /// Service that holds each invocation for `hold`.
    pub fn holding(hold: Duration) -> Self {
        Self {
            hold,
            ..Default::default()
        }
    }

    /// Service replying `reply` to every datagram.
    pub fn replying(reply: &'static [u8]) -> Self {
        Self {
            reply: Some(Bytes::from_static(reply)),
            ..Default::default()
        }
    }

    /// Hold each inbound invocation for `hold`.
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Error messages recorded so far.
    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Service for RecordingService {
    async fn invoke(
        &self,
        callback: CallbackName,
        args: Vec<CallbackArg>,
    ) -> anyhow::Result<Option<Reply>> {
        if callback == CallbackName::OnError {
            let message = args
                .first()
                .and_then(CallbackArg::as_error)
                .unwrap_or_default();
            self.events.lock().push(Event::Error(message.to_string()));
            return Ok(None);
        }

        let payload = args
            .iter()
            .find_map(|arg| match arg {
                CallbackArg::Bytes(data) => Some(data.clone()),
                CallbackArg::Datagram(datagram) => Some(datagram.data().clone()),
                _ => None,
            })
            .ok_or_else(|| anyhow::anyhow!("{callback} received no payload"))?;
        let tag = String::from_utf8_lossy(&payload).into_owned();

        self.events.lock().push(Event::Enter(tag.clone()));
        tokio::time::sleep(self.hold).await;
        self.events.lock().push(Event::Exit(tag));

        Ok(self.reply.clone().map(Reply::Bytes))
    }
}
