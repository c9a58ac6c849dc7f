/// Real-time channel: wire protocol, transports, connection lifecycle and event routing
pub mod connection;
pub mod dispatcher;
pub mod polling;
pub mod protocol;
pub mod stream;

use crate::config::Config;
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, RetryPolicy};
pub use dispatcher::{handler, EventDispatcher, Handler};
pub use polling::PollingConnector;
pub use protocol::{Control, EventKind, Frame, InboundEvent, OutboundEvent, Packet, PROTOCOL_VERSION};
pub use stream::StreamConnector;

/// Channel capacity between a transport task and the connection manager
pub(crate) const LINK_BUFFER: usize = 256;

/// How the real-time channel is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Persistent TCP stream with length-prefixed frames
    Stream,
    /// HTTP long-polling, works wherever plain requests do
    Polling,
}

impl TransportKind {
    /// The transport to try when this one keeps failing
    pub fn fallback(self) -> Self {
        match self {
            TransportKind::Stream => TransportKind::Polling,
            TransportKind::Polling => TransportKind::Polling,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Polling => f.write_str("polling"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "websocket" => Ok(TransportKind::Stream),
            "polling" => Ok(TransportKind::Polling),
            other => Err(ChatError::Config(format!("Unknown transport: {}", other))),
        }
    }
}

/// Bearer credential of the logged-in user
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// One established real-time connection.
///
/// Outbound events go through `sender()`, inbound events come out of `recv()`.
/// `recv()` returning `None` means the connection is gone. Dropping the link
/// stops its transport task.
pub struct Link {
    transport: TransportKind,
    outbound: mpsc::Sender<OutboundEvent>,
    inbound: mpsc::Receiver<InboundEvent>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    pub fn new(
        transport: TransportKind,
        outbound: mpsc::Sender<OutboundEvent>,
        inbound: mpsc::Receiver<InboundEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            transport,
            outbound,
            inbound,
            task,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn sender(&self) -> mpsc::Sender<OutboundEvent> {
        self.outbound.clone()
    }

    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.inbound.recv().await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens real-time links
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        transport: TransportKind,
        credential: &Credential,
    ) -> impl Future<Output = Result<Link>> + Send;
}

/// Production connector: streaming transport with a polling fallback
pub struct NetworkConnector {
    stream: StreamConnector,
    polling: PollingConnector,
}

impl NetworkConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            stream: StreamConnector::new(config.socket_addr, config.connection_timeout),
            polling: PollingConnector::new(config.http_base.clone(), config.poll_timeout),
        }
    }
}

impl Connector for NetworkConnector {
    async fn connect(&self, transport: TransportKind, credential: &Credential) -> Result<Link> {
        match transport {
            TransportKind::Stream => self.stream.open(credential).await,
            TransportKind::Polling => self.polling.open(credential).await,
        }
    }
}
