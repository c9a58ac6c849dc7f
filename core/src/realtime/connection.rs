/// Connection lifecycle: one live real-time link per authenticated session
use super::dispatcher::EventDispatcher;
use super::protocol::OutboundEvent;
use super::{Connector, Credential, Link, TransportKind};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::utils::EventEmitter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected and not trying
    #[default]
    Disconnected,
    /// First connection attempt(s) in progress
    Connecting,
    /// Link established
    Connected,
    /// Link dropped, re-establishing
    Reconnecting,
    /// Retries exhausted; `connect` may be called again
    Failed,
}

impl ConnectionState {
    /// Whether a supervisor is currently responsible for the link
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

/// Lifecycle signals observable by the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { attempt: u32, transport: TransportKind },
    Reconnecting { attempt: u32, transport: TransportKind },
    Connected { transport: TransportKind },
    Disconnected { reason: String },
    Error { message: String },
}

/// Retry and fallback settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub preferred: TransportKind,
    pub max_attempts: u32,
    /// Failures on the preferred transport before switching; 0 disables fallback
    pub fallback_after: u32,
    pub retry_interval: Duration,
    pub retry_jitter: Duration,
    pub connect_timeout: Duration,
    /// Minimum uptime for a link to reset the attempt budget
    pub stable_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preferred: config.preferred_transport,
            max_attempts: config.max_connection_attempts.max(1),
            fallback_after: config.fallback_after,
            retry_interval: config.retry_interval,
            retry_jitter: config.retry_jitter,
            connect_timeout: config.connection_timeout,
            stable_after: config.stable_link_after,
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.retry_jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.retry_interval + Duration::from_millis(extra)
    }
}

struct Inner {
    credential: Option<Credential>,
    state: ConnectionState,
    transport: Option<TransportKind>,
    outbound: Option<mpsc::Sender<OutboundEvent>>,
    supervisor: Option<JoinHandle<()>>,
    generation: u64,
}

/// Owns the single real-time connection of a session
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    dispatcher: EventDispatcher,
    policy: RetryPolicy,
    inner: Arc<RwLock<Inner>>,
    events: EventEmitter<ConnectionEvent>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, dispatcher: EventDispatcher, policy: RetryPolicy) -> Self {
        Self {
            connector: Arc::new(connector),
            dispatcher,
            policy,
            inner: Arc::new(RwLock::new(Inner {
                credential: None,
                state: ConnectionState::Disconnected,
                transport: None,
                outbound: None,
                supervisor: None,
                generation: 0,
            })),
            events: EventEmitter::new("connection"),
        }
    }

    /// Establish the session's connection.
    ///
    /// No-op while already connected (or connecting) with the same credential.
    /// A different credential tears the old connection down first. Resolves
    /// once the first link is up, or with an error once retries are exhausted.
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        let ready = {
            let mut inner = self.inner.write().await;
            if inner.credential.as_ref() == Some(&credential) && inner.state.is_live() {
                debug!(
                    "Already {:?} as {}, ignoring connect",
                    inner.state, credential.user_id
                );
                return Ok(());
            }
            if inner.supervisor.is_some() {
                info!(
                    "Replacing existing connection with one for {}",
                    credential.user_id
                );
                self.teardown(&mut inner, "replaced by new session");
            }

            inner.generation += 1;
            inner.credential = Some(credential.clone());
            inner.state = ConnectionState::Connecting;

            let (ready_tx, ready_rx) = oneshot::channel();
            let manager = self.clone();
            let generation = inner.generation;
            inner.supervisor = Some(tokio::spawn(async move {
                manager.supervise(credential, generation, ready_tx).await
            }));
            ready_rx
        };

        ready
            .await
            .unwrap_or_else(|_| Err(ChatError::Connection("Connection attempt cancelled".to_string())))
    }

    /// Tear the connection down; no reconnection happens afterwards
    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        if inner.supervisor.is_none() && inner.credential.is_none() {
            return;
        }
        self.teardown(&mut inner, "client disconnect");
        inner.credential = None;
        info!("Disconnected");
    }

    /// Emit an event on the live link
    pub async fn send(&self, event: OutboundEvent) -> Result<()> {
        let sender = self
            .inner
            .read()
            .await
            .outbound
            .clone()
            .ok_or(ChatError::NotConnected)?;
        debug!("Sending {}", event);
        sender.send(event).await.map_err(|_| ChatError::NotConnected)
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn transport(&self) -> Option<TransportKind> {
        self.inner.read().await.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    fn teardown(&self, inner: &mut Inner, reason: &str) {
        if let Some(task) = inner.supervisor.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.outbound = None;
        inner.transport = None;
        inner.state = ConnectionState::Disconnected;
        self.events.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Apply `f` unless a newer connect/disconnect superseded this supervisor
    async fn update(&self, generation: u64, f: impl FnOnce(&mut Inner)) -> bool {
        let mut inner = self.inner.write().await;
        if inner.generation != generation {
            return false;
        }
        f(&mut *inner);
        true
    }

    /// Keep a link alive until torn down or out of retries.
    ///
    /// Links that drop before `stable_after` use up attempts, so a server
    /// that accepts and immediately closes ends in `Failed` like one that
    /// refuses outright.
    async fn supervise(
        self,
        credential: Credential,
        generation: u64,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut ready = Some(ready);
        let mut reconnecting = false;
        let mut spent = 0;

        loop {
            let mut link = match self.establish(&credential, reconnecting, spent).await {
                Ok((link, attempt)) => {
                    spent = attempt;
                    link
                }
                Err(e) => {
                    self.give_up(generation, e, ready.take()).await;
                    return;
                }
            };

            let transport = link.transport();
            let sender = link.sender();
            let current = self
                .update(generation, |inner| {
                    inner.state = ConnectionState::Connected;
                    inner.transport = Some(transport);
                    inner.outbound = Some(sender);
                })
                .await;
            if !current {
                return;
            }
            info!("Connected as {} via {} transport", credential.user_id, transport);
            self.events.emit(ConnectionEvent::Connected { transport });
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }

            let since = Instant::now();
            self.pump(&mut link).await;
            drop(link);
            if since.elapsed() >= self.policy.stable_after {
                spent = 0;
            }

            warn!("Real-time link dropped, reconnecting");
            let current = self
                .update(generation, |inner| {
                    inner.state = ConnectionState::Reconnecting;
                    inner.outbound = None;
                    inner.transport = None;
                })
                .await;
            if !current {
                return;
            }
            self.events.emit(ConnectionEvent::Disconnected {
                reason: "link closed".to_string(),
            });

            if spent >= self.policy.max_attempts {
                let e = ChatError::Connection(format!(
                    "Link kept dropping after {} attempts",
                    spent
                ));
                self.give_up(generation, e, None).await;
                return;
            }
            reconnecting = true;
            sleep(self.policy.next_delay()).await;
        }
    }

    async fn give_up(&self, generation: u64, e: ChatError, ready: Option<oneshot::Sender<Result<()>>>) {
        error!("Giving up on real-time connection: {}", e);
        let current = self
            .update(generation, |inner| {
                inner.state = ConnectionState::Failed;
                inner.outbound = None;
                inner.transport = None;
            })
            .await;
        if current {
            self.events.emit(ConnectionEvent::Error {
                message: e.to_string(),
            });
        }
        if let Some(tx) = ready {
            let _ = tx.send(Err(e));
        }
    }

    /// Forward inbound events to the dispatcher until the link closes
    async fn pump(&self, link: &mut Link) {
        while let Some(event) = link.recv().await {
            let delivered = self.dispatcher.dispatch(&event);
            debug!("{} event delivered to {} handlers", event.kind(), delivered);
        }
    }

    /// Bounded attempts, falling back from the preferred transport.
    /// `spent` attempts of the budget were already used by short-lived links;
    /// returns the link and the attempt number that produced it.
    async fn establish(
        &self,
        credential: &Credential,
        reconnecting: bool,
        spent: u32,
    ) -> Result<(Link, u32)> {
        let policy = &self.policy;
        let mut transport = policy.preferred;
        let mut preferred_failures = 0;

        for attempt in spent + 1..=policy.max_attempts {
            self.events.emit(if reconnecting {
                ConnectionEvent::Reconnecting { attempt, transport }
            } else {
                ConnectionEvent::Connecting { attempt, transport }
            });

            match timeout(
                policy.connect_timeout,
                self.connector.connect(transport, credential),
            )
            .await
            {
                Ok(Ok(link)) => return Ok((link, attempt)),
                Ok(Err(e)) => warn!(
                    "Connection attempt {}/{} via {} failed: {}",
                    attempt, policy.max_attempts, transport, e
                ),
                Err(_) => warn!(
                    "Connection attempt {}/{} via {} timed out",
                    attempt, policy.max_attempts, transport
                ),
            }

            if transport == policy.preferred {
                preferred_failures += 1;
                let fallback = transport.fallback();
                if policy.fallback_after > 0
                    && preferred_failures >= policy.fallback_after
                    && fallback != transport
                {
                    info!("Falling back from {} to {} transport", transport, fallback);
                    transport = fallback;
                }
            }

            if attempt < policy.max_attempts {
                sleep(policy.next_delay()).await;
            }
        }

        Err(ChatError::Connection(format!(
            "No connection after {} attempts",
            policy.max_attempts
        )))
    }
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            dispatcher: self.dispatcher.clone(),
            policy: self.policy.clone(),
            inner: self.inner.clone(),
            events: self.events.clone(),
        }
    }
}
