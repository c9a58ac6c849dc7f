/// Conversation session: the single surface a chat screen talks to
///
/// Ties one open conversation to the session's connection. It owns the
/// message feed, the outbound typing burst and the peer typing flag, and
/// publishes everything a screen renders as a [`SessionSnapshot`].
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::feed::{MessageFeed, PageState};
use crate::history::HistoryApi;
use crate::messenger_types::{Conversation, Message, MessageStatus, Presence};
use crate::realtime::{
    handler, ConnectionEvent, ConnectionState, Connector, EventKind, InboundEvent, OutboundEvent,
    TransportKind,
};
use crate::session::SessionContext;
use crate::typing::{PeerTypingIndicator, TypingDebouncer, TypingSignal, TypingSink};
use crate::utils::lock;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a chat screen renders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub conversation: Option<Conversation>,
    /// Newest first
    pub messages: Vec<Message>,
    pub peer_typing: bool,
    pub presence: Presence,
    pub page_state: PageState,
    pub has_more: bool,
    pub connection: ConnectionState,
    pub transport: Option<TransportKind>,
    pub last_error: Option<String>,
}

/// Result of `load_more` / `refresh`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { added: usize, has_more: bool },
    /// A load was already running or there is nothing left to load
    Skipped,
    /// The conversation changed while the page was in flight
    Discarded,
}

/// Check a message body before it is sent; returns the trimmed body
pub fn validate_body(body: &str, max_len: usize) -> Result<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("Message cannot be empty".to_string()));
    }
    if body.chars().count() > max_len {
        return Err(ChatError::Validation(format!(
            "Message is too long (max {} characters)",
            max_len
        )));
    }
    Ok(trimmed.to_string())
}

struct Active {
    epoch: u64,
    conversation: Conversation,
    feed: MessageFeed,
    typing: TypingDebouncer,
}

#[derive(Default)]
struct Status {
    connection: ConnectionState,
    transport: Option<TransportKind>,
    presence: Presence,
    last_error: Option<String>,
}

/// An outbound event waiting for the connection, optionally with someone awaiting the outcome
struct Outgoing {
    event: OutboundEvent,
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct Shared {
    user_id: String,
    config: Config,
    epochs: AtomicU64,
    active: Mutex<Option<Active>>,
    status: Mutex<Status>,
    peer_typing: PeerTypingIndicator,
    snapshot: watch::Sender<SessionSnapshot>,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl Shared {
    fn queue(&self, event: OutboundEvent) {
        if self.outbox.send(Outgoing { event, ack: None }).is_err() {
            debug!("Outbox closed, dropping event");
        }
    }

    fn set_error(&self, message: impl Into<String>) {
        lock(&self.status).last_error = Some(message.into());
    }

    /// Rebuild the snapshot. Must not be called while `active` or `status` is held.
    fn publish(&self) {
        self.snapshot.send_modify(|snapshot| {
            {
                let active = lock(&self.active);
                match active.as_ref() {
                    Some(active) => {
                        snapshot.conversation = Some(active.conversation.clone());
                        snapshot.messages = active.feed.messages();
                        snapshot.page_state = active.feed.state().clone();
                        snapshot.has_more = active.feed.has_more();
                    }
                    None => {
                        snapshot.conversation = None;
                        snapshot.messages.clear();
                        snapshot.page_state = PageState::Idle;
                        snapshot.has_more = false;
                    }
                }
            }

            let status = lock(&self.status);
            snapshot.connection = status.connection;
            snapshot.transport = status.transport;
            snapshot.presence = status.presence.clone();
            snapshot.last_error = status.last_error.clone();
            snapshot.peer_typing = self.peer_typing.is_typing();
        });
    }

    fn on_event(&self, epoch: u64, event: &InboundEvent) {
        let mut outgoing = Vec::new();
        let mut peer_typing = None;
        let mut presence = None;
        let mut error = None;

        {
            let mut guard = lock(&self.active);
            let Some(active) = guard.as_mut().filter(|a| a.epoch == epoch) else {
                debug!("Dropping {} event for a closed conversation", event.kind());
                return;
            };
            let conversation_id = active.conversation.id.clone();

            match event {
                InboundEvent::ReceiveMessage { message } => {
                    if active.feed.apply_incoming(message.clone())
                        && !message.is_from(&self.user_id)
                    {
                        outgoing.push(OutboundEvent::MarkRead {
                            conversation_id,
                            message_id: Some(message.id.clone()),
                        });
                    }
                }
                InboundEvent::MessageSent { message } => {
                    let mut confirmed = message.clone();
                    confirmed.status = MessageStatus::Sent;
                    active.feed.apply_sent(confirmed);
                }
                InboundEvent::UserTyping {
                    user_id, status, ..
                } => {
                    if *user_id == active.conversation.peer.id {
                        peer_typing = Some(*status);
                    }
                }
                InboundEvent::MessageDelivered { message_id, .. } => {
                    active.feed.set_status(message_id, MessageStatus::Delivered);
                }
                InboundEvent::MessageRead { message_id, .. } => {
                    active.feed.set_status(message_id, MessageStatus::Read);
                }
                InboundEvent::MessageError {
                    message_id,
                    error: reason,
                } => {
                    active.feed.set_status(message_id, MessageStatus::Failed);
                    error = Some(if reason.is_empty() {
                        format!("Message {} was rejected", message_id)
                    } else {
                        reason.clone()
                    });
                }
                InboundEvent::UserStatus {
                    user_id,
                    is_online,
                    last_seen,
                } => {
                    if *user_id == active.conversation.peer.id {
                        presence = Some(Presence {
                            online: *is_online,
                            last_seen: *last_seen,
                        });
                    }
                }
            }
        }

        for event in outgoing {
            self.queue(event);
        }
        if let Some(typing) = peer_typing {
            self.peer_typing.on_signal(typing);
        }
        if presence.is_some() || error.is_some() {
            let mut status = lock(&self.status);
            if let Some(presence) = presence {
                status.presence = presence;
            }
            if error.is_some() {
                status.last_error = error;
            }
        }
        self.publish();
    }

    fn on_connection(&self, event: &ConnectionEvent, state: ConnectionState, transport: Option<TransportKind>) {
        {
            let mut status = lock(&self.status);
            status.connection = state;
            status.transport = transport;
            if let ConnectionEvent::Error { message } = event {
                status.last_error = Some(message.clone());
            }
        }

        if let ConnectionEvent::Connected { .. } = event {
            // sends still `Sending` may have died in the old link's buffer;
            // the server drops duplicates by message id
            let pending = lock(&self.active).as_ref().map(|active| {
                let resends: Vec<OutboundEvent> = active
                    .feed
                    .iter()
                    .filter(|m| m.status == MessageStatus::Sending && m.is_from(&self.user_id))
                    .map(|m| send_event(m, &active.conversation.peer.id))
                    .collect();
                (active.conversation.id.clone(), resends)
            });
            if let Some((conversation_id, resends)) = pending {
                self.queue(OutboundEvent::SyncUndelivered { conversation_id });
                if !resends.is_empty() {
                    info!("Re-emitting {} unconfirmed messages", resends.len());
                }
                for event in resends {
                    self.queue(event);
                }
            }
        } else if !state.is_live() {
            self.fail_pending();
        }
        self.publish();
    }

    /// Mark our unconfirmed messages `Failed` once no link will carry them
    fn fail_pending(&self) {
        if let Some(active) = lock(&self.active).as_mut() {
            let pending: Vec<String> = active
                .feed
                .iter()
                .filter(|m| m.status == MessageStatus::Sending && m.is_from(&self.user_id))
                .map(|m| m.id.clone())
                .collect();
            for id in pending {
                warn!("Message {} was not confirmed before the connection ended", id);
                active.feed.set_status(&id, MessageStatus::Failed);
            }
        }
    }
}

/// Facade over one open conversation of a logged-in session
pub struct ConversationSession<C: Connector, H: HistoryApi> {
    session: Arc<SessionContext<C>>,
    history: Arc<H>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: Connector, H: HistoryApi> ConversationSession<C, H> {
    pub async fn new(session: Arc<SessionContext<C>>, history: H) -> Self {
        let connection_events = session.connection().subscribe();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let config = session.config().clone();

        let shared = Arc::new(Shared {
            user_id: session.user_id().to_string(),
            peer_typing: PeerTypingIndicator::new(config.peer_typing_timeout),
            config,
            epochs: AtomicU64::new(0),
            active: Mutex::new(None),
            status: Mutex::new(Status {
                connection: session.state().await,
                transport: session.connection().transport().await,
                ..Status::default()
            }),
            snapshot,
            outbox,
        });
        shared.publish();

        // drains until every sender (held by `shared`) is gone
        tokio::spawn(pump_outbox(session.clone(), outbox_rx));
        let tasks = vec![
            tokio::spawn(watch_connection(
                session.clone(),
                Arc::downgrade(&shared),
                connection_events,
            )),
            tokio::spawn(watch_peer_typing(
                Arc::downgrade(&shared),
                shared.peer_typing.subscribe(),
            )),
        ];

        Self {
            session,
            history: Arc::new(history),
            shared,
            tasks,
        }
    }

    /// Open `conversation_id`, replacing whatever was open before.
    ///
    /// Handlers of the previous conversation are dropped before the new ones
    /// are wired. The feed starts empty and page 1 is loaded. If the
    /// conversation cannot be fetched the previous one stays open.
    pub async fn open(&self, conversation_id: &str) -> Result<LoadOutcome> {
        if conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("Conversation id is empty".to_string()));
        }

        let conversation = match self.history.fetch_conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!("Could not open conversation {}: {}", conversation_id, e);
                self.shared.set_error(e.to_string());
                self.shared.publish();
                return Err(e);
            }
        };
        info!(
            "Opening conversation {} with {}",
            conversation.id, conversation.peer.display_name
        );

        let shared = &self.shared;
        let epoch = shared.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let dispatcher = self.session.dispatcher();
        {
            let mut active = lock(&shared.active);
            if let Some(previous) = active.take() {
                previous.typing.stop_now();
            }
            dispatcher.scope_to(Some(conversation.id.clone()));

            let sink = typing_sink(
                shared.outbox.clone(),
                conversation.id.clone(),
                conversation.peer.id.clone(),
            );
            *active = Some(Active {
                epoch,
                feed: MessageFeed::new(conversation.id.clone(), shared.config.page_size),
                typing: TypingDebouncer::new(shared.config.typing_quiet_period, sink),
                conversation: conversation.clone(),
            });
        }

        let weak = Arc::downgrade(shared);
        let on_event = handler(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_event(epoch, event);
            }
        });
        for kind in EventKind::ALL {
            dispatcher.subscribe(kind, &on_event);
        }

        shared.peer_typing.reset();
        {
            let mut status = lock(&shared.status);
            status.presence = Presence::default();
            status.last_error = None;
        }
        shared.publish();

        shared.queue(OutboundEvent::MarkRead {
            conversation_id: conversation.id.clone(),
            message_id: None,
        });
        shared.queue(OutboundEvent::SyncUndelivered {
            conversation_id: conversation.id,
        });

        self.load(true).await
    }

    /// Send a new message; it shows up as `Sending` right away.
    ///
    /// If the connection cannot take it the message stays in the feed as
    /// `Failed` and a [`ChatError::Send`] is returned.
    pub async fn send_message(&self, body: &str) -> Result<Message> {
        let body = validate_body(body, self.shared.config.max_message_len)?;
        let (message, event) = {
            let mut guard = lock(&self.shared.active);
            let active = guard.as_mut().ok_or(ChatError::NoActiveConversation)?;
            let message = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: active.conversation.id.clone(),
                sender_id: self.shared.user_id.clone(),
                body,
                created_at: Utc::now(),
                status: MessageStatus::Sending,
            };
            active.feed.apply_sent(message.clone());
            active.typing.stop_now();
            let event = send_event(&message, &active.conversation.peer.id);
            (message, event)
        };
        self.shared.publish();
        self.deliver(message, event).await
    }

    /// Send a `Failed` message again under the same id
    pub async fn resend(&self, message_id: &str) -> Result<Message> {
        let (message, event) = {
            let mut guard = lock(&self.shared.active);
            let active = guard.as_mut().ok_or(ChatError::NoActiveConversation)?;
            let Some(message) = active.feed.get(message_id).cloned() else {
                return Err(ChatError::Validation(format!("Unknown message {}", message_id)));
            };
            if message.status != MessageStatus::Failed {
                return Err(ChatError::Validation(format!(
                    "Message {} has not failed",
                    message_id
                )));
            }
            active.feed.set_status(message_id, MessageStatus::Sending);
            let event = send_event(&message, &active.conversation.peer.id);
            (message, event)
        };
        info!("Resending message {}", message_id);
        self.shared.publish();
        self.deliver(message, event).await
    }

    async fn deliver(&self, mut message: Message, event: OutboundEvent) -> Result<Message> {
        let (ack, outcome) = oneshot::channel();
        let result = match self.shared.outbox.send(Outgoing {
            event,
            ack: Some(ack),
        }) {
            Ok(()) => outcome.await.unwrap_or(Err(ChatError::NotConnected)),
            Err(_) => Err(ChatError::NotConnected),
        };

        match result {
            Ok(()) => {
                message.status = MessageStatus::Sending;
                Ok(message)
            }
            Err(e) => {
                warn!("Send of message {} failed: {}", message.id, e);
                if let Some(active) = lock(&self.shared.active).as_mut() {
                    active.feed.set_status(&message.id, MessageStatus::Failed);
                }
                self.shared.set_error(e.to_string());
                self.shared.publish();
                Err(ChatError::Send {
                    message_id: message.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// `true` for a keystroke, `false` when the input is cleared
    pub fn set_typing(&self, typing: bool) -> Result<()> {
        let guard = lock(&self.shared.active);
        let active = guard.as_ref().ok_or(ChatError::NoActiveConversation)?;
        if typing {
            active.typing.keystroke();
        } else {
            active.typing.stop_now();
        }
        Ok(())
    }

    /// Load the next page of older messages
    pub async fn load_more(&self) -> Result<LoadOutcome> {
        self.load(false).await
    }

    /// Reload page 1
    pub async fn refresh(&self) -> Result<LoadOutcome> {
        self.load(true).await
    }

    async fn load(&self, refresh: bool) -> Result<LoadOutcome> {
        let (epoch, request) = {
            let mut guard = lock(&self.shared.active);
            let active = guard.as_mut().ok_or(ChatError::NoActiveConversation)?;
            let request = if refresh {
                active.feed.begin_refresh()
            } else {
                active.feed.begin_load_more()
            };
            (active.epoch, request)
        };
        let Some(request) = request else {
            return Ok(LoadOutcome::Skipped);
        };
        self.shared.publish();

        let result = self
            .history
            .fetch_page(&request.conversation_id, request.page, request.limit)
            .await;

        let applied = {
            let mut guard = lock(&self.shared.active);
            match guard.as_mut() {
                Some(active)
                    if active.epoch == epoch
                        && active.conversation.id == request.conversation_id =>
                {
                    Some(active.feed.finish_load(request.page, result))
                }
                _ => None,
            }
        };

        match applied {
            None => {
                debug!(
                    "Discarding page {} of {}: conversation changed",
                    request.page, request.conversation_id
                );
                Ok(LoadOutcome::Discarded)
            }
            Some(Ok((added, has_more))) => {
                debug!(
                    "Page {} of {}: {} new messages, more: {}",
                    request.page, request.conversation_id, added, has_more
                );
                self.shared.publish();
                Ok(LoadOutcome::Loaded { added, has_more })
            }
            Some(Err(e)) => {
                warn!("Loading page {} failed: {}", request.page, e);
                self.shared.set_error(e.to_string());
                self.shared.publish();
                Err(e)
            }
        }
    }

    /// Close the open conversation; its handlers are dropped
    pub fn close(&self) {
        let previous = lock(&self.shared.active).take();
        if let Some(previous) = previous {
            info!("Closing conversation {}", previous.conversation.id);
            previous.typing.stop_now();
            self.session.dispatcher().scope_to(None);
        }
        self.shared.peer_typing.reset();
        self.shared.publish();
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn conversation(&self) -> Option<Conversation> {
        lock(&self.shared.active)
            .as_ref()
            .map(|a| a.conversation.clone())
    }

    pub fn session(&self) -> &Arc<SessionContext<C>> {
        &self.session
    }
}

impl<C: Connector, H: HistoryApi> Drop for ConversationSession<C, H> {
    fn drop(&mut self) {
        self.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn send_event(message: &Message, receiver_id: &str) -> OutboundEvent {
    OutboundEvent::SendMessage {
        message_id: message.id.clone(),
        conversation_id: message.conversation_id.clone(),
        receiver_id: receiver_id.to_string(),
        body: message.body.clone(),
        created_at: message.created_at,
    }
}

fn typing_sink(
    outbox: mpsc::UnboundedSender<Outgoing>,
    conversation_id: String,
    receiver_id: String,
) -> TypingSink {
    Arc::new(move |signal: TypingSignal| {
        let conversation_id = conversation_id.clone();
        let receiver_id = receiver_id.clone();
        let event = match signal {
            TypingSignal::Start => OutboundEvent::TypingStart {
                conversation_id,
                receiver_id,
            },
            TypingSignal::Stop => OutboundEvent::TypingEnd {
                conversation_id,
                receiver_id,
            },
        };
        let _ = outbox.send(Outgoing { event, ack: None });
    })
}

async fn pump_outbox<C: Connector>(
    session: Arc<SessionContext<C>>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(Outgoing { event, ack }) = outbox.recv().await {
        let name = event.name();
        let result = session.connection().send(event).await;
        match ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    debug!("Dropped {} event: {}", name, e);
                }
            }
        }
    }
}

async fn watch_connection<C: Connector>(
    session: Arc<SessionContext<C>>,
    shared: Weak<Shared>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Missed {} connection events", skipped);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let state = session.state().await;
        let transport = session.connection().transport().await;
        match shared.upgrade() {
            Some(shared) => shared.on_connection(&event, state, transport),
            None => return,
        }
    }
}

async fn watch_peer_typing(shared: Weak<Shared>, mut typing: watch::Receiver<bool>) {
    while typing.changed().await.is_ok() {
        match shared.upgrade() {
            Some(shared) => shared.publish(),
            None => return,
        }
    }
}
