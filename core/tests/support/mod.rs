//! In-memory fakes shared by the integration tests
#![allow(dead_code)]

use chatlink_core::error::{ChatError, Result};
use chatlink_core::realtime::{Connector, Credential, InboundEvent, Link, OutboundEvent, TransportKind};
use chatlink_core::{Config, Conversation, FeedPage, HistoryApi, Message, MessageStatus, UserSummary};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

pub const ME: &str = "me";
pub const PEER: &str = "peer";

/// Server side of one accepted fake connection
pub struct RemoteLink {
    pub transport: TransportKind,
    pub credential: Credential,
    pub to_client: mpsc::Sender<InboundEvent>,
    pub from_client: mpsc::Receiver<OutboundEvent>,
}

impl RemoteLink {
    pub async fn push(&self, event: InboundEvent) {
        self.to_client.send(event).await.unwrap();
    }

    /// Next event the client emitted, failing the test after two seconds
    pub async fn next_event(&mut self) -> OutboundEvent {
        timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("client link closed")
    }

    /// Skip events until one matches
    pub async fn expect_event(&mut self, pred: impl Fn(&OutboundEvent) -> bool) -> OutboundEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }
}

/// Connector whose links are driven by the test
#[derive(Clone)]
pub struct FakeConnector {
    accepted: mpsc::UnboundedSender<RemoteLink>,
    refused: Arc<Mutex<HashSet<TransportKind>>>,
    fail_next: Arc<AtomicU32>,
    attempts: Arc<Mutex<Vec<TransportKind>>>,
}

pub struct FakeServer {
    pub links: mpsc::UnboundedReceiver<RemoteLink>,
    connector: FakeConnector,
}

impl FakeServer {
    pub fn new() -> (FakeConnector, FakeServer) {
        let (accepted, links) = mpsc::unbounded_channel();
        let connector = FakeConnector {
            accepted,
            refused: Arc::new(Mutex::new(HashSet::new())),
            fail_next: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
        };
        let server = FakeServer {
            links,
            connector: connector.clone(),
        };
        (connector, server)
    }

    pub async fn accept(&mut self) -> RemoteLink {
        timeout(Duration::from_secs(2), self.links.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    pub fn refuse(&self, transport: TransportKind) {
        self.connector.refused.lock().unwrap().insert(transport);
    }

    pub fn allow_all(&self) {
        self.connector.refused.lock().unwrap().clear();
    }

    pub fn fail_next(&self, count: u32) {
        self.connector.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<TransportKind> {
        self.connector.attempts.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    async fn connect(&self, transport: TransportKind, credential: &Credential) -> Result<Link> {
        self.attempts.lock().unwrap().push(transport);

        if self.refused.lock().unwrap().contains(&transport) {
            return Err(ChatError::Connection(format!("{} refused", transport)));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChatError::Connection("connection reset".to_string()));
        }

        let (to_client, inbound) = mpsc::channel(64);
        let (outbound, from_client) = mpsc::channel(64);
        let _ = self.accepted.send(RemoteLink {
            transport,
            credential: credential.clone(),
            to_client,
            from_client,
        });
        Ok(Link::new(transport, outbound, inbound, None))
    }
}

/// Config with short timers so tests run quickly
pub fn test_config() -> Config {
    Config {
        max_connection_attempts: 5,
        fallback_after: 2,
        retry_interval: Duration::from_millis(10),
        retry_jitter: Duration::ZERO,
        connection_timeout: Duration::from_secs(1),
        typing_quiet_period: Duration::from_millis(150),
        peer_typing_timeout: Duration::from_millis(400),
        ..Config::default()
    }
}

pub fn message(conversation_id: &str, id: &str, sender: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        body: format!("message {}", id),
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        status: MessageStatus::Delivered,
    }
}

/// History backend holding messages in memory, paged newest first
#[derive(Clone, Default)]
pub struct MemoryHistory {
    conversations: Arc<Mutex<HashMap<String, Vec<Message>>>>,
    delay_ms: Arc<AtomicU32>,
    failing: Arc<AtomicBool>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversation with `count` peer messages `{prefix}-0` (oldest) .. `{prefix}-{count-1}`
    pub fn with_conversation(self, conversation_id: &str, count: usize) -> Self {
        let messages = (0..count)
            .map(|i| message(conversation_id, &format!("{}-{}", conversation_id, i), PEER, i as i64))
            .collect();
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), messages);
        self
    }

    pub fn add(&self, message: Message) {
        self.conversations
            .lock()
            .unwrap()
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl HistoryApi for MemoryHistory {
    async fn fetch_page(&self, conversation_id: &str, page: u32, limit: usize) -> Result<FeedPage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChatError::Fetch("backend unavailable".to_string()));
        }

        let mut all = self
            .conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        all.sort_by(Message::display_cmp);

        let offset = (page as usize - 1) * limit;
        let messages: Vec<Message> = all.iter().skip(offset).take(limit).cloned().collect();
        Ok(FeedPage {
            page,
            has_more: offset + messages.len() < all.len(),
            messages,
        })
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        if !self.conversations.lock().unwrap().contains_key(conversation_id) {
            return Err(ChatError::Fetch(format!("conversation {} not found", conversation_id)));
        }
        Ok(Conversation {
            id: conversation_id.to_string(),
            peer: UserSummary {
                id: PEER.to_string(),
                display_name: "Peer".to_string(),
                avatar: None,
            },
            unread_count: 0,
        })
    }
}
