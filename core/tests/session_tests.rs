/// Conversation session tests
/// Facade behaviour end to end: history paging, live events, sends and typing

mod support;

use chatlink_core::error::ChatError;
use chatlink_core::realtime::{Credential, InboundEvent, OutboundEvent};
use chatlink_core::{
    ConnectionState, ConversationSession, LoadOutcome, MessageStatus, PageState, SessionContext,
    SessionSnapshot,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use support::{message, test_config, FakeConnector, FakeServer, MemoryHistory, RemoteLink, ME, PEER};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

type Chat = ConversationSession<FakeConnector, MemoryHistory>;

async fn start(history: MemoryHistory) -> (Chat, FakeServer, RemoteLink) {
    let (connector, mut server) = FakeServer::new();
    let session = SessionContext::login(test_config(), connector, &Credential::new(ME, "token"))
        .await
        .unwrap();
    let link = server.accept().await;
    let chat = ConversationSession::new(Arc::new(session), history).await;
    (chat, server, link)
}

async fn wait_until(
    rx: &mut watch::Receiver<SessionSnapshot>,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("snapshot condition never met")
}

fn ids(snapshot: &SessionSnapshot) -> Vec<String> {
    snapshot.messages.iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn test_open_loads_first_page_and_marks_read() {
    let history = MemoryHistory::new().with_conversation("c1", 45);
    let (chat, _server, mut link) = start(history).await;

    let outcome = chat.open("c1").await.unwrap();
    assert_eq!(outcome, LoadOutcome::Loaded { added: 20, has_more: true });

    let snapshot = chat.snapshot();
    assert_eq!(snapshot.messages.len(), 20);
    assert_eq!(snapshot.messages[0].id, "c1-44");
    assert_eq!(snapshot.conversation.unwrap().peer.id, PEER);
    assert_eq!(snapshot.connection, ConnectionState::Connected);

    assert_eq!(
        link.next_event().await,
        OutboundEvent::MarkRead {
            conversation_id: "c1".to_string(),
            message_id: None
        }
    );
    assert_eq!(
        link.next_event().await,
        OutboundEvent::SyncUndelivered {
            conversation_id: "c1".to_string()
        }
    );
}

#[tokio::test]
async fn test_pages_of_45_messages() {
    let history = MemoryHistory::new().with_conversation("c1", 45);
    let (chat, _server, _link) = start(history.clone()).await;

    assert_eq!(
        chat.open("c1").await.unwrap(),
        LoadOutcome::Loaded { added: 20, has_more: true }
    );
    assert_eq!(
        chat.load_more().await.unwrap(),
        LoadOutcome::Loaded { added: 20, has_more: true }
    );
    assert_eq!(
        chat.load_more().await.unwrap(),
        LoadOutcome::Loaded { added: 5, has_more: false }
    );
    assert_eq!(chat.load_more().await.unwrap(), LoadOutcome::Skipped);
    assert_eq!(history.fetches(), 3);

    let snapshot = chat.snapshot();
    assert_eq!(snapshot.messages.len(), 45);
    assert!(!snapshot.has_more);

    let unique: HashSet<_> = snapshot.messages.iter().map(|m| &m.id).collect();
    assert_eq!(unique.len(), 45);
    assert!(snapshot
        .messages
        .windows(2)
        .all(|pair| pair[0].display_cmp(&pair[1]).is_lt()));
}

#[tokio::test]
async fn test_concurrent_load_more_fetches_once() {
    let history = MemoryHistory::new().with_conversation("c1", 45);
    let (chat, _server, _link) = start(history.clone()).await;
    chat.open("c1").await.unwrap();

    history.set_delay(Duration::from_millis(100));
    let (first, second) = tokio::join!(chat.load_more(), chat.load_more());

    let outcomes = [first.unwrap(), second.unwrap()];
    assert!(outcomes.contains(&LoadOutcome::Skipped));
    assert!(outcomes.contains(&LoadOutcome::Loaded { added: 20, has_more: true }));
    assert_eq!(history.fetches(), 2);
}

#[tokio::test]
async fn test_live_insert_does_not_duplicate_across_pages() {
    let history = MemoryHistory::new().with_conversation("c1", 45);
    let (chat, _server, link) = start(history.clone()).await;
    let mut rx = chat.subscribe();
    chat.open("c1").await.unwrap();

    // a new message lands on the server and shifts every page by one
    let live = message("c1", "live", PEER, 100);
    history.add(live.clone());
    link.push(InboundEvent::ReceiveMessage { message: live }).await;
    wait_until(&mut rx, |s| s.messages.len() == 21).await;

    chat.load_more().await.unwrap();
    chat.load_more().await.unwrap();
    let snapshot = chat.snapshot();
    assert_eq!(snapshot.messages.len(), 46);
    let unique: HashSet<_> = ids(&snapshot).into_iter().collect();
    assert_eq!(unique.len(), 46);
}

#[tokio::test]
async fn test_switching_conversation_drops_old_events() {
    let history = MemoryHistory::new()
        .with_conversation("a", 3)
        .with_conversation("b", 3);
    let (chat, _server, link) = start(history).await;
    let mut rx = chat.subscribe();

    chat.open("a").await.unwrap();
    chat.open("b").await.unwrap();

    link.push(InboundEvent::ReceiveMessage {
        message: message("a", "late-a", PEER, 50),
    })
    .await;
    link.push(InboundEvent::ReceiveMessage {
        message: message("b", "new-b", PEER, 50),
    })
    .await;

    let snapshot = wait_until(&mut rx, |s| ids(s).contains(&"new-b".to_string())).await;
    assert!(!ids(&snapshot).contains(&"late-a".to_string()));
    assert!(snapshot.messages.iter().all(|m| m.conversation_id == "b"));
}

#[tokio::test]
async fn test_stale_page_is_discarded_after_switch() {
    let history = MemoryHistory::new()
        .with_conversation("a", 45)
        .with_conversation("b", 2);
    let (chat, _server, _link) = start(history.clone()).await;
    chat.open("a").await.unwrap();

    history.set_delay(Duration::from_millis(200));
    let (more, opened) = tokio::join!(chat.load_more(), async {
        sleep(Duration::from_millis(50)).await;
        chat.open("b").await
    });

    assert_eq!(more.unwrap(), LoadOutcome::Discarded);
    assert_eq!(
        opened.unwrap(),
        LoadOutcome::Loaded { added: 2, has_more: false }
    );
    let snapshot = chat.snapshot();
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.conversation.unwrap().id, "b");
}

#[tokio::test]
async fn test_sent_message_and_echo_keep_one_copy() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, _server, mut link) = start(history).await;
    let mut rx = chat.subscribe();
    chat.open("c1").await.unwrap();

    let sent = chat.send_message("  hello  ").await.unwrap();
    assert_eq!(sent.body, "hello");
    assert_eq!(chat.snapshot().messages[0].status, MessageStatus::Sending);

    let event = link
        .expect_event(|e| matches!(e, OutboundEvent::SendMessage { .. }))
        .await;
    match event {
        OutboundEvent::SendMessage {
            message_id,
            receiver_id,
            body,
            ..
        } => {
            assert_eq!(message_id, sent.id);
            assert_eq!(receiver_id, PEER);
            assert_eq!(body, "hello");
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut echoed = sent.clone();
    echoed.status = MessageStatus::Delivered;
    link.push(InboundEvent::MessageSent { message: sent.clone() }).await;
    link.push(InboundEvent::ReceiveMessage { message: echoed }).await;
    link.push(InboundEvent::MessageRead {
        message_id: sent.id.clone(),
        conversation_id: Some("c1".to_string()),
    })
    .await;

    let snapshot = wait_until(&mut rx, |s| {
        s.messages.first().map(|m| m.status) == Some(MessageStatus::Read)
    })
    .await;
    assert_eq!(snapshot.messages.len(), 1);
}

#[tokio::test]
async fn test_invalid_bodies_are_rejected() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, _server, _link) = start(history).await;

    assert!(matches!(
        chat.send_message("hi").await,
        Err(ChatError::NoActiveConversation)
    ));

    chat.open("c1").await.unwrap();
    assert!(matches!(
        chat.send_message("   ").await,
        Err(ChatError::Validation(_))
    ));
    assert!(matches!(
        chat.send_message(&"x".repeat(1001)).await,
        Err(ChatError::Validation(_))
    ));
    assert!(chat.snapshot().messages.is_empty());
}

#[tokio::test]
async fn test_failed_send_can_be_resent() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, mut server, link) = start(history).await;
    chat.open("c1").await.unwrap();

    // server refuses everything after the link drops
    server.refuse(chatlink_core::TransportKind::Stream);
    server.refuse(chatlink_core::TransportKind::Polling);
    drop(link);
    let mut rx = chat.subscribe();
    wait_until(&mut rx, |s| s.connection == ConnectionState::Failed).await;

    let err = chat.send_message("are you there?").await.unwrap_err();
    let ChatError::Send { message_id, .. } = err else {
        panic!("expected a send error, got {:?}", err);
    };
    let snapshot = chat.snapshot();
    assert_eq!(snapshot.messages[0].status, MessageStatus::Failed);
    assert!(snapshot.last_error.is_some());

    server.allow_all();
    chat.session().reconnect().await.unwrap();
    let mut link = server.accept().await;

    let resent = chat.resend(&message_id).await.unwrap();
    assert_eq!(resent.id, message_id);
    let event = link
        .expect_event(|e| matches!(e, OutboundEvent::SendMessage { .. }))
        .await;
    assert!(matches!(event, OutboundEvent::SendMessage { message_id: id, .. } if id == message_id));
    assert_eq!(chat.snapshot().messages[0].status, MessageStatus::Sending);

    // only failed messages can be resent
    assert!(matches!(
        chat.resend(&message_id).await,
        Err(ChatError::Validation(_))
    ));
}

#[tokio::test]
async fn test_peer_message_is_marked_read() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, _server, mut link) = start(history).await;
    chat.open("c1").await.unwrap();

    link.push(InboundEvent::ReceiveMessage {
        message: message("c1", "p1", PEER, 5),
    })
    .await;

    let event = link
        .expect_event(|e| matches!(e, OutboundEvent::MarkRead { message_id: Some(_), .. }))
        .await;
    assert_eq!(
        event,
        OutboundEvent::MarkRead {
            conversation_id: "c1".to_string(),
            message_id: Some("p1".to_string())
        }
    );
}

#[tokio::test]
async fn test_typing_burst_sends_one_start_and_one_stop() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, _server, mut link) = start(history).await;
    chat.open("c1").await.unwrap();

    for _ in 0..10 {
        chat.set_typing(true).unwrap();
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_millis(300)).await;

    let mut typing = Vec::new();
    while let Ok(event) = link.from_client.try_recv() {
        if matches!(
            event,
            OutboundEvent::TypingStart { .. } | OutboundEvent::TypingEnd { .. }
        ) {
            typing.push(event);
        }
    }
    assert_eq!(
        typing,
        vec![
            OutboundEvent::TypingStart {
                conversation_id: "c1".to_string(),
                receiver_id: PEER.to_string()
            },
            OutboundEvent::TypingEnd {
                conversation_id: "c1".to_string(),
                receiver_id: PEER.to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_peer_typing_flag_expires() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, _server, link) = start(history).await;
    let mut rx = chat.subscribe();
    chat.open("c1").await.unwrap();

    // typing payloads need not name the conversation
    link.push(InboundEvent::UserTyping {
        conversation_id: None,
        user_id: PEER.to_string(),
        status: true,
    })
    .await;
    wait_until(&mut rx, |s| s.peer_typing).await;

    // no stop signal: the flag clears on its own
    wait_until(&mut rx, |s| !s.peer_typing).await;

    // our own typing echoed back is not the peer typing
    link.push(InboundEvent::UserTyping {
        conversation_id: Some("c1".to_string()),
        user_id: ME.to_string(),
        status: true,
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    assert!(!chat.snapshot().peer_typing);
}

#[tokio::test]
async fn test_failed_fetch_keeps_feed() {
    let history = MemoryHistory::new().with_conversation("c1", 45);
    let (chat, _server, _link) = start(history.clone()).await;
    chat.open("c1").await.unwrap();

    history.set_failing(true);
    assert!(matches!(chat.load_more().await, Err(ChatError::Fetch(_))));
    let snapshot = chat.snapshot();
    assert_eq!(snapshot.messages.len(), 20);
    assert!(matches!(snapshot.page_state, PageState::Errored { page: 2, .. }));

    history.set_failing(false);
    assert_eq!(
        chat.load_more().await.unwrap(),
        LoadOutcome::Loaded { added: 20, has_more: true }
    );
}

#[tokio::test]
async fn test_reconnect_syncs_open_conversation() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, mut server, link) = start(history).await;
    let mut rx = chat.subscribe();
    chat.open("c1").await.unwrap();

    drop(link);
    let mut link = server.accept().await;
    link.expect_event(|e| {
        *e == OutboundEvent::SyncUndelivered {
            conversation_id: "c1".to_string(),
        }
    })
    .await;

    // handlers survive the reconnect
    link.push(InboundEvent::ReceiveMessage {
        message: message("c1", "after", PEER, 9),
    })
    .await;
    wait_until(&mut rx, |s| ids(s) == vec!["after".to_string()]).await;
}

#[tokio::test]
async fn test_unconfirmed_send_is_reemitted_after_reconnect() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, mut server, link) = start(history).await;
    chat.open("c1").await.unwrap();

    // the event sits in the link buffer when the link dies
    let sent = chat.send_message("hello").await.unwrap();
    drop(link);

    let mut link = server.accept().await;
    match link
        .expect_event(|e| matches!(e, OutboundEvent::SendMessage { .. }))
        .await
    {
        OutboundEvent::SendMessage {
            message_id, body, ..
        } => {
            assert_eq!(message_id, sent.id);
            assert_eq!(body, "hello");
        }
        other => panic!("expected send_message, got {:?}", other),
    }

    let snapshot = chat.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sending);
}

#[tokio::test]
async fn test_unconfirmed_send_fails_when_connection_ends() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, _server, _link) = start(history).await;
    let mut rx = chat.subscribe();
    chat.open("c1").await.unwrap();

    let sent = chat.send_message("hello").await.unwrap();
    chat.session().connection().disconnect().await;

    wait_until(&mut rx, |s| {
        s.messages
            .iter()
            .any(|m| m.id == sent.id && m.status == MessageStatus::Failed)
    })
    .await;
}

#[tokio::test]
async fn test_presence_and_delivery_receipts() {
    let history = MemoryHistory::new().with_conversation("c1", 0);
    let (chat, _server, link) = start(history).await;
    let mut rx = chat.subscribe();
    chat.open("c1").await.unwrap();

    let sent = chat.send_message("ping").await.unwrap();
    link.push(InboundEvent::UserStatus {
        user_id: PEER.to_string(),
        is_online: true,
        last_seen: None,
    })
    .await;
    link.push(InboundEvent::MessageDelivered {
        message_id: sent.id.clone(),
        conversation_id: None,
    })
    .await;

    let snapshot = wait_until(&mut rx, |s| {
        s.presence.online && s.messages.first().map(|m| m.status) == Some(MessageStatus::Delivered)
    })
    .await;
    assert_eq!(snapshot.messages.len(), 1);
}
