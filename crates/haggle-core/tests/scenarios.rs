//! Scenario tests for reconciliation and the connection lifecycle.

use std::time::Duration;

use haggle_core::{
    ConnectionAction, ConnectionConfig, ConnectionError, ConnectionState, Environment,
    RealtimeConnection, ReconcileConfig, ReconciliationEngine,
};
use haggle_harness::{InvariantRegistry, SimEnv, SimInstant, StoreSnapshot};
use haggle_proto::{
    ChatSnapshot, ConversationId, Delivery, EventKind, Handshake, InboundEvent, Message,
    MessageId, PeerId, PeerProfile,
};

fn message(id: &str, seq: u64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from("C1"),
        sender_id: PeerId::from("u2"),
        text: format!("text {id}"),
        sent_at: seq * 1000,
        read_at: None,
        seq: Some(seq),
        client_ref: None,
        delivery: Delivery::Sent,
    }
}

fn new_message(id: &str, seq: u64) -> InboundEvent {
    InboundEvent::NewMessage {
        conversation_id: ConversationId::from("C1"),
        message: message(id, seq),
        peer: None,
    }
}

fn handshake() -> Handshake {
    Handshake {
        profile: PeerProfile { id: PeerId::from("me"), name: "Me".into(), avatar: None },
        token: Some("token".into()),
    }
}

/// REST returns C1 with [m1]; before it resolves the socket delivers m1
/// again and then m2. Expect [m1, m2] with no duplicate m1.
#[test]
fn early_duplicate_is_dropped_after_snapshot() {
    let mut engine = ReconciliationEngine::new(PeerId::from("me"), ReconcileConfig::default());

    engine.ingest(&new_message("m1", 1));
    engine.ingest(&new_message("m2", 2));
    assert_eq!(engine.buffered(), 2);

    engine.apply_snapshot(vec![ChatSnapshot {
        id: ConversationId::from("C1"),
        peer_profile: PeerProfile { id: PeerId::from("u2"), name: "Ada".into(), avatar: None },
        last_message: Some(message("m1", 1)),
        unread_count: 1,
        messages: vec![message("m1", 1)],
    }]);

    let c1 = engine.store().select(&ConversationId::from("C1")).expect("C1 seeded");
    let ids: Vec<&str> = c1.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(c1.unread_count, 2);
    assert_eq!(c1.peer.name, "Ada");
    assert!(engine.take_enrichment_requests().is_empty());

    InvariantRegistry::standard()
        .assert_all(&StoreSnapshot::from_store(engine.store()), "after snapshot drain");
}

/// Connection drops mid-session, three reconnection attempts with growing
/// backoff fail, then `disconnect()`: nothing fires afterwards.
#[test]
fn disconnect_after_failed_retries_settles() {
    let env = SimEnv::with_seed(7);
    let mut conn: RealtimeConnection<ReconciliationEngine, SimInstant> =
        RealtimeConnection::new(ConnectionConfig::default());
    let mut engine = ReconciliationEngine::new(PeerId::from("me"), ReconcileConfig::default());
    let _ = conn.on(EventKind::NewMessage, |engine: &mut ReconciliationEngine, event| {
        engine.ingest(event);
    });

    let _ = conn.connect(handshake(), env.now());
    let _ = conn.receive(&InboundEvent::Welcome { session_id: "s1".into() }, &mut engine);
    assert_eq!(conn.state(), ConnectionState::Connected);

    let mut actions =
        conn.transport_failed(ConnectionError::Transport("connection reset".into()), env.now());
    assert_eq!(conn.state(), ConnectionState::Reconnecting);

    let mut delays = Vec::new();
    for attempt in 1..=3u32 {
        let delay = actions
            .iter()
            .find_map(|a| match a {
                ConnectionAction::RetryScheduled { attempt: n, delay } if *n == attempt => Some(*delay),
                _ => None,
            })
            .expect("retry scheduled");
        delays.push(delay);

        env.advance(delay);
        let reopened = conn.tick(env.now());
        assert!(reopened.iter().any(|a| matches!(a, ConnectionAction::Open { .. })));

        actions = conn.transport_failed(ConnectionError::Transport("refused".into()), env.now());
    }
    assert!(delays.windows(2).all(|w| w[0] < w[1]), "backoff must grow: {delays:?}");

    let actions = conn.disconnect();
    assert_eq!(actions, vec![ConnectionAction::StateChanged(ConnectionState::Disconnected)]);

    for _ in 0..120 {
        env.advance(Duration::from_secs(30));
        assert!(conn.tick(env.now()).is_empty());
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(!conn.is_transport_open());
}

/// Events that arrive on a closed transport never reach the store.
#[test]
fn events_after_disconnect_are_dropped() {
    let env = SimEnv::with_seed(1);
    let mut conn: RealtimeConnection<ReconciliationEngine, SimInstant> =
        RealtimeConnection::new(ConnectionConfig::default());
    let mut engine = ReconciliationEngine::new(PeerId::from("me"), ReconcileConfig::default());
    engine.snapshot_failed();
    let _ = conn.on(EventKind::NewMessage, |engine: &mut ReconciliationEngine, event| {
        engine.ingest(event);
    });

    let _ = conn.connect(handshake(), env.now());
    let _ = conn.receive(&InboundEvent::Welcome { session_id: "s1".into() }, &mut engine);
    let _ = conn.receive(&new_message("m1", 1), &mut engine);
    let _ = conn.disconnect();
    let _ = conn.receive(&new_message("m2", 2), &mut engine);

    let c1 = engine.store().select(&ConversationId::from("C1")).expect("C1 created");
    assert_eq!(c1.messages.len(), 1);
}
