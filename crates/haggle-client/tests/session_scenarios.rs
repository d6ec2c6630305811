//! Session scenario tests.
//!
//! These tests drive [`ChatSession`] with a simulated environment and verify:
//! - Sends while disconnected are stored failed and retried only by the user
//! - Results from a stopped session never reach the next one
//! - Acknowledgements replace optimistic messages; missing ones time out
//! - Shell conversations trigger exactly one enrichment fetch
//! - A first message to a new peer lands in the server-assigned conversation

use std::time::Duration;

use haggle_client::{ChatSession, ConnectionState, SessionAction, SessionConfig, SessionError, SessionEvent, SessionIdentity};
use haggle_core::{ConnectionError, Environment, SendFailure};
use haggle_harness::{InvariantRegistry, SimEnv, SimInstant, StoreSnapshot};
use haggle_proto::{
    ChatSnapshot, ConversationId, Delivery, InboundEvent, Message, MessageId, OutboundFrame, PeerId,
    PeerProfile,
};

fn me() -> PeerProfile {
    PeerProfile { id: PeerId::from("me"), name: "Me".into(), avatar: None }
}

fn ada() -> PeerProfile {
    PeerProfile { id: PeerId::from("ada"), name: "Ada".into(), avatar: Some("https://cdn/ada.png".into()) }
}

fn server_message(id: &str, conversation: &str, sender: &str, seq: u64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: PeerId::from(sender),
        text: format!("text {id}"),
        sent_at: seq * 1000,
        read_at: None,
        seq: Some(seq),
        client_ref: None,
        delivery: Delivery::Sent,
    }
}

fn chat_with_ada() -> ChatSnapshot {
    let history = vec![server_message("m1", "C1", "ada", 1)];
    ChatSnapshot {
        id: ConversationId::from("C1"),
        peer_profile: ada(),
        last_message: history.last().cloned(),
        unread_count: 1,
        messages: history,
    }
}

fn frame(session: &ChatSession<SimEnv>, event: InboundEvent) -> SessionEvent<SimInstant> {
    SessionEvent::FrameReceived { epoch: session.epoch(), generation: session.generation(), event }
}

/// Start a session and resolve the snapshot with one chat. The realtime
/// handshake is left pending.
fn started(env: &SimEnv) -> ChatSession<SimEnv> {
    let mut session = ChatSession::new(env.clone(), SessionConfig::default());
    let actions = session.start(Some(SessionIdentity::new(me()).with_token("t0k"))).expect("start");
    assert!(actions.iter().any(|a| matches!(a, SessionAction::OpenRealtime { .. })));

    let epoch = session.epoch();
    let _ = session.handle(SessionEvent::LastChatsFetched { epoch, result: Ok(vec![chat_with_ada()]) });
    session
}

fn connected(env: &SimEnv) -> ChatSession<SimEnv> {
    let mut session = started(env);
    let welcome = frame(&session, InboundEvent::Welcome { session_id: "s1".into() });
    let _ = session.handle(welcome);
    assert_eq!(session.connection_state(), ConnectionState::Connected);
    session
}

fn transmitted(actions: &[SessionAction]) -> Vec<OutboundFrame> {
    actions
        .iter()
        .filter_map(|a| match a {
            SessionAction::Transmit { frame, .. } => Some(frame.clone()),
            _ => None,
        })
        .collect()
}

fn delivery_of(session: &ChatSession<SimEnv>, conversation: &ConversationId, id: &MessageId) -> Option<Delivery> {
    session.select(conversation)?.messages.iter().find(|m| &m.id == id).map(|m| m.delivery)
}

fn assert_invariants(session: &ChatSession<SimEnv>, context: &str) {
    InvariantRegistry::standard().assert_all(&StoreSnapshot::from_store(session.store()), context);
}

/// The user sends while disconnected: the message is stored failed and not
/// transmitted; retry fails while still disconnected; after reconnecting,
/// retry transmits with the original local id.
#[test]
fn send_while_disconnected_then_retry() {
    let env = SimEnv::with_seed(7);
    let mut session = started(&env);
    let c1 = ConversationId::from("C1");

    let (local, actions) = session.send_message(&c1, "is this still available?").expect("send");
    assert!(transmitted(&actions).is_empty());
    assert_eq!(delivery_of(&session, &c1, &local), Some(Delivery::Failed));
    assert_eq!(session.last_error(), Some(&SessionError::Send(SendFailure::NotConnected)));

    let err = session.retry_message(&c1, &local).unwrap_err();
    assert_eq!(err, SessionError::Send(SendFailure::NotConnected));
    assert_eq!(delivery_of(&session, &c1, &local), Some(Delivery::Failed));

    let welcome = frame(&session, InboundEvent::Welcome { session_id: "s1".into() });
    let _ = session.handle(welcome);
    let actions = session.retry_message(&c1, &local).expect("retry");

    assert_eq!(
        transmitted(&actions),
        vec![OutboundFrame::SendMessage {
            conversation_id: Some(c1.clone()),
            peer_id: None,
            client_ref: local.clone(),
            text: "is this still available?".into(),
        }]
    );
    assert_eq!(delivery_of(&session, &c1, &local), Some(Delivery::Pending));

    let mut ack = server_message("m2", "C1", "me", 2);
    ack.text = "is this still available?".into();
    let ack = frame(&session, InboundEvent::MessageAck { client_ref: local.clone(), message: ack, peer: None });
    let _ = session.handle(ack);

    let ids: Vec<&str> = session.select(&c1).expect("C1").messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(session.pending_sends(), 0);
    assert_invariants(&session, "after acknowledged retry");
}

/// Retrying a message that did not fail is rejected.
#[test]
fn retry_requires_failed_message() {
    let env = SimEnv::with_seed(1);
    let mut session = connected(&env);
    let c1 = ConversationId::from("C1");

    let err = session.retry_message(&c1, &MessageId::from("m1")).unwrap_err();
    assert_eq!(err, SessionError::Send(SendFailure::UnknownMessage(MessageId::from("m1"))));
}

/// A snapshot that resolves after `stop()` must not seed the next session.
#[test]
fn stale_results_are_ignored() {
    let env = SimEnv::with_seed(2);
    let mut session = ChatSession::new(env.clone(), SessionConfig::default());
    let _ = session.start(Some(SessionIdentity::new(me()))).expect("start");
    let first_epoch = session.epoch();

    let _ = session.stop();
    let _ = session.start(Some(SessionIdentity::new(me()))).expect("restart");
    assert_ne!(session.epoch(), first_epoch);

    let actions = session
        .handle(SessionEvent::LastChatsFetched { epoch: first_epoch, result: Ok(vec![chat_with_ada()]) });
    assert!(actions.is_empty());
    assert!(session.store().is_empty());

    let late = SessionEvent::FrameReceived {
        epoch: first_epoch,
        generation: 1,
        event: InboundEvent::Welcome { session_id: "old".into() },
    };
    let _ = session.handle(late);
    assert_eq!(session.connection_state(), ConnectionState::Connecting);
}

/// Without an acknowledgement the pending message fails after the timeout.
#[test]
fn unacknowledged_send_times_out() {
    let env = SimEnv::with_seed(3);
    let mut session = connected(&env);
    let c1 = ConversationId::from("C1");

    let (local, actions) = session.send_message(&c1, "hello").expect("send");
    assert_eq!(transmitted(&actions).len(), 1);
    assert_eq!(session.pending_sends(), 1);

    env.advance(Duration::from_secs(5));
    let _ = session.handle(SessionEvent::Tick { now: env.now() });
    assert_eq!(delivery_of(&session, &c1, &local), Some(Delivery::Pending));

    env.advance(Duration::from_secs(11));
    let _ = session.handle(SessionEvent::Tick { now: env.now() });
    assert_eq!(delivery_of(&session, &c1, &local), Some(Delivery::Failed));
    assert_eq!(session.pending_sends(), 0);
    assert!(matches!(session.last_error(), Some(SessionError::Send(SendFailure::AckTimeout(_)))));
}

/// A server rejection flags the message failed.
#[test]
fn rejected_send_is_failed() {
    let env = SimEnv::with_seed(4);
    let mut session = connected(&env);
    let c1 = ConversationId::from("C1");

    let (local, _) = session.send_message(&c1, "spam").expect("send");
    let rejected =
        frame(&session, InboundEvent::SendRejected { client_ref: local.clone(), reason: "blocked".into() });
    let _ = session.handle(rejected);

    assert_eq!(delivery_of(&session, &c1, &local), Some(Delivery::Failed));
    assert_eq!(session.last_error(), Some(&SessionError::Send(SendFailure::Rejected("blocked".into()))));
}

/// Unauthorized is terminal: no reconnection however long we wait.
#[test]
fn unauthorized_is_terminal() {
    let env = SimEnv::with_seed(5);
    let mut session = started(&env);

    let refused = frame(&session, InboundEvent::Unauthorized { reason: "expired token".into() });
    let actions = session.handle(refused);
    assert!(actions.iter().any(|a| matches!(a, SessionAction::CloseRealtime { .. })));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        session.last_error(),
        Some(&SessionError::Connection(ConnectionError::Unauthorized { reason: "expired token".into() }))
    );

    for _ in 0..10 {
        env.advance(Duration::from_secs(60));
        assert!(session.handle(SessionEvent::Tick { now: env.now() }).is_empty());
    }
}

/// A dropped connection reopens after backoff.
#[test]
fn dropped_connection_reopens() {
    let env = SimEnv::with_seed(6);
    let mut session = connected(&env);
    let observer = session.observe_connection();

    let epoch = session.epoch();
    let generation = session.generation();
    let actions = session.handle(SessionEvent::TransportFailed {
        epoch,
        generation,
        error: ConnectionError::Transport("reset".into()),
    });
    assert_eq!(actions, vec![SessionAction::CloseRealtime { epoch }]);
    assert_eq!(*observer.borrow(), ConnectionState::Reconnecting);

    env.advance(Duration::from_millis(100));
    assert!(session.handle(SessionEvent::Tick { now: env.now() }).is_empty());

    env.advance(Duration::from_millis(400));
    let actions = session.handle(SessionEvent::Tick { now: env.now() });
    assert!(matches!(actions.as_slice(), [SessionAction::OpenRealtime { generation: 2, .. }]));
}

/// A late failure or frame from the replaced socket must not touch the
/// transport that superseded it within the same session.
#[test]
fn replaced_transport_events_are_ignored() {
    let env = SimEnv::with_seed(11);
    let mut session = connected(&env);
    let epoch = session.epoch();
    let first = session.generation();

    let _ = session.handle(SessionEvent::TransportFailed {
        epoch,
        generation: first,
        error: ConnectionError::Transport("reset".into()),
    });
    env.advance(Duration::from_millis(500));
    let _ = session.handle(SessionEvent::Tick { now: env.now() });
    assert_eq!(session.generation(), first + 1);
    let welcome = frame(&session, InboundEvent::Welcome { session_id: "s2".into() });
    let _ = session.handle(welcome);
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    let stale_failure = SessionEvent::TransportFailed {
        epoch,
        generation: first,
        error: ConnectionError::Transport("old socket closed".into()),
    };
    assert!(session.handle(stale_failure).is_empty());
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    let stale_frame = SessionEvent::FrameReceived {
        epoch,
        generation: first,
        event: InboundEvent::Presence { peer_id: PeerId::from("ada"), online: true },
    };
    let _ = session.handle(stale_frame);
    assert!(!session.is_online(&PeerId::from("ada")));
}

/// Stopping a live session tells the server before closing the socket.
#[test]
fn stop_says_goodbye_when_connected() {
    let env = SimEnv::with_seed(12);
    let mut session = connected(&env);
    let epoch = session.epoch();

    let actions = session.stop();

    assert_eq!(
        actions,
        vec![
            SessionAction::Transmit { epoch, frame: OutboundFrame::Goodbye },
            SessionAction::CloseRealtime { epoch },
        ]
    );
}

/// Before the welcome there is no server session to leave.
#[test]
fn stop_before_welcome_skips_goodbye() {
    let env = SimEnv::with_seed(13);
    let mut session = started(&env);
    let epoch = session.epoch();

    assert_eq!(session.stop(), vec![SessionAction::CloseRealtime { epoch }]);
}

/// A message for an unknown conversation creates a shell and asks for its
/// peer once; the fetched profile fills it in.
#[test]
fn shell_conversation_is_enriched() {
    let env = SimEnv::with_seed(8);
    let mut session = connected(&env);
    let c9 = ConversationId::from("C9");

    let event = frame(
        &session,
        InboundEvent::NewMessage {
            conversation_id: c9.clone(),
            message: server_message("x1", "C9", "bob", 1),
            peer: None,
        },
    );
    let actions = session.handle(event);
    assert_eq!(actions, vec![SessionAction::FetchPeer { epoch: session.epoch(), conversation_id: c9.clone() }]);

    let second = frame(
        &session,
        InboundEvent::NewMessage {
            conversation_id: c9.clone(),
            message: server_message("x2", "C9", "bob", 2),
            peer: None,
        },
    );
    assert!(session.handle(second).is_empty());

    let bob = PeerProfile { id: PeerId::from("bob"), name: "Bob".into(), avatar: None };
    let epoch = session.epoch();
    let _ = session.handle(SessionEvent::PeerFetched { epoch, conversation_id: c9.clone(), result: Ok(bob) });

    let conversation = session.select(&c9).expect("C9");
    assert_eq!(conversation.peer.name, "Bob");
    assert_eq!(conversation.unread_count, 2);
    assert_eq!(session.total_unread(), 3);
    assert_invariants(&session, "after enrichment");
}

/// The first message to a new peer goes out by peer id; the acknowledgement
/// moves it into the conversation the server created.
#[test]
fn first_message_to_new_peer() {
    let env = SimEnv::with_seed(9);
    let mut session = connected(&env);
    let carol = PeerProfile { id: PeerId::from("carol"), name: "Carol".into(), avatar: None };

    let provisional = session.open_with_peer(carol.clone()).expect("open");
    assert!(provisional.is_provisional());

    let (local, actions) = session.send_message(&provisional, "hi carol").expect("send");
    assert_eq!(
        transmitted(&actions),
        vec![OutboundFrame::SendMessage {
            conversation_id: None,
            peer_id: Some(carol.id.clone()),
            client_ref: local.clone(),
            text: "hi carol".into(),
        }]
    );

    let mut assigned = server_message("k1", "C7", "me", 1);
    assigned.text = "hi carol".into();
    let ack = frame(&session, InboundEvent::MessageAck { client_ref: local, message: assigned, peer: Some(carol) });
    let _ = session.handle(ack);

    let c7 = session.select(&ConversationId::from("C7")).expect("C7 created");
    let ids: Vec<&str> = c7.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["k1"]);
    assert_eq!(session.select(&provisional).map(|c| c.id.clone()), Some(ConversationId::from("C7")));
    assert_eq!(session.store().len(), 2);
    assert_invariants(&session, "after first message");
}

/// Marking read zeroes the count and reports the read upstream.
#[test]
fn mark_read_transmits_when_connected() {
    let env = SimEnv::with_seed(10);
    let mut session = connected(&env);
    let c1 = ConversationId::from("C1");
    assert_eq!(session.total_unread(), 1);

    let actions = session.mark_read(&c1, None).expect("mark read");
    assert_eq!(
        transmitted(&actions),
        vec![OutboundFrame::MarkRead { conversation_id: c1.clone(), message_id: MessageId::from("m1") }]
    );
    assert_eq!(session.total_unread(), 0);

    assert!(session.mark_read(&c1, None).expect("again").is_empty());
}
