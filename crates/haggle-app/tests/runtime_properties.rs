//! Property-based tests for the session runtime.
//!
//! Tests verify that store invariants hold after every step of arbitrary
//! interleavings of user commands, server frames, connection drops and time.

use std::time::Duration;

use haggle_app::{Command, Runtime};
use haggle_client::{ChatSession, SessionConfig, SessionIdentity};
use haggle_harness::{InvariantRegistry, SimDriver, SimEnv, StoreSnapshot};
use haggle_proto::{
    ChatSnapshot, ConversationId, Delivery, InboundEvent, Message, MessageId, PeerId, PeerProfile,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send { conversation: u8 },
    Incoming { conversation: u8, message: u8 },
    AckOldestLocal,
    MarkRead { conversation: u8 },
    PeerRead { conversation: u8, message: u8 },
    DropConnection,
    Advance { millis: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..3).prop_map(|conversation| Op::Send { conversation }),
        4 => (0u8..3, 0u8..10).prop_map(|(conversation, message)| Op::Incoming { conversation, message }),
        2 => Just(Op::AckOldestLocal),
        2 => (0u8..3).prop_map(|conversation| Op::MarkRead { conversation }),
        1 => (0u8..3, 0u8..10).prop_map(|(conversation, message)| Op::PeerRead { conversation, message }),
        1 => Just(Op::DropConnection),
        2 => (0u64..20_000).prop_map(|millis| Op::Advance { millis }),
    ]
}

fn conversation_id(n: u8) -> ConversationId {
    ConversationId::new(format!("C{n}"))
}

fn peer(n: u8) -> PeerProfile {
    PeerProfile { id: PeerId::new(format!("u{n}")), name: format!("user {n}"), avatar: None }
}

fn peer_message(conversation: u8, n: u8) -> Message {
    Message {
        id: MessageId::new(format!("m{n}")),
        conversation_id: conversation_id(conversation),
        sender_id: peer(conversation).id,
        text: format!("text {n}"),
        sent_at: u64::from(n) * 100,
        read_at: None,
        seq: Some(u64::from(n)),
        client_ref: None,
        delivery: Delivery::Sent,
    }
}

fn seed() -> Vec<ChatSnapshot> {
    (0u8..2)
        .map(|c| {
            let messages = vec![peer_message(c, 0)];
            ChatSnapshot {
                id: conversation_id(c),
                peer_profile: peer(c),
                last_message: messages.last().cloned(),
                unread_count: 1,
                messages,
            }
        })
        .collect()
}

async fn drain(runtime: &mut Runtime<SimDriver, SimEnv>, driver: &SimDriver) {
    for _ in 0..100 {
        if !driver.has_pending() {
            break;
        }
        let _ = runtime.step().await;
    }
}

fn oldest_local(session: &ChatSession<SimEnv>) -> Option<(ConversationId, MessageId)> {
    let mut locals: Vec<(ConversationId, MessageId)> = session
        .store()
        .conversations()
        .flat_map(|c| c.messages.iter().filter(|m| m.delivery == Delivery::Pending))
        .map(|m| (m.conversation_id.clone(), m.id.clone()))
        .collect();
    locals.sort_by(|a, b| a.1.cmp(&b.1));
    locals.into_iter().next()
}

async fn apply(runtime: &mut Runtime<SimDriver, SimEnv>, driver: &SimDriver, env: &SimEnv, step: usize, op: &Op) {
    match op {
        Op::Send { conversation } => {
            driver.inject_command(Command::Send {
                conversation_id: conversation_id(*conversation),
                text: format!("offer {step}"),
            });
        },
        Op::Incoming { conversation, message } => {
            driver.inject_frame(InboundEvent::NewMessage {
                conversation_id: conversation_id(*conversation),
                message: peer_message(*conversation, *message),
                peer: Some(peer(*conversation)),
            });
        },
        Op::AckOldestLocal => {
            if let Some((conversation_id, client_ref)) = oldest_local(runtime.session()) {
                let message = Message {
                    id: MessageId::new(format!("ack-{step}")),
                    conversation_id,
                    sender_id: PeerId::from("me"),
                    text: String::new(),
                    sent_at: env.elapsed().as_millis() as u64,
                    read_at: None,
                    seq: Some(1_000 + step as u64),
                    client_ref: None,
                    delivery: Delivery::Sent,
                };
                driver.inject_frame(InboundEvent::MessageAck { client_ref, message, peer: None });
            }
        },
        Op::MarkRead { conversation } => {
            driver.inject_command(Command::MarkRead { conversation_id: conversation_id(*conversation), up_to: None });
        },
        Op::PeerRead { conversation, message } => {
            driver.inject_frame(InboundEvent::ReadReceipt {
                conversation_id: conversation_id(*conversation),
                message_id: MessageId::new(format!("m{message}")),
                reader_id: Some(peer(*conversation).id),
                read_at: Some(5),
            });
        },
        Op::DropConnection => driver.drop_connection("reset"),
        Op::Advance { millis } => {
            env.advance(Duration::from_millis(*millis));
            let _ = runtime.step().await;
        },
    }
    drain(runtime, driver).await;
}

proptest! {
    #[test]
    fn prop_runtime_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let executor = tokio::runtime::Builder::new_current_thread().build().unwrap();
        executor.block_on(async {
            let env = SimEnv::with_seed(11);
            let driver = SimDriver::new(env.clone()).with_last_chats(seed()).accepting_handshakes();
            let mut runtime = Runtime::new(driver.clone(), ChatSession::new(env.clone(), SessionConfig::default()));
            let registry = InvariantRegistry::standard();

            driver.inject_command(Command::Start(SessionIdentity::new(PeerProfile {
                id: PeerId::from("me"),
                name: "Me".into(),
                avatar: None,
            })));
            drain(&mut runtime, &driver).await;

            for (step, op) in ops.iter().enumerate() {
                apply(&mut runtime, &driver, &env, step, op).await;

                let snapshot = StoreSnapshot::from_store(runtime.session().store());
                registry.assert_all(&snapshot, &format!("step {step} ({op:?})"));

                // Every pending message is tracked for acknowledgement timeout
                let pending = snapshot
                    .conversations
                    .iter()
                    .flat_map(|c| &c.messages)
                    .filter(|m| m.delivery == Delivery::Pending)
                    .count();
                assert_eq!(pending, runtime.session().pending_sends(), "step {step} ({op:?})");
            }
        });
    }
}
