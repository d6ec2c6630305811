//! Chat session facade.
//!
//! The boundary screens use: start and stop a session, send messages, mark
//! conversations read, and subscribe to store slices. Owns the realtime
//! connection manager and the reconciliation engine for one authenticated
//! user and wires the former into the latter.
//!
//! # Lifecycle
//!
//! ```text
//! start(identity) ──> FetchLastChats ─┐  (race; reconciliation makes
//!                 └─> OpenRealtime ───┘   the order irrelevant)
//! stop()          ──> Goodbye (if connected), CloseRealtime,
//!                     store cleared, epoch bumped
//! ```
//!
//! Results from a previous epoch are ignored, so a fetch that resolves after
//! `stop()` never touches the next session's state. Transport events also
//! carry the generation of the open that produced them; anything from a
//! replaced transport is dropped even within the same epoch.

use std::{collections::HashMap, time::Duration};

use haggle_core::{
    ActiveChat, ChatList, ConnectionAction, ConnectionConfig, ConnectionError, ConnectionState,
    Conversation, DeliveryUpdate, Environment, RealtimeConnection, ReconcileConfig,
    ReconciliationEngine, SendFailure, Subscription,
};
use haggle_proto::{
    ConversationId, Delivery, EventKind, Handshake, Message, MessageId, OutboundFrame, PeerId,
    PeerProfile,
};
use tokio::sync::watch;

use crate::{SessionAction, SessionError, SessionEvent};

/// Time a sent message may wait for its acknowledgement before it is marked
/// failed.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Event kinds routed into the reconciliation engine.
const ROUTED_KINDS: [EventKind; 6] = [
    EventKind::NewMessage,
    EventKind::ReadReceipt,
    EventKind::Presence,
    EventKind::ConversationCreated,
    EventKind::MessageAck,
    EventKind::SendRejected,
];

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Realtime connection settings.
    pub connection: ConnectionConfig,
    /// Reconciliation settings.
    pub reconcile: ReconcileConfig,
    /// Acknowledgement timeout for sent messages.
    pub ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reconcile: ReconcileConfig::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Authenticated user, as supplied by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Profile of the session user. Its id is `selfId` for unread counts.
    pub profile: PeerProfile,
    /// Bearer token for REST and the realtime handshake.
    pub token: Option<String>,
}

impl SessionIdentity {
    /// Identity without a token.
    pub fn new(profile: PeerProfile) -> Self {
        Self { profile, token: None }
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// A store slice returned by [`ChatSession::observe`].
///
/// Lazy and restartable: values are pushed on every relevant mutation while
/// the receiver lives; observing again starts from current state.
#[derive(Debug)]
pub enum Observer {
    /// One conversation (chat window). `None` while unknown.
    Conversation(watch::Receiver<Option<Conversation>>),
    /// Chat list and unread badge.
    Chats(watch::Receiver<ChatList>),
}

/// Chat session state machine.
///
/// Follows the action pattern: methods mutate state and return
/// [`SessionAction`]s; the caller performs the I/O and feeds results back as
/// [`SessionEvent`]s.
pub struct ChatSession<E: Environment> {
    env: E,
    config: SessionConfig,
    identity: Option<SessionIdentity>,
    /// Bumped on every start and stop.
    epoch: u64,
    /// Bumped on every transport open.
    generation: u64,
    connection: RealtimeConnection<ReconciliationEngine, E::Instant>,
    engine: ReconciliationEngine,
    subscriptions: Vec<Subscription>,
    /// Sent messages awaiting acknowledgement, by local id.
    pending_sends: HashMap<MessageId, E::Instant>,
    connection_state: watch::Sender<ConnectionState>,
    last_error: Option<SessionError>,
    local_sequence: u64,
}

impl<E: Environment> ChatSession<E> {
    /// Idle session. Nothing connects until [`Self::start`].
    pub fn new(env: E, config: SessionConfig) -> Self {
        let connection = RealtimeConnection::new(config.connection.clone());
        let engine = ReconciliationEngine::new(PeerId::default(), config.reconcile.clone());
        Self {
            env,
            config,
            identity: None,
            epoch: 0,
            generation: 0,
            connection,
            engine,
            subscriptions: Vec::new(),
            pending_sends: HashMap::new(),
            connection_state: watch::channel(ConnectionState::Disconnected).0,
            last_error: None,
            local_sequence: 0,
        }
    }

    /// Start a session: fetch recent chats and open the realtime connection.
    ///
    /// Without a profile the session stays idle and returns
    /// [`ConnectionError::NoProfile`]. Starting again as the same user is a
    /// no-op unless the connection failed permanently; as a different user it
    /// stops the current session first.
    pub fn start(&mut self, identity: Option<SessionIdentity>) -> Result<Vec<SessionAction>, SessionError> {
        let Some(identity) = identity else {
            tracing::warn!("no authenticated profile, chat stays idle");
            return Err(ConnectionError::NoProfile.into());
        };
        let same_user = self.identity.as_ref().is_some_and(|current| current.profile.id == identity.profile.id);
        if same_user && self.connection.state() != ConnectionState::Disconnected {
            tracing::debug!(user = %identity.profile.id, "session already running");
            return Ok(Vec::new());
        }

        let mut actions = self.stop();
        self.epoch += 1;
        self.engine.reset(identity.profile.id.clone());
        self.engine.advance_clock(self.env.wall_clock_millis());
        self.last_error = None;

        for kind in ROUTED_KINDS {
            let subscription =
                self.connection.on(kind, |engine: &mut ReconciliationEngine, event| engine.ingest(event));
            self.subscriptions.push(subscription);
        }

        tracing::info!(user = %identity.profile.id, epoch = self.epoch, "chat session starting");
        let handshake = Handshake { profile: identity.profile.clone(), token: identity.token.clone() };
        self.identity = Some(identity);

        actions.push(SessionAction::FetchLastChats { epoch: self.epoch });
        let connect = self.connection.connect(handshake, self.env.now());
        actions.extend(self.translate(connect));
        Ok(actions)
    }

    /// Stop the session: say goodbye, disconnect, unsubscribe handlers,
    /// clear state.
    ///
    /// In-flight results are ignored when they arrive. Safe to call when idle.
    pub fn stop(&mut self) -> Vec<SessionAction> {
        if self.identity.is_none() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.is_connected() {
            actions.push(SessionAction::Transmit { epoch: self.epoch, frame: OutboundFrame::Goodbye });
        }
        let disconnect = self.connection.disconnect();
        actions.extend(self.translate(disconnect));
        for subscription in self.subscriptions.drain(..) {
            self.connection.off(subscription);
        }

        self.engine.reset(PeerId::default());
        self.pending_sends.clear();
        self.identity = None;
        self.last_error = None;
        self.epoch += 1;
        tracing::info!(epoch = self.epoch, "chat session stopped");
        actions
    }

    /// Process a driver event.
    pub fn handle(&mut self, event: SessionEvent<E::Instant>) -> Vec<SessionAction> {
        if let Some(epoch) = event.epoch() {
            if epoch != self.epoch || self.identity.is_none() {
                tracing::debug!(epoch, current = self.epoch, "ignoring result from previous session");
                return Vec::new();
            }
        }
        if let Some(generation) = event.generation() {
            if generation != self.generation {
                tracing::debug!(generation, current = self.generation, "ignoring event from replaced transport");
                return Vec::new();
            }
        }

        match event {
            SessionEvent::LastChatsFetched { result, .. } => {
                self.engine.advance_clock(self.env.wall_clock_millis());
                match result {
                    Ok(chats) => self.engine.apply_snapshot(chats),
                    Err(error) => {
                        tracing::warn!(%error, "last chats fetch failed");
                        self.last_error = Some(error.into());
                        self.engine.snapshot_failed();
                    },
                }
                self.drain_engine()
            },

            SessionEvent::PeerFetched { conversation_id, result, .. } => {
                match result {
                    Ok(peer) => self.engine.apply_enrichment(&conversation_id, peer),
                    Err(error) => {
                        tracing::debug!(%error, "peer fetch failed");
                        self.engine.enrichment_failed(&conversation_id);
                    },
                }
                self.drain_engine()
            },

            SessionEvent::TransportFailed { error, .. } => {
                if !self.connection.is_transport_open() {
                    tracing::debug!(%error, "failure from a transport already closed");
                    return Vec::new();
                }
                let actions = self.connection.transport_failed(error, self.env.now());
                self.translate(actions)
            },

            SessionEvent::FrameReceived { event, .. } => {
                self.engine.advance_clock(self.env.wall_clock_millis());
                let actions = self.connection.receive(&event, &mut self.engine);
                let mut out = self.translate(actions);
                out.extend(self.drain_engine());
                out
            },

            SessionEvent::TransmitFailed { client_ref, reason, .. } => {
                tracing::warn!(%reason, "transmit failed");
                if let Some(client_ref) = client_ref {
                    self.pending_sends.remove(&client_ref);
                    self.engine.store_mut().fail_local(&client_ref);
                }
                self.last_error = Some(SendFailure::Transport(reason).into());
                Vec::new()
            },

            SessionEvent::Tick { now } => {
                if self.identity.is_none() {
                    return Vec::new();
                }
                self.expire_pending_sends(now);
                let actions = self.connection.tick(now);
                self.translate(actions)
            },
        }
    }

    /// Send `text` to a conversation.
    ///
    /// The message is appended optimistically under a local id. Connected, it
    /// is transmitted and stays [`Delivery::Pending`] until acknowledged.
    /// Otherwise it is stored [`Delivery::Failed`] and not transmitted until
    /// [`Self::retry_message`].
    pub fn send_message(
        &mut self,
        conversation_id: &ConversationId,
        text: impl Into<String>,
    ) -> Result<(MessageId, Vec<SessionAction>), SessionError> {
        let sender_id = self.require_started()?.profile.id.clone();
        let text = text.into();
        let conversation = self
            .engine
            .store()
            .select(conversation_id)
            .ok_or_else(|| SessionError::UnknownConversation(conversation_id.clone()))?;
        let canonical = conversation.id.clone();
        let connected = self.is_connected();

        let local_id = self.next_local_id();
        let message = Message {
            id: local_id.clone(),
            conversation_id: canonical.clone(),
            sender_id,
            text: text.clone(),
            sent_at: self.env.wall_clock_millis(),
            read_at: None,
            seq: None,
            client_ref: None,
            delivery: if connected { Delivery::Pending } else { Delivery::Failed },
        };
        self.engine
            .store_mut()
            .insert_local(message)
            .map_err(|_| SessionError::UnknownConversation(canonical.clone()))?;

        if !connected {
            tracing::warn!(conversation = %canonical, "not connected, message stored as failed");
            self.last_error = Some(SendFailure::NotConnected.into());
            return Ok((local_id, Vec::new()));
        }

        let actions = self.transmit_send(&canonical, local_id.clone(), text);
        Ok((local_id, actions))
    }

    /// Retransmit a failed message under its original local id.
    ///
    /// Requires a live connection; otherwise the message stays failed.
    pub fn retry_message(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.require_started()?;
        let conversation = self
            .engine
            .store()
            .select(conversation_id)
            .ok_or_else(|| SessionError::UnknownConversation(conversation_id.clone()))?;
        let canonical = conversation.id.clone();
        let text = conversation
            .messages
            .iter()
            .find(|m| &m.id == message_id && m.delivery == Delivery::Failed)
            .map(|m| m.text.clone())
            .ok_or_else(|| SendFailure::UnknownMessage(message_id.clone()))?;

        if !self.is_connected() {
            return Err(SendFailure::NotConnected.into());
        }

        self.engine
            .store_mut()
            .set_delivery(&canonical, message_id, Delivery::Pending)
            .map_err(|_| SendFailure::UnknownMessage(message_id.clone()))?;
        tracing::debug!(message = %message_id, "retrying send");
        Ok(self.transmit_send(&canonical, message_id.clone(), text))
    }

    /// Mark a conversation read up to `up_to` (default: its latest server
    /// message). Applied locally, then reported to the server when connected.
    pub fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        up_to: Option<&MessageId>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.require_started()?;
        let conversation = self
            .engine
            .store()
            .select(conversation_id)
            .ok_or_else(|| SessionError::UnknownConversation(conversation_id.clone()))?;

        let target = match up_to {
            Some(id) => id.clone(),
            None => match conversation.messages.iter().rev().find(|m| !m.is_local()) {
                Some(latest) => latest.id.clone(),
                None => return Ok(Vec::new()),
            },
        };
        let canonical = conversation.id.clone();
        let server_known = !conversation.is_provisional()
            && conversation.messages.iter().any(|m| m.id == target && !m.is_local());

        let read_at = self.env.wall_clock_millis();
        let changed = self.engine.store_mut().mark_read(&canonical, &target, read_at).map_err(|_| {
            SessionError::UnknownMessage { conversation_id: canonical.clone(), message_id: target.clone() }
        })?;

        if !changed || !server_known || !self.is_connected() {
            return Ok(Vec::new());
        }
        Ok(vec![SessionAction::Transmit {
            epoch: self.epoch,
            frame: OutboundFrame::MarkRead { conversation_id: canonical, message_id: target },
        }])
    }

    /// Navigate into conversation `id` with `peer` (navigation parameters).
    /// Creates it if the store has not seen it. Returns the canonical id.
    pub fn open_conversation(
        &mut self,
        conversation_id: &ConversationId,
        peer: PeerProfile,
    ) -> Result<ConversationId, SessionError> {
        self.require_started()?;
        Ok(self.engine.store_mut().ensure_conversation(conversation_id, peer))
    }

    /// Navigate into the thread with `peer`, creating a provisional one when
    /// none exists yet. The first send creates it server-side.
    pub fn open_with_peer(&mut self, peer: PeerProfile) -> Result<ConversationId, SessionError> {
        self.require_started()?;
        Ok(self.engine.store_mut().ensure_for_peer(peer))
    }

    /// Subscribe to one conversation, or to the chat list when `None`.
    pub fn observe(&mut self, conversation_id: Option<&ConversationId>) -> Observer {
        match conversation_id {
            Some(id) => Observer::Conversation(self.engine.store_mut().observe_conversation(id)),
            None => Observer::Chats(self.engine.store().observe_chats()),
        }
    }

    /// Subscribe to connection state, for "reconnecting" indicators.
    pub fn observe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    /// Conversation `id`.
    pub fn select(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.engine.store().select(conversation_id)
    }

    /// Active chats, most recent first.
    pub fn select_active_chats(&self) -> Vec<ActiveChat> {
        self.engine.store().select_active_chats()
    }

    /// Badge value.
    pub fn total_unread(&self) -> u32 {
        self.engine.store().total_unread()
    }

    /// Whether `peer` is online.
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.engine.store().is_online(peer)
    }

    /// The store, read-only.
    pub fn store(&self) -> &haggle_core::ConversationStore {
        self.engine.store()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Most recent asynchronous failure.
    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Generation of the most recently opened transport.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The session user, while started.
    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    /// Sent messages awaiting acknowledgement.
    pub fn pending_sends(&self) -> usize {
        self.pending_sends.len()
    }

    fn require_started(&self) -> Result<&SessionIdentity, SessionError> {
        self.identity.as_ref().ok_or(SessionError::NotStarted)
    }

    fn is_connected(&self) -> bool {
        self.connection.state() == ConnectionState::Connected
    }

    fn next_local_id(&mut self) -> MessageId {
        self.local_sequence += 1;
        let nonce = self.env.random_u64() & 0xffff_ffff;
        MessageId::new(format!("local-{:06}-{nonce:08x}", self.local_sequence))
    }

    fn transmit_send(&mut self, conversation_id: &ConversationId, client_ref: MessageId, text: String) -> Vec<SessionAction> {
        let Some(conversation) = self.engine.store().select(conversation_id) else {
            return Vec::new();
        };
        let frame = if conversation.is_provisional() {
            OutboundFrame::SendMessage {
                conversation_id: None,
                peer_id: Some(conversation.peer.id.clone()),
                client_ref: client_ref.clone(),
                text,
            }
        } else {
            OutboundFrame::SendMessage {
                conversation_id: Some(conversation.id.clone()),
                peer_id: None,
                client_ref: client_ref.clone(),
                text,
            }
        };

        self.pending_sends.insert(client_ref, self.env.now());
        vec![SessionAction::Transmit { epoch: self.epoch, frame }]
    }

    fn expire_pending_sends(&mut self, now: E::Instant) {
        let timeout = self.config.ack_timeout;
        let expired: Vec<MessageId> = self
            .pending_sends
            .iter()
            .filter(|&(_, &since)| now - since >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for client_ref in expired {
            self.pending_sends.remove(&client_ref);
            if self.engine.store_mut().fail_local(&client_ref) {
                tracing::warn!(%client_ref, ?timeout, "no acknowledgement, message failed");
            }
            self.last_error = Some(SendFailure::AckTimeout(timeout).into());
        }
    }

    /// Collect follow-up work produced by the engine.
    fn drain_engine(&mut self) -> Vec<SessionAction> {
        for update in self.engine.take_delivery_updates() {
            match update {
                DeliveryUpdate::Acknowledged { client_ref, .. } => {
                    self.pending_sends.remove(&client_ref);
                },
                DeliveryUpdate::Rejected { client_ref, reason } => {
                    self.pending_sends.remove(&client_ref);
                    self.last_error = Some(SendFailure::Rejected(reason).into());
                },
            }
        }

        let epoch = self.epoch;
        self.engine
            .take_enrichment_requests()
            .into_iter()
            .map(|conversation_id| SessionAction::FetchPeer { epoch, conversation_id })
            .collect()
    }

    fn translate(&mut self, actions: Vec<ConnectionAction>) -> Vec<SessionAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                ConnectionAction::Open { handshake } => {
                    self.generation += 1;
                    out.push(SessionAction::OpenRealtime { epoch: self.epoch, generation: self.generation, handshake });
                },
                ConnectionAction::Close => out.push(SessionAction::CloseRealtime { epoch: self.epoch }),
                ConnectionAction::RetryScheduled { .. } => {},
                ConnectionAction::StateChanged(state) => {
                    self.connection_state.send_replace(state);
                },
                ConnectionAction::Failed(error) => {
                    self.last_error = Some(error.into());
                },
            }
        }
        out
    }
}
