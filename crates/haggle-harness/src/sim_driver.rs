//! Simulation driver implementing the Driver trait.
//!
//! `SimDriver` stands in for the network: it records every request the
//! runtime makes and answers from a script (canned last-chats result, peer
//! profiles, whether handshakes are accepted). Tests inject realtime frames
//! and user commands from outside the runtime. It implements [`Driver`] so
//! the same [`haggle_app::Runtime`] orchestration runs in production and
//! simulation.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use haggle_app::{Command, Driver, DriverInput};
use haggle_client::{ChatSession, SessionEvent};
use haggle_core::{ConnectionError, Environment, FetchError};
use haggle_proto::{ChatSnapshot, ConversationId, Handshake, InboundEvent, OutboundFrame, PeerProfile};

use crate::{
    SimEnv, SimInstant,
    invariants::{InvariantRegistry, StoreSnapshot},
};

/// Error type for simulation driver.
#[derive(Debug, Clone)]
pub struct SimDriverError(pub String);

impl std::fmt::Display for SimDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimDriverError: {}", self.0)
    }
}

impl std::error::Error for SimDriverError {}

/// A request the runtime made, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverRequest {
    /// `GET /conversation/last-chats`.
    FetchLastChats {
        /// Session epoch.
        epoch: u64,
    },
    /// `GET /conversation/peer/{id}`.
    FetchPeer {
        /// Session epoch.
        epoch: u64,
        /// Shell conversation.
        conversation_id: ConversationId,
    },
    /// Realtime open with handshake.
    OpenRealtime {
        /// Session epoch.
        epoch: u64,
        /// Transport generation.
        generation: u64,
        /// Handshake sent.
        handshake: Handshake,
    },
    /// Realtime close.
    CloseRealtime {
        /// Session epoch.
        epoch: u64,
    },
}

/// Shared state for injection.
///
/// This allows injection from outside async contexts.
#[derive(Default)]
struct SharedState {
    inputs: VecDeque<DriverInput<SimInstant>>,
    requests: Vec<DriverRequest>,
    transmitted: Vec<OutboundFrame>,
    /// Epoch and generation of the open realtime transport.
    realtime: Option<(u64, u64)>,
    /// Epoch of the most recent open.
    last_epoch: u64,
    last_chats: Option<Result<Vec<ChatSnapshot>, FetchError>>,
    peers: HashMap<ConversationId, PeerProfile>,
    accept_handshake: bool,
    transmit_failures: VecDeque<String>,
    stopped: bool,
}

/// Simulation driver for deterministic testing.
///
/// Clones share state, so a test keeps one clone for injection and
/// inspection while the runtime owns another.
#[derive(Clone)]
pub struct SimDriver {
    state: Arc<Mutex<SharedState>>,
    env: SimEnv,
    invariants: Option<Arc<InvariantRegistry>>,
}

impl SimDriver {
    /// Driver reading time from `env`. Nothing is scripted: fetches stay
    /// pending and handshakes unanswered until a test injects results.
    pub fn new(env: SimEnv) -> Self {
        Self { state: Arc::new(Mutex::new(SharedState::default())), env, invariants: None }
    }

    /// Answer every last-chats fetch with `chats`.
    #[must_use]
    pub fn with_last_chats(self, chats: Vec<ChatSnapshot>) -> Self {
        self.lock().last_chats = Some(Ok(chats));
        self
    }

    /// Fail every last-chats fetch with `error`.
    #[must_use]
    pub fn with_last_chats_error(self, error: FetchError) -> Self {
        self.lock().last_chats = Some(Err(error));
        self
    }

    /// Answer peer fetches for `conversation_id` with `peer`. Unscripted
    /// conversations answer 404.
    #[must_use]
    pub fn with_peer(self, conversation_id: ConversationId, peer: PeerProfile) -> Self {
        self.lock().peers.insert(conversation_id, peer);
        self
    }

    /// Answer every handshake with `welcome`.
    #[must_use]
    pub fn accepting_handshakes(self) -> Self {
        self.lock().accept_handshake = true;
        self
    }

    /// Enable invariant checking.
    #[must_use]
    pub fn with_invariants(mut self, registry: InvariantRegistry) -> Self {
        self.invariants = Some(Arc::new(registry));
        self
    }

    /// Inject any input.
    pub fn inject(&self, input: impl Into<DriverInput<SimInstant>>) {
        self.lock().inputs.push_back(input.into());
    }

    /// Inject a user command.
    pub fn inject_command(&self, command: Command) {
        self.inject(command);
    }

    /// Inject a realtime frame on the most recently opened transport.
    ///
    /// Frames injected while the transport is closed are dropped, as a real
    /// socket would.
    pub fn inject_frame(&self, event: InboundEvent) {
        let mut state = self.lock();
        let Some((epoch, generation)) = state.realtime else {
            tracing::debug!("dropping frame injected while realtime is closed");
            return;
        };
        state.inputs.push_back(DriverInput::Session(SessionEvent::FrameReceived { epoch, generation, event }));
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.lock();
        if let Some((epoch, generation)) = state.realtime.take() {
            let error = ConnectionError::Transport(reason.to_string());
            state.inputs.push_back(DriverInput::Session(SessionEvent::TransportFailed { epoch, generation, error }));
        }
    }

    /// Make the next transmit fail with `reason`.
    pub fn fail_next_transmit(&self, reason: &str) {
        self.lock().transmit_failures.push_back(reason.to_string());
    }

    /// Take all recorded requests.
    pub fn take_requests(&self) -> Vec<DriverRequest> {
        std::mem::take(&mut self.lock().requests)
    }

    /// Take all transmitted frames.
    pub fn take_transmitted(&self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.lock().transmitted)
    }

    /// Whether a realtime transport is open.
    pub fn is_realtime_open(&self) -> bool {
        self.lock().realtime.is_some()
    }

    /// Epoch of the most recent realtime open.
    pub fn last_epoch(&self) -> u64 {
        self.lock().last_epoch
    }

    /// Check if there are pending inputs to process.
    pub fn has_pending(&self) -> bool {
        !self.lock().inputs.is_empty()
    }

    /// Whether [`Driver::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Check invariants against the session's store.
    pub fn check_invariants(&self, session: &ChatSession<SimEnv>, context: &str) {
        if let Some(registry) = &self.invariants {
            registry.assert_all(&StoreSnapshot::from_store(session.store()), context);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Driver for SimDriver {
    type Error = SimDriverError;
    type Instant = SimInstant;

    async fn poll_input(&mut self) -> Result<Option<DriverInput<SimInstant>>, Self::Error> {
        Ok(self.lock().inputs.pop_front())
    }

    fn fetch_last_chats(&mut self, epoch: u64) {
        let mut state = self.lock();
        state.requests.push(DriverRequest::FetchLastChats { epoch });
        if let Some(result) = state.last_chats.clone() {
            state.inputs.push_back(DriverInput::Session(SessionEvent::LastChatsFetched { epoch, result }));
        }
    }

    fn fetch_peer(&mut self, epoch: u64, conversation_id: ConversationId) {
        let mut state = self.lock();
        state.requests.push(DriverRequest::FetchPeer { epoch, conversation_id: conversation_id.clone() });
        let result = state.peers.get(&conversation_id).cloned().ok_or(FetchError::Http { status: 404 });
        state.inputs.push_back(DriverInput::Session(SessionEvent::PeerFetched { epoch, conversation_id, result }));
    }

    fn open_realtime(&mut self, epoch: u64, generation: u64, handshake: Handshake) {
        let mut state = self.lock();
        state.requests.push(DriverRequest::OpenRealtime { epoch, generation, handshake });
        state.realtime = Some((epoch, generation));
        state.last_epoch = epoch;
        if state.accept_handshake {
            let event = InboundEvent::Welcome { session_id: format!("sim-{epoch}-{generation}") };
            state.inputs.push_back(DriverInput::Session(SessionEvent::FrameReceived { epoch, generation, event }));
        }
    }

    fn close_realtime(&mut self, epoch: u64) {
        let mut state = self.lock();
        state.requests.push(DriverRequest::CloseRealtime { epoch });
        state.realtime = None;
    }

    async fn transmit(&mut self, _epoch: u64, frame: OutboundFrame) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if let Some(reason) = state.transmit_failures.pop_front() {
            return Err(SimDriverError(reason));
        }
        if state.realtime.is_none() {
            return Err(SimDriverError("realtime transport closed".into()));
        }
        state.transmitted.push(frame);
        Ok(())
    }

    fn now(&self) -> SimInstant {
        self.env.now()
    }

    fn stop(&mut self) {
        let mut state = self.lock();
        state.stopped = true;
        state.realtime = None;
    }
}
