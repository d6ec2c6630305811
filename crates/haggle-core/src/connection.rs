//! Realtime connection lifecycle.
//!
//! Owns the single persistent connection of an authenticated session: open,
//! handshake, reconnection with capped exponential backoff, teardown, and
//! dispatch of pushed events to registered handlers. Uses the action pattern:
//! methods take time as input and return actions for the driver to execute,
//! so the state machine does no I/O and timers are plain data.
//!
//! # State Machine
//!
//! ```text
//!                 connect            Welcome
//! ┌──────────────┐ ───> ┌────────────┐ ───> ┌───────────┐
//! │ Disconnected │      │ Connecting │      │ Connected │
//! └──────────────┘ <─┐  └────────────┘      └───────────┘
//!        ^           │        │ transient failure  │ transient failure
//!        │           │        v                    v
//!        │           │  ┌──────────────┐ <─────────┘
//!        │           └──│ Reconnecting │ ── tick past backoff ──> reopen
//!        │  disconnect  └──────────────┘
//!        └── Unauthorized / retries exhausted (terminal)
//! ```
//!
//! # Invariants
//!
//! - At most one transport is open: [`ConnectionAction::Open`] is only emitted
//!   while no transport is open.
//! - After [`RealtimeConnection::disconnect`] no retry fires. The pending
//!   retry is state owned here, not a detached timer.
//! - Handlers survive reconnects and run in registration order.

use std::{
    fmt,
    ops::Sub,
    time::{Duration, Instant},
};

use haggle_proto::{EventKind, Handshake, InboundEvent};

use crate::error::ConnectionError;

/// Time allowed to complete the hello/welcome handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the first reconnection attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Upper bound on the delay between reconnection attempts.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Connection state as observed by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport, no pending retry.
    #[default]
    Disconnected,
    /// First connection of the session in progress.
    Connecting,
    /// Handshake complete, events flowing.
    Connected,
    /// Connection lost; a retry is scheduled or in progress.
    Reconnecting,
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Timeout for completing the handshake.
    pub handshake_timeout: Duration,
    /// Delay before the first retry. Doubles per attempt.
    pub backoff_base: Duration,
    /// Cap on the retry delay.
    pub backoff_max: Duration,
    /// Give up after this many consecutive failed attempts. `None` retries
    /// indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_attempts: None,
        }
    }
}

impl ConnectionConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exponent).min(self.backoff_max)
    }
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open the transport and send this handshake.
    Open {
        /// Identity of the session user.
        handshake: Handshake,
    },

    /// Tear down the transport.
    Close,

    /// A retry was scheduled. Informational; [`RealtimeConnection::tick`]
    /// fires it.
    RetryScheduled {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },

    /// Observable state changed.
    StateChanged(ConnectionState),

    /// Terminal failure. No retry follows.
    Failed(ConnectionError),
}

/// Handle returned by [`RealtimeConnection::on`]; pass it to
/// [`RealtimeConnection::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
}

impl Subscription {
    /// Event kind this subscription receives.
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

type Handler<C> = Box<dyn FnMut(&mut C, &InboundEvent) + Send>;

struct Registration<C> {
    subscription: Subscription,
    handler: Handler<C>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRetry<I> {
    since: I,
    delay: Duration,
}

/// Realtime connection manager.
///
/// Generic over the handler context `C` (the component handlers mutate, passed
/// in at dispatch time so handlers never capture shared state) and over
/// `Instant` so simulation can drive virtual time.
pub struct RealtimeConnection<C, I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: ConnectionState,
    config: ConnectionConfig,
    /// Identity used for every (re)open. `None` when torn down.
    handshake: Option<Handshake>,
    transport_open: bool,
    /// Set while a handshake is outstanding.
    awaiting_since: Option<I>,
    /// Consecutive failed attempts since the last successful handshake.
    attempt: u32,
    retry: Option<PendingRetry<I>>,
    last_error: Option<ConnectionError>,
    handlers: Vec<Registration<C>>,
    next_subscription: u64,
}

impl<C, I> fmt::Debug for RealtimeConnection<C, I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeConnection")
            .field("state", &self.state)
            .field("transport_open", &self.transport_open)
            .field("attempt", &self.attempt)
            .field("retry_pending", &self.retry.is_some())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl<C, I> RealtimeConnection<C, I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a manager in [`ConnectionState::Disconnected`].
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            handshake: None,
            transport_open: false,
            awaiting_since: None,
            attempt: 0,
            retry: None,
            last_error: None,
            handlers: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the driver currently holds an open transport.
    pub fn is_transport_open(&self) -> bool {
        self.transport_open
    }

    /// Consecutive failed attempts since the last successful handshake.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a reconnection is scheduled but has not fired yet.
    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    /// Most recent failure. Cleared by a fresh [`Self::connect`].
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Start connecting as `handshake.profile`.
    ///
    /// No-op unless [`ConnectionState::Disconnected`]: an active or retrying
    /// connection is never duplicated.
    pub fn connect(&mut self, handshake: Handshake, now: I) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Disconnected {
            tracing::debug!(state = ?self.state, "connect ignored, connection already active");
            return Vec::new();
        }

        self.handshake = Some(handshake);
        self.attempt = 0;
        self.last_error = None;

        let mut actions = Vec::new();
        self.transition(ConnectionState::Connecting, &mut actions);
        actions.extend(self.open(now));
        actions
    }

    /// Tear down the connection and cancel any pending retry.
    ///
    /// Safe to call repeatedly; later calls return no actions.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Disconnected
            && !self.transport_open
            && self.retry.is_none()
        {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.transport_open {
            actions.push(ConnectionAction::Close);
        }
        self.transport_open = false;
        self.awaiting_since = None;
        self.retry = None;
        self.handshake = None;
        self.attempt = 0;
        self.transition(ConnectionState::Disconnected, &mut actions);
        actions
    }

    /// Process a frame pushed by the server.
    ///
    /// Handshake frames drive the state machine; everything else goes to the
    /// handlers registered for its kind, once the current transport's
    /// handshake has completed. Events arriving earlier are dropped.
    pub fn receive(&mut self, event: &InboundEvent, ctx: &mut C) -> Vec<ConnectionAction> {
        match event {
            InboundEvent::Welcome { session_id } => self.handshake_accepted(session_id),
            InboundEvent::Unauthorized { reason } => {
                self.fail_terminal(ConnectionError::Unauthorized { reason: reason.clone() })
            },
            _ => {
                if !self.transport_open {
                    tracing::debug!(kind = ?event.kind(), "dropping event from closed transport");
                } else if self.awaiting_since.is_some() {
                    tracing::debug!(kind = ?event.kind(), "dropping event received before welcome");
                } else {
                    self.dispatch(event, ctx);
                }
                Vec::new()
            },
        }
    }

    /// The transport failed (open refused, socket dropped, frame undecodable).
    ///
    /// Transient errors schedule a retry with backoff; terminal errors end the
    /// connection.
    pub fn transport_failed(&mut self, error: ConnectionError, now: I) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Disconnected {
            tracing::debug!(%error, "ignoring transport failure after disconnect");
            return Vec::new();
        }
        if !error.is_transient() {
            return self.fail_terminal(error);
        }

        let mut actions = Vec::new();
        if self.transport_open {
            actions.push(ConnectionAction::Close);
        }
        self.transport_open = false;
        self.awaiting_since = None;
        self.attempt += 1;

        if let Some(max) = self.config.max_attempts {
            if self.attempt > max {
                actions.extend(self.fail_terminal(ConnectionError::RetriesExhausted { attempts: max }));
                return actions;
            }
        }

        let attempt = self.attempt;
        let delay = self.config.backoff(attempt);
        tracing::info!(%error, attempt, ?delay, "connection lost, retry scheduled");

        self.retry = Some(PendingRetry { since: now, delay });
        self.last_error = Some(error);
        self.transition(ConnectionState::Reconnecting, &mut actions);
        actions.push(ConnectionAction::RetryScheduled { attempt, delay });
        actions
    }

    /// Advance time: expire a stalled handshake or fire a due retry.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        if let Some(since) = self.awaiting_since {
            let elapsed = now - since;
            if elapsed >= self.config.handshake_timeout {
                return self.transport_failed(ConnectionError::HandshakeTimeout { elapsed }, now);
            }
            return Vec::new();
        }

        match self.retry {
            Some(retry)
                if self.state == ConnectionState::Reconnecting && now - retry.since >= retry.delay =>
            {
                self.retry = None;
                tracing::debug!(attempt = self.attempt, "reconnecting");
                self.open(now)
            },
            _ => Vec::new(),
        }
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Handlers persist across reconnects. Multiple handlers per kind run in
    /// registration order.
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> Subscription
    where
        F: FnMut(&mut C, &InboundEvent) + Send + 'static,
    {
        let subscription = Subscription { id: self.next_subscription, kind };
        self.next_subscription += 1;
        self.handlers.push(Registration { subscription, handler: Box::new(handler) });
        subscription
    }

    /// Remove a handler. Returns `false` if it was already removed.
    pub fn off(&mut self, subscription: Subscription) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|r| r.subscription != subscription);
        self.handlers.len() != before
    }

    fn dispatch(&mut self, event: &InboundEvent, ctx: &mut C) {
        let Some(kind) = event.kind() else {
            return;
        };
        for registration in self.handlers.iter_mut().filter(|r| r.subscription.kind == kind) {
            (registration.handler)(ctx, event);
        }
    }

    fn open(&mut self, now: I) -> Vec<ConnectionAction> {
        debug_assert!(!self.transport_open, "invariant: one transport per session");

        let Some(handshake) = self.handshake.clone() else {
            return Vec::new();
        };
        self.transport_open = true;
        self.awaiting_since = Some(now);
        vec![ConnectionAction::Open { handshake }]
    }

    fn handshake_accepted(&mut self, session_id: &str) -> Vec<ConnectionAction> {
        if self.awaiting_since.is_none() {
            tracing::debug!(session_id, "ignoring unsolicited welcome");
            return Vec::new();
        }

        tracing::info!(session_id, "realtime session established");
        self.awaiting_since = None;
        self.attempt = 0;

        let mut actions = Vec::new();
        self.transition(ConnectionState::Connected, &mut actions);
        actions
    }

    fn fail_terminal(&mut self, error: ConnectionError) -> Vec<ConnectionAction> {
        tracing::warn!(%error, "connection failed permanently");

        let mut actions = Vec::new();
        if self.transport_open {
            actions.push(ConnectionAction::Close);
        }
        self.transport_open = false;
        self.awaiting_since = None;
        self.retry = None;
        self.handshake = None;
        self.last_error = Some(error.clone());
        self.transition(ConnectionState::Disconnected, &mut actions);
        actions.push(ConnectionAction::Failed(error));
        actions
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "connection state");
            self.state = next;
            actions.push(ConnectionAction::StateChanged(next));
        }
    }
}
