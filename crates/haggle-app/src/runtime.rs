//! Generic runtime for session orchestration.
//!
//! The Runtime drives the event loop, coordinating between:
//! - [`ChatSession`]: session state machine
//! - [`Driver`]: Platform-specific I/O

use haggle_client::{ChatSession, SessionAction, SessionEvent};
use haggle_core::Environment;
use haggle_proto::OutboundFrame;

use crate::{Command, Driver, DriverInput, RuntimeError};

/// Generic runtime that orchestrates a [`ChatSession`] and a [`Driver`].
///
/// # Type Parameters
///
/// - `D`: Platform-specific I/O driver
/// - `E`: Environment for time and randomness
pub struct Runtime<D, E>
where
    D: Driver,
    E: Environment,
{
    driver: D,
    session: ChatSession<E>,
}

impl<D, E> Runtime<D, E>
where
    D: Driver<Instant = E::Instant>,
    E: Environment,
{
    /// Create a runtime. The session stays idle until a
    /// [`Command::Start`] arrives.
    pub fn new(driver: D, session: ChatSession<E>) -> Self {
        Self { driver, session }
    }

    /// Run the main event loop until [`Command::Quit`].
    ///
    /// Each cycle polls the driver for one input, processes it, then ticks
    /// the session so timeouts and reconnection backoff advance.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails to produce input.
    pub async fn run(mut self) -> Result<(), RuntimeError<D::Error>> {
        loop {
            if self.step().await? {
                break;
            }
        }

        let actions = self.session.stop();
        self.process_actions(actions).await;
        self.driver.stop();
        Ok(())
    }

    /// Process one cycle of the event loop.
    ///
    /// Returns `true` if the runtime should quit.
    pub async fn step(&mut self) -> Result<bool, RuntimeError<D::Error>> {
        let input = self.driver.poll_input().await.map_err(RuntimeError::Driver)?;
        if let Some(input) = input {
            let actions = match input {
                DriverInput::Session(event) => self.session.handle(event),
                DriverInput::Command(Command::Quit) => return Ok(true),
                DriverInput::Command(command) => self.execute(command),
            };
            self.process_actions(actions).await;
        }

        let now = self.driver.now();
        let actions = self.session.handle(SessionEvent::Tick { now });
        self.process_actions(actions).await;
        Ok(false)
    }

    /// Apply a user command. Failures are logged and recorded on the session.
    fn execute(&mut self, command: Command) -> Vec<SessionAction> {
        let result = match command {
            Command::Start(identity) => self.session.start(Some(identity)),
            Command::Stop => Ok(self.session.stop()),
            Command::Open { conversation_id, peer } => {
                self.session.open_conversation(&conversation_id, peer).map(|id| {
                    tracing::debug!(conversation = %id, "opened conversation");
                    Vec::new()
                })
            },
            Command::OpenWithPeer(peer) => self.session.open_with_peer(peer).map(|id| {
                tracing::debug!(conversation = %id, "opened conversation with peer");
                Vec::new()
            }),
            Command::Send { conversation_id, text } => {
                self.session.send_message(&conversation_id, text).map(|(_, actions)| actions)
            },
            Command::Retry { conversation_id, message_id } => {
                self.session.retry_message(&conversation_id, &message_id)
            },
            Command::MarkRead { conversation_id, up_to } => {
                self.session.mark_read(&conversation_id, up_to.as_ref())
            },
            Command::Quit => Ok(Vec::new()),
        };

        result.unwrap_or_else(|error| {
            tracing::warn!(%error, "command failed");
            Vec::new()
        })
    }

    /// Execute session actions against the driver.
    ///
    /// A failed transmit is fed back to the session, which may produce more
    /// actions.
    async fn process_actions(&mut self, initial_actions: Vec<SessionAction>) {
        let mut pending_actions = initial_actions;

        while !pending_actions.is_empty() {
            let actions = std::mem::take(&mut pending_actions);

            for action in actions {
                match action {
                    SessionAction::FetchLastChats { epoch } => self.driver.fetch_last_chats(epoch),
                    SessionAction::FetchPeer { epoch, conversation_id } => {
                        self.driver.fetch_peer(epoch, conversation_id);
                    },
                    SessionAction::OpenRealtime { epoch, generation, handshake } => {
                        self.driver.open_realtime(epoch, generation, handshake);
                    },
                    SessionAction::CloseRealtime { epoch } => self.driver.close_realtime(epoch),
                    SessionAction::Transmit { epoch, frame } => {
                        let client_ref = match &frame {
                            OutboundFrame::SendMessage { client_ref, .. } => Some(client_ref.clone()),
                            _ => None,
                        };
                        if let Err(error) = self.driver.transmit(epoch, frame).await {
                            let event =
                                SessionEvent::TransmitFailed { epoch, client_ref, reason: error.to_string() };
                            pending_actions.extend(self.session.handle(event));
                        }
                    },
                }
            }
        }
    }

    /// Get a reference to the session
    pub fn session(&self) -> &ChatSession<E> {
        &self.session
    }

    /// Get a mutable reference to the session
    pub fn session_mut(&mut self) -> &mut ChatSession<E> {
        &mut self.session
    }

    /// Get a reference to the driver
    pub fn driver(&self) -> &D {
        &self.driver
    }
}
