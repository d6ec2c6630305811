//! Driver trait for abstracting I/O operations.
//!
//! The [`Driver`] trait decouples the runtime from specific I/O
//! implementations. The CLI implements it with HTTP and WebSocket clients, the
//! harness with a scripted in-memory server, while the generic
//! [`crate::Runtime`] handles all orchestration.

use std::{future::Future, ops::Sub, time::Duration};

use haggle_proto::{ConversationId, Handshake, OutboundFrame};

use crate::DriverInput;

/// Abstracts I/O operations for the session runtime.
///
/// Request methods (`fetch_*`, `open_realtime`) only start work. Results come
/// back later through [`Driver::poll_input`] as
/// [`haggle_client::SessionEvent`]s tagged with the epoch passed in, which is
/// how the session discards results that outlive it.
///
/// # Associated Types
///
/// - [`Error`](Driver::Error): Platform-specific error type
/// - [`Instant`](Driver::Instant): Time representation (real or virtual)
pub trait Driver: Send {
    /// Platform-specific error type.
    type Error: std::error::Error + Send + 'static;

    /// Time instant type. Enables virtual time in simulation.
    type Instant: Copy + Ord + Send + Sync + Sub<Output = Duration>;

    /// Poll for the next input.
    ///
    /// Returns `None` if nothing is ready. Implementations should bound how
    /// long they wait so the runtime keeps ticking.
    fn poll_input(
        &mut self,
    ) -> impl Future<Output = Result<Option<DriverInput<Self::Instant>>, Self::Error>> + Send;

    /// Start fetching the last chats.
    fn fetch_last_chats(&mut self, epoch: u64);

    /// Start fetching the peer of a shell conversation.
    fn fetch_peer(&mut self, epoch: u64, conversation_id: ConversationId);

    /// Open the realtime transport and send `handshake` as the first frame.
    ///
    /// Frames and failures from this transport carry `generation`, which
    /// replaces any previously opened one.
    fn open_realtime(&mut self, epoch: u64, generation: u64, handshake: Handshake);

    /// Close the realtime transport once queued frames are flushed.
    /// Idempotent.
    fn close_realtime(&mut self, epoch: u64);

    /// Send a frame on the realtime transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is closed or the write fails.
    fn transmit(&mut self, epoch: u64, frame: OutboundFrame) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Current time instant.
    fn now(&self) -> Self::Instant;

    /// Release all resources.
    fn stop(&mut self);
}
