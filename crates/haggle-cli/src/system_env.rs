//! Wall-clock environment for the headless client.
//!
//! Time comes from the OS monotonic clock, message timestamps from the
//! system clock, and randomness from getrandom. Only local message ids
//! consume randomness.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use haggle_core::Environment;

/// [`Environment`] backed by the operating system.
///
/// An RNG failure is logged and leaves the buffer zeroed. Local ids stay
/// unique through their sequence number, so the session keeps running.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// New system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        // A clock set before 1970 reads as the epoch
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |since| since.as_millis() as u64)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        if let Err(error) = getrandom::fill(buffer) {
            tracing::error!(%error, len = buffer.len(), "OS RNG unavailable, nonce left zeroed");
        }
    }
}
