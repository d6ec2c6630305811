//! Simulated environment with a virtual clock and seeded randomness.
//!
//! Time only moves when a test calls [`SimEnv::advance`] (or awaits
//! [`Environment::sleep`], which advances instead of waiting). Clones share
//! the same clock and RNG.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    future::Future,
    ops::{Add, Sub},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use haggle_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Wall clock reading at virtual time zero, Unix milliseconds.
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Virtual instant: time elapsed since the simulation started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time since the simulation started.
    pub fn since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

struct SimState {
    elapsed: Duration,
    rng: ChaCha8Rng,
}

/// Deterministic [`Environment`].
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("elapsed", &self.lock().elapsed).finish_non_exhaustive()
    }
}

impl SimEnv {
    /// Environment at virtual time zero with RNG seeded from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        let state = SimState { elapsed: Duration::ZERO, rng: ChaCha8Rng::seed_from_u64(seed) };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.lock().elapsed += duration;
    }

    /// Virtual time since start.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.lock().elapsed)
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_MILLIS + u64::try_from(self.lock().elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_only_moves_when_advanced() {
        let env = SimEnv::with_seed(1);
        let start = env.now();
        assert_eq!(env.now(), start);

        env.advance(Duration::from_millis(250));
        assert_eq!(env.now() - start, Duration::from_millis(250));
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS + 250);
    }

    #[test]
    fn clones_share_clock() {
        let env = SimEnv::with_seed(1);
        let other = env.clone();
        other.advance(Duration::from_secs(3));
        assert_eq!(env.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_u64(), b.random_u64());
    }

    #[test]
    fn earlier_minus_later_saturates() {
        let env = SimEnv::with_seed(1);
        let early = env.now();
        env.advance(Duration::from_secs(1));
        assert_eq!(early - env.now(), Duration::ZERO);
    }
}
