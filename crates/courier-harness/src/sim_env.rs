//! Deterministic environment for tests.
//!
//! Time comes from tokio's clock, so under `#[tokio::test(start_paused =
//! true)]` the wall clock only moves when the runtime auto-advances past a
//! pending sleep. Randomness comes from a seeded `ChaCha8Rng`.

#![allow(clippy::disallowed_types, reason = "RNG lock is never held across an await")]

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use courier_core::{Environment, Timestamp};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Wall-clock origin used by [`SimEnv::with_seed`] (2023-11-14T22:13:20Z).
pub const DEFAULT_EPOCH: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Simulated environment: paused-clock time and seeded randomness.
#[derive(Clone)]
pub struct SimEnv {
    epoch: Timestamp,
    origin: tokio::time::Instant,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Environment starting at [`DEFAULT_EPOCH`].
    pub fn with_seed(seed: u64) -> Self {
        Self::starting_at(seed, DEFAULT_EPOCH)
    }

    /// Environment whose wall clock reads `epoch` now.
    pub fn starting_at(seed: u64, epoch: Timestamp) -> Self {
        Self {
            epoch,
            origin: tokio::time::Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Time elapsed since the environment was created.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Environment for SimEnv {
    fn wall_clock(&self) -> Timestamp {
        self.epoch.saturating_add(self.elapsed())
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
