//! Environment abstraction for deterministic testing.
//!
//! Decouples the send pipeline and its timers from system resources (wall
//! clock, sleeping, randomness). Production uses real system resources; tests
//! use tokio's paused clock and a seeded RNG.

use std::time::Duration;

use crate::time::Timestamp;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `wall_clock()` advances consistently with `sleep()`: after sleeping `d`,
///   the wall clock has moved forward by at least `d`
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time.
    ///
    /// Used wherever times are persisted or compared with server-assigned
    /// times (self-deletion start, proposal due times).
    fn wall_clock(&self) -> Timestamp;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random fixed-size array.
    ///
    /// Convenience for symmetric keys and nonces.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// Sleeps until `deadline` on the wall clock. Returns immediately if the
    /// deadline has already passed.
    fn sleep_until(&self, deadline: Timestamp) -> impl std::future::Future<Output = ()> + Send {
        let remaining = deadline.saturating_duration_since(self.wall_clock());
        self.sleep(remaining)
    }
}
