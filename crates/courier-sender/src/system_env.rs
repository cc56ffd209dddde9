//! Production `Environment` backed by the system clock and OS RNG.

use std::time::Duration;

use courier_core::{Environment, Timestamp};

/// Production environment using the system clock, tokio timers and
/// getrandom.
///
/// # Panics
///
/// Panics if the OS RNG fails. Blob keys and nonces cannot be generated
/// without it, so there is nothing sensible to fall back to.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn wall_clock(&self) -> Timestamp {
        // A clock before 1970 reads as the epoch.
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis());
        Timestamp::from_millis(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
