//! Deterministic test harness for the courier send pipeline.
//!
//! In-memory implementations of every collaborator trait in
//! [`courier_core`], plus [`SimEnv`] for paused-clock time and seeded
//! randomness. Every implementation records what was asked of it so tests
//! can assert on behavior, not only outcomes.
//!
//! # Components
//!
//! - [`SimEnv`]: tokio-clock wall time, seeded `ChaCha8Rng`
//! - [`MemoryMessageStore`], [`MemoryProposalTimerStore`]: persistence
//! - [`MemoryDirectory`]: conversations, devices, key material,
//!   sub-conversations
//! - [`SimCrypto`]: transactional crypto engine with fault injection
//! - [`SimTransport`]: scripted backend

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod directory;
pub mod sim_env;
pub mod store;
pub mod transport;

pub use crypto::SimCrypto;
pub use directory::MemoryDirectory;
pub use sim_env::{DEFAULT_EPOCH, SimEnv};
pub use store::{MemoryMessageStore, MemoryProposalTimerStore, RecordedEdit};
pub use transport::{SimTransport, SubmittedEnvelope};

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    // Another test may have installed the subscriber already.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
