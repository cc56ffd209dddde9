//! Message send pipeline.
//!
//! Turns application messages into delivered ciphertext and keeps the local
//! state honest afterwards.
//!
//! # Architecture
//!
//! [`MessageSender`] is the entry point. A send resolves the conversation's
//! protocol and takes one of two paths:
//!
//! - Pairwise: recipients are resolved, missing sessions are created
//!   ([`SessionEstablisher`]), the content is encrypted once per device
//!   ([`MessageEnvelopeCreator`]) and the envelope is submitted.
//! - Group: pending proposals are committed and the content is encrypted
//!   once for the group ([`MlsMessageCreator`]).
//!
//! Rejections the backend uses to signal a stale local view are recovered
//! from in place. "Device set changed" reconciles devices and retries within
//! a budget ([`RetryState`]), stopping early when legal hold was switched on
//! ([`LegalHoldHandler`]). "Stale epoch" is diagnosed once by
//! [`StaleEpochVerifier`] before retrying.
//!
//! Two background services complete the picture:
//!
//! - [`PendingProposalScheduler`]: commits pending group proposals when their
//!   deadline passes, only while sync is live
//! - [`EphemeralMessageDeletionHandler`]: runs self-deletion countdowns of
//!   sent ephemeral messages
//!
//! Every collaborator (storage, crypto, transport, sync state) is reached
//! through the traits in [`courier_core`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod envelope;
mod error;
mod failure;
mod legal_hold;
mod locks;
mod mls;
mod preparation;
mod proposals;
mod retry;
mod self_deletion;
mod sender;
mod session;
mod stale_epoch;
mod system_env;

pub use config::{
    DEFAULT_EXTERNAL_MESSAGE_THRESHOLD, ProposalSchedulerConfig, SelfDeletionConfig, SenderConfig,
};
pub use envelope::MessageEnvelopeCreator;
pub use error::SendError;
pub use failure::MessageSendFailureHandler;
pub use legal_hold::LegalHoldHandler;
pub use locks::ConversationLocks;
pub use mls::MlsMessageCreator;
pub use preparation::{MessagePreparer, PassthroughPreparer, QuoteHashPreparer};
pub use proposals::{PendingProposalScheduler, ProposalState};
pub use retry::{RetryDecision, RetryPhase, RetryState};
pub use self_deletion::{EphemeralMessageDeletionHandler, NoSelfDeletion, SelfDeletionScheduler};
pub use sender::{BroadcastTarget, Collaborators, MessageSender};
pub use session::SessionEstablisher;
pub use stale_epoch::{EpochVerdict, StaleEpochVerifier};
pub use system_env::SystemEnv;
