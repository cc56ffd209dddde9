//! Core types for the courier message send pipeline.
//!
//! Everything the sender needs to agree on with its collaborators lives here:
//! identifiers, the message and envelope model, the wire content codec, the
//! environment abstraction, and the traits through which storage, crypto,
//! transport and sync state are reached.
//!
//! # Architecture
//!
//! The crate is runtime-agnostic. Collaborators are `#[async_trait]` objects
//! so the sender can hold them as `Arc<dyn Trait>`, and every fallible call
//! returns one of the typed errors in [`error`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod crypto;
pub mod env;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod message;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod time;
pub mod transport;

pub use codec::{ExternalInstructions, ProtoContent};
pub use crypto::{CryptoEngine, CryptoTransactionProvider, PreKey, SessionId};
pub use env::Environment;
pub use envelope::{
    ClientPayload, MessageEnvelope, MlsOutgoingMessage, Recipient, RecipientEntry,
    UsersWithoutSessions,
};
pub use error::{ClientsChanged, CodecError, CryptoError, NetworkError, StorageError, SyncError};
pub use ids::{ClientId, ConversationId, GroupId, MessageId, SubconversationId, UserId};
pub use message::{
    BroadcastMessage, ExpirationData, Message, MessageContent, MessageStatus, MessageTarget,
    SelfDeletionStatus,
};
pub use protocol::{GroupState, ProposalTimer, ProtocolInfo};
pub use sync::{SyncState, SyncStateHandle, SyncStateObserver};
pub use time::Timestamp;
pub use transport::{BroadcastOption, MessageSent, Transport};
