//! Errors reported by the collaborators of the send pipeline.
//!
//! Each external boundary has its own enum so the sender can tell a storage
//! hiccup from a crypto failure from a server rejection without inspecting
//! strings. The sender folds these into its own `SendError`.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::ids::{ClientId, ConversationId, GroupId, UserId};

/// Persistence failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Requested record does not exist
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing record
        what: String,
    },

    /// Underlying database failed
    #[error("storage backend failure: {reason}")]
    Backend {
        /// Backend-reported reason
        reason: String,
    },
}

impl StorageError {
    /// Shorthand for a [`StorageError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

/// Failures raised by the cryptographic engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No pairwise session exists for the device
    #[error("no session for {user}:{client}")]
    SessionNotFound {
        /// Device owner
        user: UserId,
        /// Device without a session
        client: ClientId,
    },

    /// Session creation from key material failed
    #[error("session establishment failed: {reason}")]
    SessionEstablishment {
        /// Engine-reported reason
        reason: String,
    },

    /// Encrypting a payload failed
    #[error("encryption failed: {reason}")]
    Encryption {
        /// Engine-reported reason
        reason: String,
    },

    /// An MLS group operation failed
    #[error("group {group_id} operation failed: {reason}")]
    Group {
        /// Group the operation targeted
        group_id: GroupId,
        /// Engine-reported reason
        reason: String,
    },

    /// The crypto transaction could not be opened or committed
    #[error("crypto transaction failed: {reason}")]
    Transaction {
        /// Engine-reported reason
        reason: String,
    },
}

/// Device-set mismatch reported by the server for a pairwise send.
///
/// The server refuses a Proteus envelope whose recipient devices do not match
/// its view of the conversation, and reports the difference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientsChanged {
    /// Devices the envelope lacked
    pub missing: BTreeMap<UserId, Vec<ClientId>>,
    /// Devices the envelope addressed that are not conversation members
    pub redundant: BTreeMap<UserId, Vec<ClientId>>,
    /// Devices the envelope addressed that no longer exist
    pub deleted: BTreeMap<UserId, Vec<ClientId>>,
    /// Users whose backends could not confirm delivery
    pub failed_to_confirm: Vec<UserId>,
}

impl ClientsChanged {
    /// Users whose device lists must be refetched.
    pub fn users_to_refresh(&self) -> Vec<UserId> {
        self.missing.keys().cloned().collect()
    }
}

/// Failures from the network boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// No connectivity at all
    #[error("no network connection")]
    NoConnection,

    /// A federated backend hosting some recipients could not be reached
    #[error("federated backend unreachable: {domains:?}")]
    FederatedBackendUnreachable {
        /// Unreachable domains
        domains: Vec<String>,
    },

    /// Recipient device set differs from the server's view
    #[error(
        "recipient devices changed: {} users missing devices, {} redundant, {} deleted",
        .0.missing.len(),
        .0.redundant.len(),
        .0.deleted.len()
    )]
    ClientsChanged(ClientsChanged),

    /// An MLS message was encrypted for an epoch the server has moved past
    #[error("MLS message rejected for stale epoch")]
    MlsStaleMessage,

    /// Any other server rejection
    #[error("server rejected request ({status}): {label}")]
    Server {
        /// HTTP-like status code
        status: u16,
        /// Server error label
        label: String,
    },
}

impl NetworkError {
    /// Device-set payload when the server reported changed clients.
    pub fn as_clients_changed(&self) -> Option<&ClientsChanged> {
        match self {
            Self::ClientsChanged(failure) => Some(failure),
            _ => None,
        }
    }

    /// Whether the failure is caused by a federated backend being down.
    pub fn is_federation_failure(&self) -> bool {
        matches!(self, Self::FederatedBackendUnreachable { .. })
    }
}

/// Sync-state failures observed while waiting for a live connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Sync reported a failure
    #[error("sync failed: {reason}")]
    Failed {
        /// Reason reported by the sync engine
        reason: String,
    },

    /// Sync is not running, so it will never become live on its own
    #[error("sync is not running")]
    NotRunning,

    /// The sync state source was dropped
    #[error("sync state source closed")]
    Closed,
}

/// Content codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// CBOR encoding failed
    #[error("content encoding failed: {reason}")]
    Encode {
        /// Encoder-reported reason
        reason: String,
    },

    /// CBOR decoding failed
    #[error("content decoding failed: {reason}")]
    Decode {
        /// Decoder-reported reason
        reason: String,
    },
}

/// Raised when a conversation is expected to exist locally but does not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("conversation {0} not found")]
pub struct ConversationNotFound(pub ConversationId);

impl From<ConversationNotFound> for StorageError {
    fn from(err: ConversationNotFound) -> Self {
        Self::NotFound { what: err.to_string() }
    }
}
