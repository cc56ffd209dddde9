//! Send pipeline errors.

use courier_core::{
    ClientsChanged, CodecError, ConversationId, CryptoError, MessageId, MessageStatus,
    NetworkError, StorageError, SyncError,
};
use thiserror::Error;

/// Terminal outcome of a failed send.
///
/// Recoverable conditions (device set changed, stale epoch) are handled
/// inside the sender and only surface here once recovery is exhausted or
/// itself failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Content could not be prepared for sending (never retried)
    #[error("content preparation failed: {reason}")]
    Preparation {
        /// Why preparation failed
        reason: String,
    },

    /// Content could not be encoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Crypto engine failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Network or server failure
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Sync never became live
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Legal hold became active while sending; the user has to confirm
    /// before the message may go out
    #[error("legal hold enabled in {conversation_id}, message {message_id} not sent")]
    LegalHoldEnabled {
        /// Conversation now under legal hold
        conversation_id: ConversationId,
        /// Message that was held back
        message_id: MessageId,
    },

    /// Device set kept changing after every allowed retry
    #[error("recipient devices still changing after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Submission attempts made
        attempts: u32,
        /// Last mismatch reported by the server
        last: ClientsChanged,
    },

    /// Group operation requested for a conversation that is not MLS
    #[error("conversation {0} does not use MLS")]
    NotMls(ConversationId),

    /// Stored message cannot be sent by a client
    #[error("message {0} is a system message, clients cannot send it")]
    NotSendable(MessageId),
}

impl SendError {
    /// Whether the sender may recover from this error on its own.
    ///
    /// Only the server-reported conditions the retry state machine handles
    /// are recoverable; every other error is terminal as soon as it occurs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::ClientsChanged(_) | NetworkError::MlsStaleMessage)
        )
    }

    /// Status a message is left in after failing with this error.
    pub fn failed_status(&self) -> MessageStatus {
        match self {
            Self::Network(err) if err.is_federation_failure() => MessageStatus::FailedRemotely,
            _ => MessageStatus::Failed,
        }
    }
}
