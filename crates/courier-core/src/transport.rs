//! Boundary to the backend.

use async_trait::async_trait;

use crate::{
    envelope::{MessageEnvelope, MlsOutgoingMessage},
    error::NetworkError,
    ids::{ConversationId, UserId},
    message::MessageTarget,
    time::Timestamp,
};

/// Server acknowledgement of a submitted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSent {
    /// Server-assigned time
    pub time: Timestamp,
    /// Users whose backends accepted the message but could not confirm
    /// delivery to their devices
    pub failed_to_confirm: Vec<UserId>,
}

impl MessageSent {
    /// Fully confirmed acknowledgement.
    pub fn at(time: Timestamp) -> Self {
        Self { time, failed_to_confirm: Vec::new() }
    }
}

/// How the server reports device mismatches for a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOption {
    /// Report missing devices only for the listed users
    ReportSome(Vec<UserId>),
    /// Never report missing devices
    IgnoreAll,
}

/// Sends encrypted messages to the backend.
///
/// Each call is a single fallible request; retries are the sender's business.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submits a pairwise-encrypted envelope to a conversation.
    async fn submit_envelope(
        &self,
        conversation_id: &ConversationId,
        envelope: &MessageEnvelope,
        target: &MessageTarget,
    ) -> Result<MessageSent, NetworkError>;

    /// Submits a group-encrypted message.
    async fn submit_group_message(
        &self,
        message: &MlsOutgoingMessage,
    ) -> Result<MessageSent, NetworkError>;

    /// Submits a broadcast envelope outside any conversation.
    async fn submit_broadcast(
        &self,
        envelope: &MessageEnvelope,
        option: &BroadcastOption,
    ) -> Result<MessageSent, NetworkError>;
}
