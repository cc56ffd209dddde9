//! Persistence boundaries.
//!
//! The pipeline owns no storage. Messages, conversations, devices and
//! proposal timers are reached through these traits; implementations decide
//! whether a call is a database query or a backend request.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::{
    crypto::PreKey,
    envelope::Recipient,
    error::{NetworkError, StorageError},
    ids::{ClientId, ConversationId, GroupId, MessageId, SubconversationId, UserId},
    message::{Message, MessageContent, MessageStatus},
    protocol::{ProposalTimer, ProtocolInfo},
    time::Timestamp,
};

/// Legal-hold state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalHoldStatus {
    /// At least one member has a legal-hold device
    Enabled,
    /// No member has a legal-hold device
    Disabled,
    /// Not evaluated yet
    Unknown,
}

/// Kind of a locally generated system notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemNoticeKind {
    /// Group commits were missed and the group was rejoined, so messages sent
    /// in the missed epochs cannot be decrypted
    MlsMessagesLost,
    /// Legal hold was enabled for the conversation
    LegalHoldEnabled,
    /// Legal hold was disabled for the conversation
    LegalHoldDisabled,
}

/// A system notice inserted into a conversation's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotice {
    /// Conversation the notice belongs to
    pub conversation_id: ConversationId,
    /// Time shown for the notice
    pub date: Timestamp,
    /// What happened
    pub kind: SystemNoticeKind,
}

/// A message as loaded from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredMessage {
    /// Authored by a user, sendable
    Regular(Message),
    /// Generated locally or by the server, never sent by a client
    System(SystemNotice),
}

/// A message whose self-deletion countdown is running or due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralMessage {
    /// Conversation holding the message
    pub conversation_id: ConversationId,
    /// Message id
    pub message_id: MessageId,
    /// Authoring user
    pub sender_user_id: UserId,
    /// Lifetime once started
    pub expire_after: Duration,
    /// Persisted countdown start
    pub start: Timestamp,
}

/// Message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Loads a message.
    async fn message_by_id(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<StoredMessage, StorageError>;

    /// Sets the delivery status of a message.
    async fn update_status(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), StorageError>;

    /// Marks a message `Sent`, adopting the server time when given.
    async fn promote_to_sent(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        server_time: Option<Timestamp>,
    ) -> Result<(), StorageError>;

    /// Replaces an edited message's id and content, keeping its original
    /// creation date.
    async fn update_content_on_edit(
        &self,
        conversation_id: &ConversationId,
        edited_message_id: &MessageId,
        new_message_id: &MessageId,
        new_content: &MessageContent,
        edit_time: Timestamp,
    ) -> Result<(), StorageError>;

    /// Shifts the dates of every still-pending message of the conversation.
    async fn shift_pending_messages_by(
        &self,
        conversation_id: &ConversationId,
        millis: i64,
    ) -> Result<(), StorageError>;

    /// Records users for whom the message could not be encrypted at all.
    async fn persist_no_clients_to_deliver(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        users: &[UserId],
    ) -> Result<(), StorageError>;

    /// Records users whose delivery the server could not confirm.
    async fn persist_recipients_delivery_failure(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        users: &[UserId],
    ) -> Result<(), StorageError>;

    /// Messages whose self-deletion countdown started but has not ended.
    async fn pending_ephemeral_messages(&self) -> Result<Vec<EphemeralMessage>, StorageError>;

    /// Messages whose self-deletion countdown has already ended.
    async fn ended_ephemeral_messages(
        &self,
        now: Timestamp,
    ) -> Result<Vec<EphemeralMessage>, StorageError>;

    /// Persists the start of a self-deletion countdown.
    async fn mark_self_deletion_start(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        start: Timestamp,
    ) -> Result<(), StorageError>;

    /// Deletes a message.
    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), StorageError>;

    /// Inserts a system notice into the conversation history.
    async fn insert_system_notice(&self, notice: SystemNotice) -> Result<(), StorageError>;
}

/// Candidates for a broadcast, split by team membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastRecipients {
    /// Members of the self user's team, self user included
    pub team: Vec<Recipient>,
    /// Everyone else the self user shares a conversation with
    pub others: Vec<Recipient>,
}

/// Conversation persistence, including remote refresh.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Local protocol descriptor of a conversation.
    async fn protocol_info(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ProtocolInfo, StorageError>;

    /// Every member device of a conversation.
    async fn recipients(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Recipient>, StorageError>;

    /// Member devices of the listed users only.
    async fn recipients_for_users(
        &self,
        conversation_id: &ConversationId,
        users: &[UserId],
    ) -> Result<Vec<Recipient>, StorageError>;

    /// Broadcast candidates across every conversation.
    async fn all_recipients(&self) -> Result<BroadcastRecipients, StorageError>;

    /// Refetches the conversation from the backend and persists it.
    async fn fetch_conversation(&self, conversation_id: &ConversationId) -> Result<(), NetworkError>;

    /// Fetches the published MLS group info of the conversation's group.
    async fn fetch_group_info(&self, conversation_id: &ConversationId)
    -> Result<Bytes, NetworkError>;

    /// Current members.
    async fn member_ids(&self, conversation_id: &ConversationId)
    -> Result<Vec<UserId>, StorageError>;

    /// Persisted legal-hold status.
    async fn legal_hold_status(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LegalHoldStatus, StorageError>;

    /// Persists a new legal-hold status.
    async fn update_legal_hold_status(
        &self,
        conversation_id: &ConversationId,
        status: LegalHoldStatus,
    ) -> Result<(), StorageError>;
}

/// Device persistence, including remote refresh.
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Refetches user details (and their device lists) from the backend and
    /// persists them.
    async fn fetch_users(&self, users: &[UserId]) -> Result<(), NetworkError>;

    /// Adds devices to a user's known device list.
    async fn store_user_clients(
        &self,
        user_id: &UserId,
        clients: &[ClientId],
    ) -> Result<(), StorageError>;

    /// Removes devices from a user's known device list.
    async fn remove_user_clients(
        &self,
        user_id: &UserId,
        clients: &[ClientId],
    ) -> Result<(), StorageError>;

    /// Subset of `users` owning at least one legal-hold device.
    async fn users_with_legal_hold_device(
        &self,
        users: &[UserId],
    ) -> Result<Vec<UserId>, StorageError>;
}

/// Key material for session creation, fetched per device.
///
/// `None` means the backend has no key material for that device.
pub type PreKeyMap = std::collections::BTreeMap<UserId, Vec<(ClientId, Option<PreKey>)>>;

/// Fetches one-time key material from the backend.
#[async_trait]
pub trait PreKeySource: Send + Sync {
    /// Fetches key material for every listed device in one batched request.
    async fn fetch_prekeys(&self, devices: &[Recipient]) -> Result<PreKeyMap, NetworkError>;
}

/// Server-side view of a sub-conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubconversationDetails {
    /// Parent conversation
    pub parent_id: ConversationId,
    /// Sub-conversation id
    pub id: SubconversationId,
    /// Backing MLS group
    pub group_id: GroupId,
    /// Epoch known to the server
    pub epoch: u64,
}

/// Sub-conversation lookups.
#[async_trait]
pub trait SubconversationSource: Send + Sync {
    /// Fetches the server's view of a sub-conversation.
    async fn fetch_remote_details(
        &self,
        conversation_id: &ConversationId,
        subconversation_id: &SubconversationId,
    ) -> Result<SubconversationDetails, NetworkError>;

    /// Fetches the published group info of a sub-conversation.
    async fn fetch_group_info(
        &self,
        conversation_id: &ConversationId,
        subconversation_id: &SubconversationId,
    ) -> Result<Bytes, NetworkError>;

    /// Whether `group_id` backs a known sub-conversation.
    async fn is_subconversation_group(&self, group_id: &GroupId) -> Result<bool, StorageError>;
}

/// Persistence of proposal commit deadlines.
#[async_trait]
pub trait ProposalTimerStore: Send + Sync {
    /// Persists a timer, replacing any earlier timer for the group, and
    /// publishes it to subscribers. In-memory timers are not written to disk.
    async fn set_proposal_timer(
        &self,
        timer: ProposalTimer,
        in_memory: bool,
    ) -> Result<(), StorageError>;

    /// Every stored timer, including those kept in memory only.
    async fn persisted_timers(&self) -> Result<Vec<ProposalTimer>, StorageError>;

    /// Drops `fired` once its proposals were committed. A newer timer stored
    /// for the same group in the meantime is left in place.
    async fn clear_proposal_timer(&self, fired: &ProposalTimer) -> Result<(), StorageError>;

    /// Live stream of timers set after subscribing.
    fn subscribe(&self) -> broadcast::Receiver<ProposalTimer>;
}
