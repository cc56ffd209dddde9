//! Diagnosis and repair of "stale epoch" rejections.

use std::sync::Arc;

use courier_core::{
    ConversationId, CryptoEngine, GroupId, SubconversationId, Timestamp,
    store::{ConversationStore, MessageStore, SubconversationSource, SystemNotice, SystemNoticeKind},
};

use crate::error::SendError;

/// Why a group message was rejected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochVerdict {
    /// The local group missed commits; it has been rejoined
    MissedCommits,
    /// The local group is current but queued events are unprocessed; wait
    /// for sync to catch up and retry
    UnprocessedEvents,
}

/// Distinguishes missed commits from unprocessed events after a stale epoch
/// rejection and repairs the former.
pub struct StaleEpochVerifier {
    conversations: Arc<dyn ConversationStore>,
    subconversations: Arc<dyn SubconversationSource>,
    messages: Arc<dyn MessageStore>,
}

impl StaleEpochVerifier {
    /// Create a verifier.
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        subconversations: Arc<dyn SubconversationSource>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self { conversations, subconversations, messages }
    }

    /// Verifies the epoch of a conversation's group.
    ///
    /// Refreshes the conversation from the backend and compares the server
    /// epoch with the local one. A group behind the server is rejoined, and
    /// only once the rejoin succeeded is a "messages lost" notice dated
    /// `message_time` inserted.
    ///
    /// # Errors
    ///
    /// - `NotMls`: the conversation does not use MLS
    /// - `Network`, `Storage`, `Crypto`: refresh or rejoin failed; no notice
    ///   was inserted
    pub async fn verify_epoch(
        &self,
        crypto: &mut dyn CryptoEngine,
        conversation_id: &ConversationId,
        message_time: Timestamp,
    ) -> Result<EpochVerdict, SendError> {
        self.conversations.fetch_conversation(conversation_id).await?;

        let protocol = self.conversations.protocol_info(conversation_id).await?;
        let Some((group_id, remote_epoch)) = protocol.mls_group() else {
            return Err(SendError::NotMls(conversation_id.clone()));
        };

        if !Self::is_out_of_sync(crypto, group_id, remote_epoch).await? {
            tracing::info!(conversation = %conversation_id, "epoch current, events unprocessed");
            return Ok(EpochVerdict::UnprocessedEvents);
        }

        tracing::warn!(
            conversation = %conversation_id,
            group = %group_id,
            remote_epoch,
            "missed commits, rejoining group"
        );
        let group_info = self.conversations.fetch_group_info(conversation_id).await?;
        crypto.join_by_external_commit(group_id, &group_info).await?;

        self.messages
            .insert_system_notice(SystemNotice {
                conversation_id: conversation_id.clone(),
                date: message_time,
                kind: SystemNoticeKind::MlsMessagesLost,
            })
            .await?;

        Ok(EpochVerdict::MissedCommits)
    }

    /// Verifies the epoch of a sub-conversation's group.
    ///
    /// Sub-conversations are ephemeral (calls), so a group behind the server
    /// is simply rejoined by external commit without a notice.
    pub async fn verify_subconversation_epoch(
        &self,
        crypto: &mut dyn CryptoEngine,
        conversation_id: &ConversationId,
        subconversation_id: &SubconversationId,
    ) -> Result<EpochVerdict, SendError> {
        let details =
            self.subconversations.fetch_remote_details(conversation_id, subconversation_id).await?;

        if !Self::is_out_of_sync(crypto, &details.group_id, details.epoch).await? {
            return Ok(EpochVerdict::UnprocessedEvents);
        }

        tracing::warn!(
            conversation = %conversation_id,
            subconversation = %subconversation_id,
            remote_epoch = details.epoch,
            "sub-conversation missed commits, rejoining"
        );
        let group_info =
            self.subconversations.fetch_group_info(conversation_id, subconversation_id).await?;
        crypto.join_by_external_commit(&details.group_id, &group_info).await?;

        Ok(EpochVerdict::MissedCommits)
    }

    async fn is_out_of_sync(
        crypto: &mut dyn CryptoEngine,
        group_id: &GroupId,
        remote_epoch: u64,
    ) -> Result<bool, SendError> {
        let local_epoch = crypto.group_epoch(group_id).await?;
        Ok(local_epoch < remote_epoch)
    }
}
