//! Legal-hold detection during send failures.

use std::{future::Future, sync::Arc};

use courier_core::{
    ConversationId, Timestamp,
    store::{ClientStore, ConversationStore, LegalHoldStatus, MessageStore, SystemNotice, SystemNoticeKind},
};

use crate::error::SendError;

/// Re-evaluates a conversation's legal-hold status around device
/// reconciliation.
///
/// A device-set rejection is how a sender learns that a member enrolled a
/// legal-hold device. When that happens the message must not go out until the
/// user acknowledges it, so the reconciliation result is checked against the
/// status recorded before it.
pub struct LegalHoldHandler {
    conversations: Arc<dyn ConversationStore>,
    clients: Arc<dyn ClientStore>,
    messages: Arc<dyn MessageStore>,
}

impl LegalHoldHandler {
    /// Create a handler.
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        clients: Arc<dyn ClientStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self { conversations, clients, messages }
    }

    /// Runs `reconcile` and reports whether legal hold became active for the
    /// conversation because of it.
    ///
    /// A status change is persisted and announced with a system notice dated
    /// `message_time`.
    pub async fn handle_message_send_failure<F>(
        &self,
        conversation_id: &ConversationId,
        message_time: Timestamp,
        reconcile: F,
    ) -> Result<bool, SendError>
    where
        F: Future<Output = Result<(), SendError>> + Send,
    {
        let before = self.conversations.legal_hold_status(conversation_id).await?;

        reconcile.await?;

        let members = self.conversations.member_ids(conversation_id).await?;
        let under_hold = self.clients.users_with_legal_hold_device(&members).await?;
        let after =
            if under_hold.is_empty() { LegalHoldStatus::Disabled } else { LegalHoldStatus::Enabled };

        if after != before {
            self.conversations.update_legal_hold_status(conversation_id, after).await?;

            let notice = match (before, after) {
                (_, LegalHoldStatus::Enabled) => Some(SystemNoticeKind::LegalHoldEnabled),
                (LegalHoldStatus::Enabled, LegalHoldStatus::Disabled) => {
                    Some(SystemNoticeKind::LegalHoldDisabled)
                },
                _ => None,
            };
            if let Some(kind) = notice {
                self.messages
                    .insert_system_notice(SystemNotice {
                        conversation_id: conversation_id.clone(),
                        date: message_time,
                        kind,
                    })
                    .await?;
            }

            tracing::info!(
                conversation = %conversation_id,
                ?before,
                ?after,
                "legal hold status changed during send"
            );
        }

        Ok(before != LegalHoldStatus::Enabled && after == LegalHoldStatus::Enabled)
    }
}
