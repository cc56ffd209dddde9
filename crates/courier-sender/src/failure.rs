//! Handling of failed sends.

use std::sync::Arc;

use courier_core::{
    ClientsChanged, ConversationId, MessageId, Timestamp,
    store::{ClientStore, MessageStore},
};

use crate::{error::SendError, legal_hold::LegalHoldHandler};

/// Reconciles local device lists after a "device set changed" rejection and
/// records terminal failures on the message.
pub struct MessageSendFailureHandler {
    clients: Arc<dyn ClientStore>,
    messages: Arc<dyn MessageStore>,
    legal_hold: LegalHoldHandler,
}

impl MessageSendFailureHandler {
    /// Create a handler.
    pub fn new(
        clients: Arc<dyn ClientStore>,
        messages: Arc<dyn MessageStore>,
        legal_hold: LegalHoldHandler,
    ) -> Self {
        Self { clients, messages, legal_hold }
    }

    /// Brings the local device lists in line with the server's view.
    ///
    /// Users with missing devices are refetched and the missing devices
    /// stored; redundant and deleted devices are dropped.
    pub async fn handle_clients_changed(&self, failure: &ClientsChanged) -> Result<(), SendError> {
        let users = failure.users_to_refresh();
        if !users.is_empty() {
            self.clients.fetch_users(&users).await?;
        }

        for (user_id, clients) in &failure.missing {
            self.clients.store_user_clients(user_id, clients).await?;
        }
        for (user_id, clients) in failure.redundant.iter().chain(&failure.deleted) {
            self.clients.remove_user_clients(user_id, clients).await?;
        }
        Ok(())
    }

    /// Reconciles devices and reports whether legal hold became active.
    ///
    /// Broadcasts have no conversation, so legal hold is never reported for
    /// them.
    pub async fn handle_device_set_changed(
        &self,
        failure: &ClientsChanged,
        conversation_id: Option<&ConversationId>,
        message_time: Timestamp,
    ) -> Result<bool, SendError> {
        match conversation_id {
            Some(conversation_id) => {
                self.legal_hold
                    .handle_message_send_failure(
                        conversation_id,
                        message_time,
                        self.handle_clients_changed(failure),
                    )
                    .await
            },
            None => {
                self.handle_clients_changed(failure).await?;
                Ok(false)
            },
        }
    }

    /// Leaves the message in the status matching `error`.
    ///
    /// Storage failures here are logged only; the caller already holds the
    /// send error to report.
    pub async fn update_failed_status(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        error: &SendError,
    ) {
        let status = error.failed_status();
        tracing::error!(
            conversation = %conversation_id,
            message_id = %message_id.obfuscated(),
            %error,
            ?status,
            "message send failed"
        );

        if let Err(err) = self.messages.update_status(conversation_id, message_id, status).await {
            tracing::error!(
                conversation = %conversation_id,
                message_id = %message_id.obfuscated(),
                %err,
                "failed to persist failed status"
            );
        }
    }
}
