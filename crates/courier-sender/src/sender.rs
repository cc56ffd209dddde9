//! The send orchestrator.
//!
//! Single entry point turning an application message into delivered
//! ciphertext. Resolves the conversation protocol, drives session setup and
//! encryption, submits, and recovers from the rejections the server uses to
//! signal a stale local view (device set changed, stale epoch).

use std::sync::Arc;

use courier_core::{
    BroadcastMessage, ClientsChanged, ConversationId, CryptoTransactionProvider, Environment,
    GroupId, Message, MessageEnvelope, MessageId, MessageSent, MessageTarget, NetworkError,
    ProtocolInfo, Recipient, SyncStateObserver, Timestamp, UserId, UsersWithoutSessions,
    store::{
        ClientStore, ConversationStore, MessageStore, PreKeySource, StoredMessage,
        SubconversationSource,
    },
    transport::{BroadcastOption, Transport},
};

use crate::{
    config::SenderConfig,
    envelope::MessageEnvelopeCreator,
    error::SendError,
    failure::MessageSendFailureHandler,
    legal_hold::LegalHoldHandler,
    locks::ConversationLocks,
    mls::MlsMessageCreator,
    preparation::{MessagePreparer, QuoteHashPreparer},
    retry::{RetryDecision, RetryState},
    self_deletion::SelfDeletionScheduler,
    session::SessionEstablisher,
    stale_epoch::StaleEpochVerifier,
};

/// Who a broadcast goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// Everyone the self user shares a conversation with, team first
    AllUsers {
        /// Maximum number of users addressed
        limit: usize,
    },
    /// Members of the self user's team only
    OnlyTeam {
        /// Maximum number of users addressed
        limit: usize,
    },
}

/// External collaborators of the sender.
#[derive(Clone)]
pub struct Collaborators {
    /// Message persistence
    pub messages: Arc<dyn MessageStore>,
    /// Conversation persistence and refresh
    pub conversations: Arc<dyn ConversationStore>,
    /// Device persistence and refresh
    pub clients: Arc<dyn ClientStore>,
    /// Key material for session creation
    pub prekeys: Arc<dyn PreKeySource>,
    /// Sub-conversation lookups
    pub subconversations: Arc<dyn SubconversationSource>,
    /// Crypto transactions
    pub crypto: Arc<dyn CryptoTransactionProvider>,
    /// Backend submission
    pub transport: Arc<dyn Transport>,
    /// Incremental sync state
    pub sync: SyncStateObserver,
}

/// Sends messages and broadcasts.
pub struct MessageSender<E: Environment> {
    config: SenderConfig,
    self_user_id: UserId,
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
    crypto: Arc<dyn CryptoTransactionProvider>,
    transport: Arc<dyn Transport>,
    sync: SyncStateObserver,
    preparer: Arc<dyn MessagePreparer>,
    sessions: SessionEstablisher,
    envelopes: MessageEnvelopeCreator<E>,
    mls: MlsMessageCreator,
    failures: MessageSendFailureHandler,
    epochs: StaleEpochVerifier,
    self_deletion: Arc<dyn SelfDeletionScheduler>,
    locks: ConversationLocks,
}

impl<E: Environment> MessageSender<E> {
    /// Create a sender for the self user.
    ///
    /// Quoted messages are hashed before encryption; use
    /// [`Self::with_preparer`] to install a different preparation hook.
    pub fn new(
        config: SenderConfig,
        env: E,
        self_user_id: UserId,
        collaborators: Collaborators,
        self_deletion: Arc<dyn SelfDeletionScheduler>,
    ) -> Self {
        let Collaborators {
            messages,
            conversations,
            clients,
            prekeys,
            subconversations,
            crypto,
            transport,
            sync,
        } = collaborators;

        let legal_hold = LegalHoldHandler::new(
            Arc::clone(&conversations),
            Arc::clone(&clients),
            Arc::clone(&messages),
        );

        Self {
            envelopes: MessageEnvelopeCreator::new(env, config.external_message_threshold),
            config,
            self_user_id,
            preparer: Arc::new(QuoteHashPreparer::new(Arc::clone(&messages))),
            sessions: SessionEstablisher::new(prekeys),
            mls: MlsMessageCreator::new(),
            failures: MessageSendFailureHandler::new(clients, Arc::clone(&messages), legal_hold),
            epochs: StaleEpochVerifier::new(
                Arc::clone(&conversations),
                subconversations,
                Arc::clone(&messages),
            ),
            messages,
            conversations,
            crypto,
            transport,
            sync,
            self_deletion,
            locks: ConversationLocks::new(),
        }
    }

    /// Replace the content preparation hook.
    #[must_use]
    pub fn with_preparer(mut self, preparer: Arc<dyn MessagePreparer>) -> Self {
        self.preparer = preparer;
        self
    }

    /// Loads a pending message and sends it to the whole conversation.
    ///
    /// Waits for sync to be live first. System messages are rejected.
    pub async fn send_pending_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Timestamp, SendError> {
        let mut sync = self.sync.clone();
        sync.wait_until_live().await?;

        let stored = match self.messages.message_by_id(conversation_id, message_id).await {
            Ok(stored) => stored,
            Err(err) => {
                let err = SendError::from(err);
                self.failures.update_failed_status(conversation_id, message_id, &err).await;
                return Err(err);
            },
        };

        match stored {
            StoredMessage::Regular(message) => self.send(message, MessageTarget::default()).await,
            StoredMessage::System(_) => {
                let err = SendError::NotSendable(message_id.clone());
                self.failures.update_failed_status(conversation_id, message_id, &err).await;
                Err(err)
            },
        }
    }

    /// Sends `message` to `target` and returns the server time.
    ///
    /// On success the message is promoted to `Sent`; on failure it is left
    /// `Failed` or `FailedRemotely`. Exactly one of the two happens. If the
    /// returned future is dropped before completion the message stays
    /// `Pending`.
    pub async fn send(&self, message: Message, target: MessageTarget) -> Result<Timestamp, SendError> {
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();

        match self.prepare_and_send(message, &target).await {
            Ok(time) => Ok(time),
            Err(err) => {
                self.failures.update_failed_status(&conversation_id, &message_id, &err).await;
                Err(err)
            },
        }
    }

    async fn prepare_and_send(
        &self,
        message: Message,
        target: &MessageTarget,
    ) -> Result<Timestamp, SendError> {
        let mut sync = self.sync.clone();
        sync.wait_until_live().await?;

        let message = self.preparer.prepare(message).await?;
        let sent = self.attempt_to_send(&message, target).await?;

        tracing::info!(
            msg = %message.log_string(),
            server_time = %sent.time,
            "message sent"
        );
        self.on_sent(&message, sent.time).await;
        Ok(sent.time)
    }

    async fn attempt_to_send(
        &self,
        message: &Message,
        target: &MessageTarget,
    ) -> Result<MessageSent, SendError> {
        let conversation_id = &message.conversation_id;
        let mut retry = RetryState::new(self.config.send_retry_budget);
        let mut stale_epoch_recovered = false;

        loop {
            let protocol = self.conversations.protocol_info(conversation_id).await?;
            let outcome = match &protocol {
                ProtocolInfo::Mls { group_id, .. } => self.attempt_mls(group_id, message).await,
                ProtocolInfo::Proteus | ProtocolInfo::Mixed { .. } => {
                    self.attempt_proteus(message, target).await
                },
            };

            match outcome {
                Ok(sent) => {
                    retry.finish();
                    return Ok(sent);
                },
                Err(SendError::Network(NetworkError::MlsStaleMessage)) if !stale_epoch_recovered => {
                    stale_epoch_recovered = true;
                    tracing::warn!(
                        msg = %message.log_string(),
                        "stale epoch, verifying group before retrying"
                    );
                    self.recover_stale_epoch(message).await?;
                },
                Err(SendError::Network(NetworkError::ClientsChanged(failure))) => {
                    retry.on_device_set_changed();
                    tracing::warn!(
                        msg = %message.log_string(),
                        attempt = retry.attempts(),
                        missing = failure.missing.len(),
                        redundant = failure.redundant.len(),
                        deleted = failure.deleted.len(),
                        "recipient devices changed"
                    );
                    self.recover_device_set(&mut retry, message, failure).await?;
                },
                Err(err) => {
                    retry.finish();
                    return Err(err);
                },
            }
        }
    }

    /// Runs device reconciliation and decides whether to retry.
    async fn recover_device_set(
        &self,
        retry: &mut RetryState,
        message: &Message,
        failure: ClientsChanged,
    ) -> Result<(), SendError> {
        let legal_hold_activated = match self
            .failures
            .handle_device_set_changed(&failure, Some(&message.conversation_id), message.date)
            .await
        {
            Ok(activated) => activated,
            Err(err) => {
                retry.finish();
                return Err(err);
            },
        };

        if legal_hold_activated {
            retry.finish();
            return Err(SendError::LegalHoldEnabled {
                conversation_id: message.conversation_id.clone(),
                message_id: message.id.clone(),
            });
        }

        match retry.on_reconciled() {
            RetryDecision::Retry => Ok(()),
            RetryDecision::GiveUp => {
                Err(SendError::RetryBudgetExhausted { attempts: retry.attempts(), last: failure })
            },
        }
    }

    async fn recover_stale_epoch(&self, message: &Message) -> Result<(), SendError> {
        let mut crypto = self.crypto.begin("verify_epoch").await?;
        let verdict =
            self.epochs.verify_epoch(crypto.as_mut(), &message.conversation_id, message.date).await?;
        crypto.finish().await?;

        tracing::info!(msg = %message.log_string(), ?verdict, "epoch verified");

        let mut sync = self.sync.clone();
        sync.wait_until_live_or_failure().await?;
        Ok(())
    }

    async fn attempt_mls(&self, group_id: &GroupId, message: &Message) -> Result<MessageSent, SendError> {
        let mut crypto = self.crypto.begin("send_mls").await?;
        crypto.commit_pending_proposals(group_id).await?;
        let outgoing = self.mls.create_outgoing_message(crypto.as_mut(), group_id, message).await?;
        crypto.finish().await?;

        let sent = self.transport.submit_group_message(&outgoing).await?;

        if !sent.failed_to_confirm.is_empty() {
            self.record_delivery_failure(message, &sent.failed_to_confirm).await;
        }
        Ok(sent)
    }

    async fn attempt_proteus(
        &self,
        message: &Message,
        target: &MessageTarget,
    ) -> Result<MessageSent, SendError> {
        let conversation_id = &message.conversation_id;
        let _guard = if self.config.serialize_proteus_sends {
            Some(self.locks.lock(conversation_id).await)
        } else {
            None
        };

        let recipients = self.resolve_recipients(conversation_id, target).await?;

        let mut crypto = self.crypto.begin("send_proteus").await?;
        let without_sessions = self.sessions.prepare_recipients(crypto.as_mut(), &recipients).await?;
        self.record_no_clients_to_deliver(message, &without_sessions.user_ids()).await;
        let deliverable = without_sessions.filter(&recipients);
        let envelope = self.envelopes.create_envelope(crypto.as_mut(), &deliverable, message).await?;
        crypto.finish().await?;

        // A user with any sessionless device is left out as a whole.
        let target = target.ignoring(&without_sessions.user_ids());
        let sent = self.transport.submit_envelope(conversation_id, &envelope, &target).await?;

        self.record_proteus_partial_delivery(message, &envelope, &without_sessions, &sent).await;
        Ok(sent)
    }

    async fn resolve_recipients(
        &self,
        conversation_id: &ConversationId,
        target: &MessageTarget,
    ) -> Result<Vec<Recipient>, SendError> {
        let recipients = match target {
            MessageTarget::Conversation { excluded_users } => self
                .conversations
                .recipients(conversation_id)
                .await?
                .into_iter()
                .filter(|recipient| !excluded_users.contains(&recipient.user_id))
                .collect(),
            MessageTarget::Users { user_ids } => {
                self.conversations.recipients_for_users(conversation_id, user_ids).await?
            },
            MessageTarget::Client { recipients } => recipients.clone(),
        };
        Ok(recipients)
    }

    /// Records users the message did not reach. Never fails the send.
    async fn record_proteus_partial_delivery(
        &self,
        message: &Message,
        envelope: &MessageEnvelope,
        without_sessions: &UsersWithoutSessions,
        sent: &MessageSent,
    ) {
        let (unconfirmed, no_clients): (Vec<UserId>, Vec<UserId>) = sent
            .failed_to_confirm
            .iter()
            .cloned()
            .partition(|user| envelope.user_ids().any(|addressed| addressed == user));

        let already_recorded = without_sessions.user_ids();
        let no_clients: Vec<UserId> =
            no_clients.into_iter().filter(|user| !already_recorded.contains(user)).collect();
        self.record_no_clients_to_deliver(message, &no_clients).await;

        if !unconfirmed.is_empty() {
            self.record_delivery_failure(message, &unconfirmed).await;
        }
    }

    /// Records users with no device the message was encrypted for. Runs
    /// before submission so the record survives a failed send.
    async fn record_no_clients_to_deliver(&self, message: &Message, users: &[UserId]) {
        if users.is_empty() {
            return;
        }
        tracing::warn!(
            msg = %message.log_string(),
            users = users.len(),
            "message not encrypted for some users"
        );
        if let Err(err) = self
            .messages
            .persist_no_clients_to_deliver(&message.conversation_id, &message.id, users)
            .await
        {
            tracing::warn!(msg = %message.log_string(), %err, "failed to record undelivered users");
        }
    }

    async fn record_delivery_failure(&self, message: &Message, users: &[UserId]) {
        tracing::warn!(
            msg = %message.log_string(),
            users = users.len(),
            "delivery not confirmed for some users"
        );
        if let Err(err) = self
            .messages
            .persist_recipients_delivery_failure(&message.conversation_id, &message.id, users)
            .await
        {
            tracing::warn!(msg = %message.log_string(), %err, "failed to record delivery failure");
        }
    }

    /// Post-send bookkeeping. Storage failures are logged; the message was
    /// delivered either way.
    async fn on_sent(&self, message: &Message, server_time: Timestamp) {
        let conversation_id = &message.conversation_id;

        let server_time_to_adopt = match message.content.edited_message_id() {
            Some(edited_message_id) => {
                if let Err(err) = self
                    .messages
                    .update_content_on_edit(
                        conversation_id,
                        edited_message_id,
                        &message.id,
                        &message.content,
                        message.date,
                    )
                    .await
                {
                    tracing::error!(msg = %message.log_string(), %err, "failed to apply edit");
                }
                None
            },
            None => Some(server_time),
        };

        if let Err(err) =
            self.messages.promote_to_sent(conversation_id, &message.id, server_time_to_adopt).await
        {
            tracing::error!(msg = %message.log_string(), %err, "failed to promote message to sent");
        }

        let skew = server_time.millis_since(message.date);
        if skew != 0
            && let Err(err) = self.messages.shift_pending_messages_by(conversation_id, skew).await
        {
            tracing::warn!(msg = %message.log_string(), skew, %err, "failed to shift pending messages");
        }

        if let Some(expiration) = message.expiration {
            self.self_deletion.enqueue_self_deletion(conversation_id, &message.id, expiration);
        }
    }

    /// Broadcasts `message` to users selected by `target` and returns the
    /// server time.
    pub async fn broadcast(
        &self,
        message: BroadcastMessage,
        target: BroadcastTarget,
    ) -> Result<Timestamp, SendError> {
        let mut retry = RetryState::new(self.config.broadcast_retry_budget);

        loop {
            match self.attempt_broadcast(&message, target).await {
                Ok(sent) => {
                    retry.finish();
                    tracing::info!(message_id = %message.id.obfuscated(), "broadcast sent");
                    return Ok(sent.time);
                },
                Err(SendError::Network(NetworkError::ClientsChanged(failure))) => {
                    retry.on_device_set_changed();
                    tracing::warn!(
                        message_id = %message.id.obfuscated(),
                        attempt = retry.attempts(),
                        "recipient devices changed during broadcast"
                    );
                    self.failures.handle_device_set_changed(&failure, None, message.date).await?;
                    if retry.on_reconciled() == RetryDecision::GiveUp {
                        return Err(SendError::RetryBudgetExhausted {
                            attempts: retry.attempts(),
                            last: failure,
                        });
                    }
                },
                Err(err) => {
                    tracing::warn!(message_id = %message.id.obfuscated(), %err, "broadcast failed");
                    return Err(err);
                },
            }
        }
    }

    async fn attempt_broadcast(
        &self,
        message: &BroadcastMessage,
        target: BroadcastTarget,
    ) -> Result<MessageSent, SendError> {
        let recipients = self.broadcast_recipients(message, target).await?;
        let option = BroadcastOption::ReportSome(recipients.iter().map(|r| r.user_id.clone()).collect());

        let mut crypto = self.crypto.begin("broadcast").await?;
        let without_sessions = self.sessions.prepare_recipients(crypto.as_mut(), &recipients).await?;
        let deliverable = without_sessions.filter(&recipients);
        let envelope =
            self.envelopes.create_broadcast_envelope(crypto.as_mut(), &deliverable, message).await?;
        crypto.finish().await?;

        Ok(self.transport.submit_broadcast(&envelope, &option).await?)
    }

    /// Selects broadcast recipients: team members first, de-duplicated,
    /// without the sending device, truncated to the target's limit.
    async fn broadcast_recipients(
        &self,
        message: &BroadcastMessage,
        target: BroadcastTarget,
    ) -> Result<Vec<Recipient>, SendError> {
        let all = self.conversations.all_recipients().await?;
        let (candidates, limit) = match target {
            BroadcastTarget::AllUsers { limit } => {
                (all.team.into_iter().chain(all.others).collect::<Vec<_>>(), limit)
            },
            BroadcastTarget::OnlyTeam { limit } => (all.team, limit),
        };

        let mut selected: Vec<Recipient> = Vec::new();
        for mut recipient in candidates {
            if selected.iter().any(|r| r.user_id == recipient.user_id) {
                continue;
            }
            if recipient.user_id == self.self_user_id {
                recipient.clients.retain(|client| client != &message.sender_client_id);
                if recipient.clients.is_empty() {
                    continue;
                }
            }
            selected.push(recipient);
        }
        selected.truncate(limit);
        Ok(selected)
    }
}
