//! In-memory message and proposal timer stores.
//!
//! Every mutation is recorded so tests can assert on what the pipeline did,
//! not only on the final state.

#![allow(clippy::disallowed_types, reason = "Store locks are never held across an await")]

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use courier_core::{
    ConversationId, GroupId, Message, MessageContent, MessageId, MessageStatus, ProposalTimer,
    SelfDeletionStatus, StorageError, Timestamp, UserId,
    store::{EphemeralMessage, MessageStore, ProposalTimerStore, StoredMessage, SystemNotice},
};
use tokio::sync::broadcast;

type MessageKey = (ConversationId, MessageId);

/// One recorded edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEdit {
    /// Message that was replaced
    pub edited_message_id: MessageId,
    /// Id the message was re-keyed to
    pub new_message_id: MessageId,
    /// When the edit was authored
    pub edit_time: Timestamp,
}

#[derive(Default)]
struct MessageState {
    messages: BTreeMap<MessageKey, StoredMessage>,
    status_updates: Vec<(MessageId, MessageStatus)>,
    promotions: Vec<(MessageId, Option<Timestamp>)>,
    edits: Vec<RecordedEdit>,
    shifts: Vec<(ConversationId, i64)>,
    no_clients_to_deliver: Vec<(MessageId, Vec<UserId>)>,
    delivery_failures: Vec<(MessageId, Vec<UserId>)>,
    self_deletion_starts: Vec<(MessageId, Timestamp)>,
    deleted: Vec<MessageId>,
    notices: Vec<SystemNotice>,
    fail_deletes: bool,
}

/// In-memory [`MessageStore`].
#[derive(Default)]
pub struct MemoryMessageStore {
    state: Mutex<MessageState>,
}

impl MemoryMessageStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MessageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a regular message.
    pub fn insert(&self, message: Message) {
        let key = (message.conversation_id.clone(), message.id.clone());
        self.lock().messages.insert(key, StoredMessage::Regular(message));
    }

    /// Stores a system message under `message_id`.
    pub fn insert_system(&self, message_id: MessageId, notice: SystemNotice) {
        let key = (notice.conversation_id.clone(), message_id);
        self.lock().messages.insert(key, StoredMessage::System(notice));
    }

    /// Current copy of a regular message.
    pub fn message(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<Message> {
        match self.lock().messages.get(&(conversation_id.clone(), message_id.clone())) {
            Some(StoredMessage::Regular(message)) => Some(message.clone()),
            Some(StoredMessage::System(_)) | None => None,
        }
    }

    /// Current status of a regular message.
    pub fn status(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<MessageStatus> {
        self.message(conversation_id, message_id).map(|message| message.status)
    }

    /// Whether the store still holds the message.
    pub fn contains(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.lock().messages.contains_key(&(conversation_id.clone(), message_id.clone()))
    }

    /// Every explicit status update, in order.
    pub fn status_updates(&self) -> Vec<(MessageId, MessageStatus)> {
        self.lock().status_updates.clone()
    }

    /// Every promotion to `Sent`, in order.
    pub fn promotions(&self) -> Vec<(MessageId, Option<Timestamp>)> {
        self.lock().promotions.clone()
    }

    /// Every applied edit, in order.
    pub fn edits(&self) -> Vec<RecordedEdit> {
        self.lock().edits.clone()
    }

    /// Every pending-message shift, in order.
    pub fn shifts(&self) -> Vec<(ConversationId, i64)> {
        self.lock().shifts.clone()
    }

    /// Users recorded as having no device to deliver to.
    pub fn no_clients_to_deliver(&self) -> Vec<(MessageId, Vec<UserId>)> {
        self.lock().no_clients_to_deliver.clone()
    }

    /// Users recorded as delivery failures.
    pub fn delivery_failures(&self) -> Vec<(MessageId, Vec<UserId>)> {
        self.lock().delivery_failures.clone()
    }

    /// Persisted self-deletion starts.
    pub fn self_deletion_starts(&self) -> Vec<(MessageId, Timestamp)> {
        self.lock().self_deletion_starts.clone()
    }

    /// Deleted messages, in deletion order.
    pub fn deleted(&self) -> Vec<MessageId> {
        self.lock().deleted.clone()
    }

    /// Inserted system notices.
    pub fn notices(&self) -> Vec<SystemNotice> {
        self.lock().notices.clone()
    }

    /// Makes every later delete fail.
    pub fn fail_deletes(&self) {
        self.lock().fail_deletes = true;
    }

    fn regular_mut<'a>(
        state: &'a mut MessageState,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<&'a mut Message, StorageError> {
        match state.messages.get_mut(&(conversation_id.clone(), message_id.clone())) {
            Some(StoredMessage::Regular(message)) => Ok(message),
            Some(StoredMessage::System(_)) | None => {
                Err(StorageError::not_found(format!("message {message_id}")))
            },
        }
    }

    fn ephemeral(message: &Message) -> Option<EphemeralMessage> {
        let expiration = message.expiration?;
        let SelfDeletionStatus::Started { start } = expiration.status else {
            return None;
        };
        Some(EphemeralMessage {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            sender_user_id: message.sender_user_id.clone(),
            expire_after: expiration.expire_after,
            start,
        })
    }

    fn ephemerals(&self) -> Vec<EphemeralMessage> {
        self.lock()
            .messages
            .values()
            .filter_map(|stored| match stored {
                StoredMessage::Regular(message) => Self::ephemeral(message),
                StoredMessage::System(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn message_by_id(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<StoredMessage, StorageError> {
        self.lock()
            .messages
            .get(&(conversation_id.clone(), message_id.clone()))
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("message {message_id}")))
    }

    async fn update_status(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.status_updates.push((message_id.clone(), status));
        if let Ok(message) = Self::regular_mut(&mut state, conversation_id, message_id) {
            message.status = status;
        }
        Ok(())
    }

    async fn promote_to_sent(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        server_time: Option<Timestamp>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.promotions.push((message_id.clone(), server_time));
        let message = Self::regular_mut(&mut state, conversation_id, message_id)?;
        message.status = MessageStatus::Sent;
        if let Some(server_time) = server_time {
            message.date = server_time;
        }
        Ok(())
    }

    async fn update_content_on_edit(
        &self,
        conversation_id: &ConversationId,
        edited_message_id: &MessageId,
        new_message_id: &MessageId,
        new_content: &MessageContent,
        edit_time: Timestamp,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let Some(StoredMessage::Regular(mut original)) =
            state.messages.remove(&(conversation_id.clone(), edited_message_id.clone()))
        else {
            return Err(StorageError::not_found(format!("message {edited_message_id}")));
        };

        original.id = new_message_id.clone();
        original.content = new_content.clone();
        state
            .messages
            .insert((conversation_id.clone(), new_message_id.clone()), StoredMessage::Regular(original));
        state.edits.push(RecordedEdit {
            edited_message_id: edited_message_id.clone(),
            new_message_id: new_message_id.clone(),
            edit_time,
        });
        Ok(())
    }

    async fn shift_pending_messages_by(
        &self,
        conversation_id: &ConversationId,
        millis: i64,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.shifts.push((conversation_id.clone(), millis));
        for ((conversation, _), stored) in &mut state.messages {
            if let StoredMessage::Regular(message) = stored
                && conversation == conversation_id
                && message.status == MessageStatus::Pending
            {
                message.date = message.date.shifted_by(millis);
            }
        }
        Ok(())
    }

    async fn persist_no_clients_to_deliver(
        &self,
        _conversation_id: &ConversationId,
        message_id: &MessageId,
        users: &[UserId],
    ) -> Result<(), StorageError> {
        self.lock().no_clients_to_deliver.push((message_id.clone(), users.to_vec()));
        Ok(())
    }

    async fn persist_recipients_delivery_failure(
        &self,
        _conversation_id: &ConversationId,
        message_id: &MessageId,
        users: &[UserId],
    ) -> Result<(), StorageError> {
        self.lock().delivery_failures.push((message_id.clone(), users.to_vec()));
        Ok(())
    }

    async fn pending_ephemeral_messages(&self) -> Result<Vec<EphemeralMessage>, StorageError> {
        Ok(self.ephemerals())
    }

    async fn ended_ephemeral_messages(
        &self,
        now: Timestamp,
    ) -> Result<Vec<EphemeralMessage>, StorageError> {
        Ok(self
            .ephemerals()
            .into_iter()
            .filter(|message| message.start.saturating_add(message.expire_after) <= now)
            .collect())
    }

    async fn mark_self_deletion_start(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        start: Timestamp,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let message = Self::regular_mut(&mut state, conversation_id, message_id)?;
        if let Some(expiration) = message.expiration.as_mut() {
            expiration.status = SelfDeletionStatus::Started { start };
        }
        state.self_deletion_starts.push((message_id.clone(), start));
        Ok(())
    }

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(StorageError::Backend { reason: "delete rejected".into() });
        }
        state.messages.remove(&(conversation_id.clone(), message_id.clone()));
        state.deleted.push(message_id.clone());
        Ok(())
    }

    async fn insert_system_notice(&self, notice: SystemNotice) -> Result<(), StorageError> {
        self.lock().notices.push(notice);
        Ok(())
    }
}

#[derive(Default)]
struct TimerState {
    persisted: BTreeMap<GroupId, ProposalTimer>,
    in_memory: BTreeMap<GroupId, ProposalTimer>,
}

/// In-memory [`ProposalTimerStore`] publishing every set timer on a
/// broadcast channel.
pub struct MemoryProposalTimerStore {
    state: Mutex<TimerState>,
    published: broadcast::Sender<ProposalTimer>,
}

impl Default for MemoryProposalTimerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProposalTimerStore {
    /// Empty store.
    pub fn new() -> Self {
        let (published, _) = broadcast::channel(64);
        Self { state: Mutex::new(TimerState::default()), published }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists a timer without publishing it, as if written by an earlier
    /// session.
    pub fn preload(&self, timer: ProposalTimer) {
        self.lock().persisted.insert(timer.group_id.clone(), timer);
    }

    /// Timer kept only in memory for `group_id`.
    pub fn in_memory_timer(&self, group_id: &GroupId) -> Option<ProposalTimer> {
        self.lock().in_memory.get(group_id).cloned()
    }

    /// Persisted timer for `group_id`.
    pub fn persisted_timer(&self, group_id: &GroupId) -> Option<ProposalTimer> {
        self.lock().persisted.get(group_id).cloned()
    }
}

#[async_trait]
impl ProposalTimerStore for MemoryProposalTimerStore {
    async fn set_proposal_timer(
        &self,
        timer: ProposalTimer,
        in_memory: bool,
    ) -> Result<(), StorageError> {
        {
            let mut state = self.lock();
            let table = if in_memory { &mut state.in_memory } else { &mut state.persisted };
            table.insert(timer.group_id.clone(), timer.clone());
        }
        // No subscriber is fine: the timer is picked up when sync goes live.
        let _ = self.published.send(timer);
        Ok(())
    }

    async fn persisted_timers(&self) -> Result<Vec<ProposalTimer>, StorageError> {
        let state = self.lock();
        Ok(state.persisted.values().chain(state.in_memory.values()).cloned().collect())
    }

    async fn clear_proposal_timer(&self, fired: &ProposalTimer) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        for table in [&mut state.persisted, &mut state.in_memory] {
            if table.get(&fired.group_id) == Some(fired) {
                table.remove(&fired.group_id);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProposalTimer> {
        self.published.subscribe()
    }
}
