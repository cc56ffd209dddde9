//! Self-deleting message countdowns.
//!
//! Every ephemeral message gets at most one countdown task, keyed by
//! (conversation, message). The registry owns the tasks: dropping a slot
//! aborts its task, so tearing down the handler cancels every countdown while
//! the persisted start times survive for the next session.

#![allow(clippy::disallowed_types, reason = "Registry lock is never held across an await")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use courier_core::{
    ConversationId, Environment, ExpirationData, MessageId, MessageStatus, SelfDeletionStatus,
    StorageError,
    store::{MessageStore, StoredMessage},
};
use tokio::{sync::watch, task::AbortHandle};

use crate::config::SelfDeletionConfig;

type TimerKey = (ConversationId, MessageId);

/// Accepts messages whose self-deletion countdown should run.
pub trait SelfDeletionScheduler: Send + Sync {
    /// Starts the countdown for a message unless one is already running.
    fn enqueue_self_deletion(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        expiration: ExpirationData,
    );
}

/// Scheduler that never deletes anything.
pub struct NoSelfDeletion;

impl SelfDeletionScheduler for NoSelfDeletion {
    fn enqueue_self_deletion(&self, _: &ConversationId, _: &MessageId, _: ExpirationData) {}
}

struct TimerSlot {
    handle: Option<AbortHandle>,
    remaining: watch::Receiver<Duration>,
}

impl TimerSlot {
    /// Releases the slot without aborting its task.
    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Shared<E: Environment> {
    env: E,
    messages: Arc<dyn MessageStore>,
    config: SelfDeletionConfig,
    timers: Mutex<HashMap<TimerKey, TimerSlot>>,
}

impl<E: Environment> Shared<E> {
    fn lock_timers(&self) -> MutexGuard<'_, HashMap<TimerKey, TimerSlot>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &TimerKey) {
        if let Some(mut slot) = self.lock_timers().remove(key) {
            slot.disarm();
        }
    }

    async fn run_countdown(
        self: Arc<Self>,
        key: TimerKey,
        expiration: ExpirationData,
        remaining_tx: watch::Sender<Duration>,
    ) {
        let (conversation_id, message_id) = &key;

        let start = match expiration.status {
            SelfDeletionStatus::Started { start } => start,
            SelfDeletionStatus::NotStarted => {
                let now = self.env.wall_clock();
                if let Err(err) =
                    self.messages.mark_self_deletion_start(conversation_id, message_id, now).await
                {
                    tracing::error!(
                        conversation = %conversation_id,
                        message_id = %message_id.obfuscated(),
                        %err,
                        "failed to persist self-deletion start"
                    );
                    self.release(&key);
                    return;
                }
                now
            },
        };
        let due = start.saturating_add(expiration.expire_after);

        loop {
            let remaining = due.saturating_duration_since(self.env.wall_clock());
            remaining_tx.send_replace(remaining);
            if remaining.is_zero() {
                break;
            }
            self.env.sleep(remaining.min(self.config.tick)).await;
        }

        match self.messages.delete_message(conversation_id, message_id).await {
            Ok(()) => tracing::debug!(
                conversation = %conversation_id,
                message_id = %message_id.obfuscated(),
                "self-deleting message deleted"
            ),
            Err(err) => tracing::error!(
                conversation = %conversation_id,
                message_id = %message_id.obfuscated(),
                %err,
                "failed to delete self-deleting message"
            ),
        }

        self.release(&key);
    }
}

/// Owns the countdown of every self-deleting message of a session.
pub struct EphemeralMessageDeletionHandler<E: Environment> {
    shared: Arc<Shared<E>>,
}

impl<E: Environment> EphemeralMessageDeletionHandler<E> {
    /// Create a handler with no running countdowns.
    pub fn new(env: E, messages: Arc<dyn MessageStore>, config: SelfDeletionConfig) -> Self {
        Self {
            shared: Arc::new(Shared { env, messages, config, timers: Mutex::new(HashMap::new()) }),
        }
    }

    /// Starts the countdown of a stored message.
    ///
    /// Messages without expiration data and messages still pending delivery
    /// are ignored; the latter start once sent.
    pub async fn start_self_deletion(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), StorageError> {
        let StoredMessage::Regular(message) =
            self.shared.messages.message_by_id(conversation_id, message_id).await?
        else {
            return Ok(());
        };

        match message.expiration {
            Some(expiration) if message.status != MessageStatus::Pending => {
                self.enqueue_self_deletion(conversation_id, message_id, expiration);
            },
            _ => {},
        }
        Ok(())
    }

    /// Resumes the countdown of every message whose countdown started in an
    /// earlier session. Remaining time is recomputed from the persisted
    /// start, so time spent offline counts.
    pub async fn enqueue_pending_self_deletion_messages(&self) -> Result<usize, StorageError> {
        let pending = self.shared.messages.pending_ephemeral_messages().await?;
        let count = pending.len();

        for message in pending {
            let expiration = ExpirationData {
                expire_after: message.expire_after,
                status: SelfDeletionStatus::Started { start: message.start },
            };
            self.enqueue_self_deletion(&message.conversation_id, &message.message_id, expiration);
        }

        tracing::debug!(count, "resumed self-deletion countdowns");
        Ok(count)
    }

    /// Deletes every message whose countdown ended while no session was
    /// running. Returns how many were deleted.
    pub async fn delete_already_ended_self_deletion_messages(&self) -> Result<usize, StorageError> {
        let now = self.shared.env.wall_clock();
        let ended = self.shared.messages.ended_ephemeral_messages(now).await?;

        let mut deleted = 0;
        for message in ended {
            match self
                .shared
                .messages
                .delete_message(&message.conversation_id, &message.message_id)
                .await
            {
                Ok(()) => deleted += 1,
                Err(err) => tracing::warn!(
                    conversation = %message.conversation_id,
                    message_id = %message.message_id.obfuscated(),
                    %err,
                    "failed to delete ended self-deleting message"
                ),
            }
        }
        Ok(deleted)
    }

    /// Live remaining time of a running countdown.
    pub fn observe_time_remaining(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<watch::Receiver<Duration>> {
        self.shared
            .lock_timers()
            .get(&(conversation_id.clone(), message_id.clone()))
            .map(|slot| slot.remaining.clone())
    }

    /// Whether a countdown is running for the message.
    pub fn is_scheduled(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.shared.lock_timers().contains_key(&(conversation_id.clone(), message_id.clone()))
    }

    /// Number of running countdowns.
    pub fn active_countdowns(&self) -> usize {
        self.shared.lock_timers().len()
    }

    /// Cancels every running countdown. Persisted start times are kept.
    pub fn shutdown(&self) {
        let slots: Vec<TimerSlot> = self.shared.lock_timers().drain().map(|(_, slot)| slot).collect();
        tracing::debug!(cancelled = slots.len(), "self-deletion countdowns cancelled");
        drop(slots);
    }
}

impl<E: Environment> SelfDeletionScheduler for EphemeralMessageDeletionHandler<E> {
    fn enqueue_self_deletion(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        expiration: ExpirationData,
    ) {
        let key = (conversation_id.clone(), message_id.clone());

        let mut timers = self.shared.lock_timers();
        if timers.contains_key(&key) {
            tracing::debug!(
                conversation = %conversation_id,
                message_id = %message_id.obfuscated(),
                "self-deletion countdown already running"
            );
            return;
        }

        let remaining = expiration.time_left(self.shared.env.wall_clock());
        let (remaining_tx, remaining_rx) = watch::channel(remaining);
        let task = tokio::spawn(Arc::clone(&self.shared).run_countdown(
            key.clone(),
            expiration,
            remaining_tx,
        ));

        tracing::debug!(
            conversation = %conversation_id,
            message_id = %message_id.obfuscated(),
            due = ?expiration.deletion_due(),
            ?remaining,
            "self-deletion countdown started"
        );
        timers.insert(key, TimerSlot { handle: Some(task.abort_handle()), remaining: remaining_rx });
    }
}

impl<E: Environment> Drop for EphemeralMessageDeletionHandler<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
