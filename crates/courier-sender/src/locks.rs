//! Per-conversation send serialization.

#![allow(clippy::disallowed_types, reason = "Map lock is never held across an await")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use courier_core::ConversationId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per conversation.
///
/// Entries are dropped once nobody holds or waits on them, so the map only
/// grows with the number of conversations being sent to concurrently.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `conversation_id`.
    pub async fn lock(&self, conversation_id: &ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(conversation_id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_conversation_is_serialized() {
        let locks = Arc::new(ConversationLocks::new());
        let conversation = ConversationId::new("c1", "a.example");

        let guard = locks.lock(&conversation).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let conversation = conversation.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&conversation).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_conversations_do_not_block() {
        let locks = ConversationLocks::new();

        let _a = locks.lock(&ConversationId::new("a", "x.example")).await;
        let _b = locks.lock(&ConversationId::new("b", "x.example")).await;
    }
}
