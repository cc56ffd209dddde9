//! Scripted backend.
//!
//! Responses are consumed in order across every submission kind. Once the
//! script runs out every submission is accepted at the configured server
//! time.

#![allow(clippy::disallowed_types, reason = "Transport lock is never held across an await")]

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use courier_core::{
    BroadcastOption, ConversationId, MessageEnvelope, MessageSent, MessageTarget,
    MlsOutgoingMessage, NetworkError, Timestamp, Transport, UserId,
};

use crate::sim_env::DEFAULT_EPOCH;

/// A submitted pairwise envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedEnvelope {
    /// Conversation the envelope was submitted to
    pub conversation_id: ConversationId,
    /// The envelope
    pub envelope: MessageEnvelope,
    /// Target passed along with it
    pub target: MessageTarget,
}

struct TransportState {
    script: VecDeque<Result<MessageSent, NetworkError>>,
    server_time: Timestamp,
    latency: Option<Duration>,
    envelopes: Vec<SubmittedEnvelope>,
    group_messages: Vec<MlsOutgoingMessage>,
    broadcasts: Vec<(MessageEnvelope, BroadcastOption)>,
}

/// Scripted [`Transport`].
pub struct SimTransport {
    state: Mutex<TransportState>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    /// Transport accepting everything at [`DEFAULT_EPOCH`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState {
                script: VecDeque::new(),
                server_time: DEFAULT_EPOCH,
                latency: None,
                envelopes: Vec::new(),
                group_messages: Vec::new(),
                broadcasts: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Server time reported once the script is exhausted.
    pub fn set_server_time(&self, time: Timestamp) {
        self.lock().server_time = time;
    }

    /// Delay before every submission is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Queues a rejection.
    pub fn reject_with(&self, error: NetworkError) {
        self.lock().script.push_back(Err(error));
    }

    /// Queues the same rejection `times` times.
    pub fn reject_repeatedly(&self, error: &NetworkError, times: usize) {
        let mut state = self.lock();
        for _ in 0..times {
            state.script.push_back(Err(error.clone()));
        }
    }

    /// Queues an acceptance with unconfirmed users.
    pub fn accept_unconfirmed(&self, time: Timestamp, failed_to_confirm: Vec<UserId>) {
        self.lock().script.push_back(Ok(MessageSent { time, failed_to_confirm }));
    }

    /// Every submitted envelope, in order.
    pub fn envelopes(&self) -> Vec<SubmittedEnvelope> {
        self.lock().envelopes.clone()
    }

    /// Every submitted group message, in order.
    pub fn group_messages(&self) -> Vec<MlsOutgoingMessage> {
        self.lock().group_messages.clone()
    }

    /// Every submitted broadcast, in order.
    pub fn broadcasts(&self) -> Vec<(MessageEnvelope, BroadcastOption)> {
        self.lock().broadcasts.clone()
    }

    /// Submissions of any kind.
    pub fn submissions(&self) -> usize {
        let state = self.lock();
        state.envelopes.len() + state.group_messages.len() + state.broadcasts.len()
    }

    async fn respond(&self) -> Result<MessageSent, NetworkError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let server_time = state.server_time;
        let response = state.script.pop_front().unwrap_or_else(|| Ok(MessageSent::at(server_time)));
        if let Err(err) = &response {
            tracing::debug!(%err, "scripted rejection");
        }
        response
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn submit_envelope(
        &self,
        conversation_id: &ConversationId,
        envelope: &MessageEnvelope,
        target: &MessageTarget,
    ) -> Result<MessageSent, NetworkError> {
        self.lock().envelopes.push(SubmittedEnvelope {
            conversation_id: conversation_id.clone(),
            envelope: envelope.clone(),
            target: target.clone(),
        });
        self.respond().await
    }

    async fn submit_group_message(
        &self,
        message: &MlsOutgoingMessage,
    ) -> Result<MessageSent, NetworkError> {
        self.lock().group_messages.push(message.clone());
        self.respond().await
    }

    async fn submit_broadcast(
        &self,
        envelope: &MessageEnvelope,
        option: &BroadcastOption,
    ) -> Result<MessageSent, NetworkError> {
        self.lock().broadcasts.push((envelope.clone(), option.clone()));
        self.respond().await
    }
}
