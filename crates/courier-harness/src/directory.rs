//! In-memory conversations, devices, key material and sub-conversations.
//!
//! The directory keeps two views of every device list: the local one the
//! sender reads recipients from, and the remote one the backend would
//! return. Tests make them diverge to provoke "device set changed", and
//! `fetch_users` copies the remote view over the local one.

#![allow(clippy::disallowed_types, reason = "Directory lock is never held across an await")]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    ClientId, ConversationId, GroupId, NetworkError, PreKey, ProtocolInfo, Recipient,
    StorageError, SubconversationId, UserId,
    error::ConversationNotFound,
    store::{
        BroadcastRecipients, ClientStore, ConversationStore, LegalHoldStatus, PreKeyMap,
        PreKeySource, SubconversationDetails, SubconversationSource,
    },
};

struct ConversationRecord {
    protocol: ProtocolInfo,
    remote_protocol: Option<ProtocolInfo>,
    members: Vec<UserId>,
    legal_hold: LegalHoldStatus,
    group_info: Bytes,
}

#[derive(Default)]
struct DirectoryState {
    conversations: BTreeMap<ConversationId, ConversationRecord>,
    local_clients: BTreeMap<UserId, Vec<ClientId>>,
    remote_clients: BTreeMap<UserId, Vec<ClientId>>,
    local_legal_hold: BTreeSet<UserId>,
    remote_legal_hold: BTreeSet<UserId>,
    team: BTreeSet<UserId>,
    prekeys: BTreeMap<(UserId, ClientId), PreKey>,
    prekey_requests: Vec<Vec<Recipient>>,
    fetched_users: Vec<Vec<UserId>>,
    subconversations: BTreeMap<(ConversationId, SubconversationId), SubconversationDetails>,
    fetch_users_failure: Option<NetworkError>,
}

/// In-memory directory implementing every lookup collaborator of the
/// sender.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a conversation with its members.
    pub fn add_conversation(&self, conversation_id: &ConversationId, protocol: ProtocolInfo, members: &[UserId]) {
        self.lock().conversations.insert(
            conversation_id.clone(),
            ConversationRecord {
                protocol,
                remote_protocol: None,
                members: members.to_vec(),
                legal_hold: LegalHoldStatus::Disabled,
                group_info: Bytes::from_static(b"group-info"),
            },
        );
    }

    /// Sets the protocol the backend reports on the next
    /// `fetch_conversation`.
    pub fn set_remote_protocol(&self, conversation_id: &ConversationId, protocol: ProtocolInfo) {
        if let Some(record) = self.lock().conversations.get_mut(conversation_id) {
            record.remote_protocol = Some(protocol);
        }
    }

    /// Sets a user's devices in both the local and the remote view.
    pub fn set_clients(&self, user_id: &UserId, clients: &[&str]) {
        let clients: Vec<ClientId> = clients.iter().map(|c| ClientId::new(*c)).collect();
        let mut state = self.lock();
        state.local_clients.insert(user_id.clone(), clients.clone());
        state.remote_clients.insert(user_id.clone(), clients);
    }

    /// Sets a user's devices in the remote view only.
    pub fn set_remote_clients(&self, user_id: &UserId, clients: &[&str]) {
        let clients = clients.iter().map(|c| ClientId::new(*c)).collect();
        self.lock().remote_clients.insert(user_id.clone(), clients);
    }

    /// Local device list of a user.
    pub fn local_clients(&self, user_id: &UserId) -> Vec<ClientId> {
        self.lock().local_clients.get(user_id).cloned().unwrap_or_default()
    }

    /// Marks a user as owning a legal-hold device in the remote view.
    pub fn set_remote_legal_hold_device(&self, user_id: &UserId) {
        self.lock().remote_legal_hold.insert(user_id.clone());
    }

    /// Marks a user as owning a legal-hold device in both views.
    pub fn set_legal_hold_device(&self, user_id: &UserId) {
        let mut state = self.lock();
        state.local_legal_hold.insert(user_id.clone());
        state.remote_legal_hold.insert(user_id.clone());
    }

    /// Persisted legal-hold status of a conversation.
    pub fn legal_hold(&self, conversation_id: &ConversationId) -> Option<LegalHoldStatus> {
        self.lock().conversations.get(conversation_id).map(|record| record.legal_hold)
    }

    /// Forces the persisted legal-hold status of a conversation.
    pub fn set_legal_hold(&self, conversation_id: &ConversationId, status: LegalHoldStatus) {
        if let Some(record) = self.lock().conversations.get_mut(conversation_id) {
            record.legal_hold = status;
        }
    }

    /// Adds a user to the self user's team.
    pub fn add_team_member(&self, user_id: &UserId) {
        self.lock().team.insert(user_id.clone());
    }

    /// Publishes key material for a device.
    pub fn publish_prekey(&self, user_id: &UserId, client_id: &str, id: u32) {
        let prekey = PreKey { id, key: Bytes::from(format!("prekey-{id}")) };
        self.lock().prekeys.insert((user_id.clone(), ClientId::new(client_id)), prekey);
    }

    /// Every batched key-material request, in order.
    pub fn prekey_requests(&self) -> Vec<Vec<Recipient>> {
        self.lock().prekey_requests.clone()
    }

    /// Every `fetch_users` call, in order.
    pub fn fetched_users(&self) -> Vec<Vec<UserId>> {
        self.lock().fetched_users.clone()
    }

    /// Makes every later `fetch_users` fail with `error`.
    pub fn fail_fetch_users(&self, error: NetworkError) {
        self.lock().fetch_users_failure = Some(error);
    }

    /// Registers a sub-conversation as the backend reports it.
    pub fn add_subconversation(&self, details: SubconversationDetails) {
        self.lock().subconversations.insert((details.parent_id.clone(), details.id.clone()), details);
    }

    fn record<'a>(
        state: &'a DirectoryState,
        conversation_id: &ConversationId,
    ) -> Result<&'a ConversationRecord, ConversationNotFound> {
        state.conversations.get(conversation_id).ok_or_else(|| ConversationNotFound(conversation_id.clone()))
    }

    fn recipients_of(state: &DirectoryState, users: &[UserId]) -> Vec<Recipient> {
        users
            .iter()
            .filter_map(|user_id| {
                let clients = state.local_clients.get(user_id)?;
                (!clients.is_empty()).then(|| Recipient::new(user_id.clone(), clients.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl ConversationStore for MemoryDirectory {
    async fn protocol_info(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ProtocolInfo, StorageError> {
        Ok(Self::record(&self.lock(), conversation_id)?.protocol.clone())
    }

    async fn recipients(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Recipient>, StorageError> {
        let state = self.lock();
        let members = Self::record(&state, conversation_id)?.members.clone();
        Ok(Self::recipients_of(&state, &members))
    }

    async fn recipients_for_users(
        &self,
        conversation_id: &ConversationId,
        users: &[UserId],
    ) -> Result<Vec<Recipient>, StorageError> {
        let state = self.lock();
        let members: Vec<UserId> = Self::record(&state, conversation_id)?
            .members
            .iter()
            .filter(|member| users.contains(member))
            .cloned()
            .collect();
        Ok(Self::recipients_of(&state, &members))
    }

    async fn all_recipients(&self) -> Result<BroadcastRecipients, StorageError> {
        let state = self.lock();
        let users: BTreeSet<UserId> = state
            .conversations
            .values()
            .flat_map(|record| record.members.iter().cloned())
            .collect();
        let (team, others): (Vec<UserId>, Vec<UserId>) =
            users.into_iter().partition(|user| state.team.contains(user));

        Ok(BroadcastRecipients {
            team: Self::recipients_of(&state, &team),
            others: Self::recipients_of(&state, &others),
        })
    }

    async fn fetch_conversation(&self, conversation_id: &ConversationId) -> Result<(), NetworkError> {
        let mut state = self.lock();
        let Some(record) = state.conversations.get_mut(conversation_id) else {
            return Err(NetworkError::Server { status: 404, label: "no-conversation".into() });
        };
        if let Some(remote) = record.remote_protocol.take() {
            record.protocol = remote;
        }
        Ok(())
    }

    async fn fetch_group_info(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Bytes, NetworkError> {
        self.lock()
            .conversations
            .get(conversation_id)
            .map(|record| record.group_info.clone())
            .ok_or_else(|| NetworkError::Server { status: 404, label: "no-group-info".into() })
    }

    async fn member_ids(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<UserId>, StorageError> {
        Ok(Self::record(&self.lock(), conversation_id)?.members.clone())
    }

    async fn legal_hold_status(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LegalHoldStatus, StorageError> {
        Ok(Self::record(&self.lock(), conversation_id)?.legal_hold)
    }

    async fn update_legal_hold_status(
        &self,
        conversation_id: &ConversationId,
        status: LegalHoldStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let record = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ConversationNotFound(conversation_id.clone()))?;
        record.legal_hold = status;
        Ok(())
    }
}

#[async_trait]
impl ClientStore for MemoryDirectory {
    async fn fetch_users(&self, users: &[UserId]) -> Result<(), NetworkError> {
        let mut state = self.lock();
        state.fetched_users.push(users.to_vec());
        if let Some(error) = state.fetch_users_failure.clone() {
            return Err(error);
        }

        for user_id in users {
            let remote = state.remote_clients.get(user_id).cloned().unwrap_or_default();
            state.local_clients.insert(user_id.clone(), remote);
            if state.remote_legal_hold.contains(user_id) {
                state.local_legal_hold.insert(user_id.clone());
            } else {
                state.local_legal_hold.remove(user_id);
            }
        }
        Ok(())
    }

    async fn store_user_clients(
        &self,
        user_id: &UserId,
        clients: &[ClientId],
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let known = state.local_clients.entry(user_id.clone()).or_default();
        for client in clients {
            if !known.contains(client) {
                known.push(client.clone());
            }
        }
        Ok(())
    }

    async fn remove_user_clients(
        &self,
        user_id: &UserId,
        clients: &[ClientId],
    ) -> Result<(), StorageError> {
        if let Some(known) = self.lock().local_clients.get_mut(user_id) {
            known.retain(|client| !clients.contains(client));
        }
        Ok(())
    }

    async fn users_with_legal_hold_device(
        &self,
        users: &[UserId],
    ) -> Result<Vec<UserId>, StorageError> {
        let state = self.lock();
        Ok(users.iter().filter(|user| state.local_legal_hold.contains(*user)).cloned().collect())
    }
}

#[async_trait]
impl PreKeySource for MemoryDirectory {
    async fn fetch_prekeys(&self, devices: &[Recipient]) -> Result<PreKeyMap, NetworkError> {
        let mut state = self.lock();
        state.prekey_requests.push(devices.to_vec());

        let mut fetched = PreKeyMap::new();
        for recipient in devices {
            let entries = recipient
                .clients
                .iter()
                .map(|client_id| {
                    let prekey =
                        state.prekeys.get(&(recipient.user_id.clone(), client_id.clone())).cloned();
                    (client_id.clone(), prekey)
                })
                .collect();
            fetched.insert(recipient.user_id.clone(), entries);
        }
        Ok(fetched)
    }
}

#[async_trait]
impl SubconversationSource for MemoryDirectory {
    async fn fetch_remote_details(
        &self,
        conversation_id: &ConversationId,
        subconversation_id: &SubconversationId,
    ) -> Result<SubconversationDetails, NetworkError> {
        self.lock()
            .subconversations
            .get(&(conversation_id.clone(), subconversation_id.clone()))
            .cloned()
            .ok_or_else(|| NetworkError::Server { status: 404, label: "no-subconversation".into() })
    }

    async fn fetch_group_info(
        &self,
        conversation_id: &ConversationId,
        subconversation_id: &SubconversationId,
    ) -> Result<Bytes, NetworkError> {
        let state = self.lock();
        if state.subconversations.contains_key(&(conversation_id.clone(), subconversation_id.clone())) {
            Ok(Bytes::from_static(b"subconversation-group-info"))
        } else {
            Err(NetworkError::Server { status: 404, label: "no-subconversation".into() })
        }
    }

    async fn is_subconversation_group(&self, group_id: &GroupId) -> Result<bool, StorageError> {
        Ok(self.lock().subconversations.values().any(|details| &details.group_id == group_id))
    }
}
