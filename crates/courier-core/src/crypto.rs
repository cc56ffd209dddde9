//! Boundary to the cryptographic engine.
//!
//! The pipeline never touches key material. Every operation goes through a
//! [`CryptoEngine`] handle obtained from a [`CryptoTransactionProvider`]; the
//! handle is one transaction. Calling [`CryptoEngine::finish`] commits it,
//! dropping the handle without finishing must roll it back, so a cancelled
//! send leaves no partial crypto state behind.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::CryptoError,
    ids::{ClientId, GroupId, UserId},
};

/// Identifies a pairwise session: one per remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    /// Remote user
    pub user_id: UserId,
    /// Remote device
    pub client_id: ClientId,
}

impl SessionId {
    /// Create a session id.
    pub fn new(user_id: UserId, client_id: ClientId) -> Self {
        Self { user_id, client_id }
    }
}

/// One-time key material published by a device for session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKey {
    /// Key id on the backend
    pub id: u32,
    /// Encoded public key bundle
    pub key: Bytes,
}

/// A single crypto transaction.
#[async_trait]
pub trait CryptoEngine: Send {
    /// Whether a pairwise session with the device exists.
    async fn session_exists(&mut self, session: &SessionId) -> Result<bool, CryptoError>;

    /// Creates pairwise sessions from fetched key material.
    async fn create_sessions(&mut self, prekeys: &[(SessionId, PreKey)]) -> Result<(), CryptoError>;

    /// Encrypts `plaintext` for one device.
    async fn encrypt_pairwise(
        &mut self,
        session: &SessionId,
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError>;

    /// Encrypts `plaintext` once for a whole MLS group.
    async fn encrypt_group(&mut self, group_id: &GroupId, plaintext: &[u8])
    -> Result<Bytes, CryptoError>;

    /// Epoch of the local copy of the group.
    async fn group_epoch(&mut self, group_id: &GroupId) -> Result<u64, CryptoError>;

    /// Joins (or rejoins) a group through an external commit built from the
    /// group's published group info.
    async fn join_by_external_commit(
        &mut self,
        group_id: &GroupId,
        group_info: &[u8],
    ) -> Result<(), CryptoError>;

    /// Commits every pending proposal of the group. A no-op when nothing is
    /// pending.
    async fn commit_pending_proposals(&mut self, group_id: &GroupId) -> Result<(), CryptoError>;

    /// Commits the transaction.
    async fn finish(self: Box<Self>) -> Result<(), CryptoError>;
}

/// Opens crypto transactions.
#[async_trait]
pub trait CryptoTransactionProvider: Send + Sync {
    /// Begins a transaction. `label` names the operation for engine logs.
    async fn begin(&self, label: &str) -> Result<Box<dyn CryptoEngine>, CryptoError>;
}
