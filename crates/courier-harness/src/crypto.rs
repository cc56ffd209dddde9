//! Simulated crypto engine.
//!
//! "Encryption" prefixes the plaintext with the session or group it was
//! encrypted for, which is enough for tests to check that every device got
//! exactly the payload it should. Transactions work on a snapshot of the
//! committed state and merge it back on `finish`; dropping a transaction
//! discards it and counts a rollback.

#![allow(clippy::disallowed_types, reason = "Engine lock is never held across an await")]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    CryptoEngine, CryptoError, CryptoTransactionProvider, GroupId, PreKey, SessionId,
};

#[derive(Debug, Clone, Default)]
struct EngineState {
    sessions: BTreeSet<SessionId>,
    groups: BTreeMap<GroupId, u64>,
}

#[derive(Default)]
struct Shared {
    committed: EngineState,
    labels: Vec<String>,
    finished: usize,
    rolled_back: usize,
    created_sessions: Vec<SessionId>,
    pairwise_encryptions: Vec<SessionId>,
    group_encryptions: Vec<GroupId>,
    commits: Vec<GroupId>,
    joins: Vec<GroupId>,
    active_commits: usize,
    max_active_commits: usize,
    fail_encryption_for: BTreeSet<SessionId>,
    fail_commits: bool,
    commit_delay: Option<Duration>,
    join_epochs: BTreeMap<GroupId, u64>,
}

/// Simulated [`CryptoTransactionProvider`].
#[derive(Clone, Default)]
pub struct SimCrypto {
    shared: Arc<Mutex<Shared>>,
}

impl SimCrypto {
    /// Engine with no sessions and no groups.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a committed session.
    pub fn add_session(&self, session: SessionId) {
        self.lock().committed.sessions.insert(session);
    }

    /// Whether a committed session exists.
    pub fn has_session(&self, session: &SessionId) -> bool {
        self.lock().committed.sessions.contains(session)
    }

    /// Sets the committed epoch of a group, creating it if needed.
    pub fn set_group_epoch(&self, group_id: &GroupId, epoch: u64) {
        self.lock().committed.groups.insert(group_id.clone(), epoch);
    }

    /// Committed epoch of a group.
    pub fn group_epoch(&self, group_id: &GroupId) -> Option<u64> {
        self.lock().committed.groups.get(group_id).copied()
    }

    /// Epoch a group lands in after an external-commit join.
    pub fn set_join_epoch(&self, group_id: &GroupId, epoch: u64) {
        self.lock().join_epochs.insert(group_id.clone(), epoch);
    }

    /// Makes every encryption for `session` fail.
    pub fn fail_encryption_for(&self, session: SessionId) {
        self.lock().fail_encryption_for.insert(session);
    }

    /// Makes every proposal commit fail.
    pub fn fail_commits(&self) {
        self.lock().fail_commits = true;
    }

    /// Makes every proposal commit take `delay`.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.lock().commit_delay = Some(delay);
    }

    /// Labels of every transaction begun, in order.
    pub fn transactions(&self) -> Vec<String> {
        self.lock().labels.clone()
    }

    /// Transactions committed with `finish`.
    pub fn finished(&self) -> usize {
        self.lock().finished
    }

    /// Transactions dropped without `finish`.
    pub fn rolled_back(&self) -> usize {
        self.lock().rolled_back
    }

    /// Sessions created from key material, in order.
    pub fn created_sessions(&self) -> Vec<SessionId> {
        self.lock().created_sessions.clone()
    }

    /// Every pairwise encryption attempted, in order.
    pub fn pairwise_encryptions(&self) -> Vec<SessionId> {
        self.lock().pairwise_encryptions.clone()
    }

    /// Every group encryption, in order.
    pub fn group_encryptions(&self) -> Vec<GroupId> {
        self.lock().group_encryptions.clone()
    }

    /// Every successful proposal commit, in order.
    pub fn commits(&self) -> Vec<GroupId> {
        self.lock().commits.clone()
    }

    /// Every external-commit join, in order.
    pub fn joins(&self) -> Vec<GroupId> {
        self.lock().joins.clone()
    }

    /// Highest number of proposal commits ever in flight at once.
    pub fn max_concurrent_commits(&self) -> usize {
        self.lock().max_active_commits
    }

    /// Plaintext of a pairwise ciphertext produced for `session`.
    pub fn decrypt_pairwise(session: &SessionId, ciphertext: &[u8]) -> Option<Vec<u8>> {
        ciphertext.strip_prefix(pairwise_prefix(session).as_slice()).map(<[u8]>::to_vec)
    }

    /// Plaintext of a group ciphertext produced for `group_id`.
    pub fn decrypt_group(group_id: &GroupId, ciphertext: &[u8]) -> Option<Vec<u8>> {
        ciphertext.strip_prefix(group_prefix(group_id).as_slice()).map(<[u8]>::to_vec)
    }
}

fn pairwise_prefix(session: &SessionId) -> Vec<u8> {
    format!("pairwise|{}|{}|", session.user_id, session.client_id).into_bytes()
}

fn group_prefix(group_id: &GroupId) -> Vec<u8> {
    format!("group|{group_id}|").into_bytes()
}

#[async_trait]
impl CryptoTransactionProvider for SimCrypto {
    async fn begin(&self, label: &str) -> Result<Box<dyn CryptoEngine>, CryptoError> {
        let working = {
            let mut shared = self.lock();
            shared.labels.push(label.to_owned());
            shared.committed.clone()
        };
        Ok(Box::new(SimTransaction { crypto: self.clone(), working, done: false }))
    }
}

struct SimTransaction {
    crypto: SimCrypto,
    working: EngineState,
    done: bool,
}

impl SimTransaction {
    fn group_error(group_id: &GroupId, reason: &str) -> CryptoError {
        CryptoError::Group { group_id: group_id.clone(), reason: reason.to_owned() }
    }
}

impl Drop for SimTransaction {
    fn drop(&mut self) {
        if !self.done {
            self.crypto.lock().rolled_back += 1;
        }
    }
}

#[async_trait]
impl CryptoEngine for SimTransaction {
    async fn session_exists(&mut self, session: &SessionId) -> Result<bool, CryptoError> {
        Ok(self.working.sessions.contains(session))
    }

    async fn create_sessions(&mut self, prekeys: &[(SessionId, PreKey)]) -> Result<(), CryptoError> {
        let mut shared = self.crypto.lock();
        for (session, _) in prekeys {
            self.working.sessions.insert(session.clone());
            shared.created_sessions.push(session.clone());
        }
        Ok(())
    }

    async fn encrypt_pairwise(
        &mut self,
        session: &SessionId,
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let mut shared = self.crypto.lock();
        shared.pairwise_encryptions.push(session.clone());

        if shared.fail_encryption_for.contains(session) {
            return Err(CryptoError::Encryption { reason: format!("injected failure for {}", session.client_id) });
        }
        if !self.working.sessions.contains(session) {
            return Err(CryptoError::SessionNotFound {
                user: session.user_id.clone(),
                client: session.client_id.clone(),
            });
        }

        let mut ciphertext = pairwise_prefix(session);
        ciphertext.extend_from_slice(plaintext);
        Ok(Bytes::from(ciphertext))
    }

    async fn encrypt_group(
        &mut self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        if !self.working.groups.contains_key(group_id) {
            return Err(Self::group_error(group_id, "unknown group"));
        }
        self.crypto.lock().group_encryptions.push(group_id.clone());

        let mut ciphertext = group_prefix(group_id);
        ciphertext.extend_from_slice(plaintext);
        Ok(Bytes::from(ciphertext))
    }

    async fn group_epoch(&mut self, group_id: &GroupId) -> Result<u64, CryptoError> {
        self.working.groups.get(group_id).copied().ok_or_else(|| Self::group_error(group_id, "unknown group"))
    }

    async fn join_by_external_commit(
        &mut self,
        group_id: &GroupId,
        _group_info: &[u8],
    ) -> Result<(), CryptoError> {
        let mut shared = self.crypto.lock();
        let current = self.working.groups.get(group_id).copied().unwrap_or(0);
        let epoch = shared.join_epochs.get(group_id).copied().unwrap_or(current + 1);
        self.working.groups.insert(group_id.clone(), epoch);
        shared.joins.push(group_id.clone());
        Ok(())
    }

    async fn commit_pending_proposals(&mut self, group_id: &GroupId) -> Result<(), CryptoError> {
        let delay = {
            let mut shared = self.crypto.lock();
            if shared.fail_commits {
                return Err(Self::group_error(group_id, "commit rejected"));
            }
            shared.active_commits += 1;
            shared.max_active_commits = shared.max_active_commits.max(shared.active_commits);
            shared.commit_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut shared = self.crypto.lock();
        shared.active_commits -= 1;
        shared.commits.push(group_id.clone());
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), CryptoError> {
        let mut this = self;
        this.done = true;
        let working = std::mem::take(&mut this.working);

        let mut shared = this.crypto.lock();
        shared.committed.sessions.extend(working.sessions);
        for (group_id, epoch) in working.groups {
            let committed = shared.committed.groups.entry(group_id).or_insert(epoch);
            *committed = (*committed).max(epoch);
        }
        shared.finished += 1;
        Ok(())
    }
}
