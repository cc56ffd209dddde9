//! Wire-ready encrypted payloads.

use bytes::Bytes;

use crate::ids::{ClientId, GroupId, UserId};

/// A user together with the devices a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Device owner
    pub user_id: UserId,
    /// Addressed devices
    pub clients: Vec<ClientId>,
}

impl Recipient {
    /// Create a recipient.
    pub fn new(user_id: UserId, clients: Vec<ClientId>) -> Self {
        Self { user_id, clients }
    }
}

/// Ciphertext for a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPayload {
    /// Receiving device
    pub client_id: ClientId,
    /// Pairwise-encrypted content
    pub payload: Bytes,
}

/// All ciphertexts for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientEntry {
    /// Receiving user
    pub user_id: UserId,
    /// One payload per addressed device
    pub client_payloads: Vec<ClientPayload>,
}

/// Pairwise-encrypted message ready for submission.
///
/// Contains exactly one [`ClientPayload`] per (user, device) of the recipient
/// snapshot it was built from. Never mutated after construction: a retry
/// builds a new envelope from a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Sending device
    pub sender_client_id: ClientId,
    /// Per-user ciphertexts
    pub recipients: Vec<RecipientEntry>,
    /// Symmetrically encrypted content, present when the content was too big
    /// to encrypt per device and the payloads only carry the key
    pub data_blob: Option<Bytes>,
}

impl MessageEnvelope {
    /// Users addressed by this envelope.
    pub fn user_ids(&self) -> impl Iterator<Item = &UserId> {
        self.recipients.iter().map(|entry| &entry.user_id)
    }

    /// Total number of device payloads.
    pub fn payload_count(&self) -> usize {
        self.recipients.iter().map(|entry| entry.client_payloads.len()).sum()
    }
}

/// Group-encrypted message ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlsOutgoingMessage {
    /// Group the message was encrypted for
    pub group_id: GroupId,
    /// Group ciphertext
    pub ciphertext: Bytes,
}

/// Devices left without a pairwise session after session establishment.
///
/// A partial failure: the send proceeds for everyone else and these devices
/// are recorded as undeliverable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsersWithoutSessions {
    /// Sessionless devices grouped by user
    pub recipients: Vec<Recipient>,
}

impl UsersWithoutSessions {
    /// No device was left without a session.
    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Users that have at least one sessionless device.
    pub fn user_ids(&self) -> Vec<UserId> {
        self.recipients.iter().map(|r| r.user_id.clone()).collect()
    }

    /// Whether the given device was left without a session.
    pub fn contains(&self, user_id: &UserId, client_id: &ClientId) -> bool {
        self.recipients
            .iter()
            .any(|r| &r.user_id == user_id && r.clients.iter().any(|c| c == client_id))
    }

    /// Records a sessionless device.
    pub fn push(&mut self, user_id: &UserId, client_id: ClientId) {
        match self.recipients.iter_mut().find(|r| &r.user_id == user_id) {
            Some(recipient) => recipient.clients.push(client_id),
            None => self.recipients.push(Recipient::new(user_id.clone(), vec![client_id])),
        }
    }

    /// `recipients` minus every sessionless device. Users left without any
    /// device are dropped entirely.
    pub fn filter(&self, recipients: &[Recipient]) -> Vec<Recipient> {
        recipients
            .iter()
            .filter_map(|recipient| {
                let clients: Vec<ClientId> = recipient
                    .clients
                    .iter()
                    .filter(|client| !self.contains(&recipient.user_id, client))
                    .cloned()
                    .collect();
                (!clients.is_empty()).then(|| Recipient::new(recipient.user_id.clone(), clients))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::new(name, "a.example")
    }

    #[test]
    fn filter_removes_sessionless_devices() {
        let recipients = vec![
            Recipient::new(user("a"), vec![ClientId::new("a1"), ClientId::new("a2")]),
            Recipient::new(user("b"), vec![ClientId::new("b1")]),
        ];
        let mut missing = UsersWithoutSessions::default();
        missing.push(&user("a"), ClientId::new("a2"));
        missing.push(&user("b"), ClientId::new("b1"));

        let remaining = missing.filter(&recipients);

        assert_eq!(remaining, vec![Recipient::new(user("a"), vec![ClientId::new("a1")])]);
        assert_eq!(missing.user_ids(), vec![user("a"), user("b")]);
    }

    #[test]
    fn push_groups_by_user() {
        let mut missing = UsersWithoutSessions::default();
        missing.push(&user("a"), ClientId::new("a1"));
        missing.push(&user("a"), ClientId::new("a2"));

        assert_eq!(missing.recipients.len(), 1);
        assert!(missing.contains(&user("a"), &ClientId::new("a2")));
        assert!(!missing.contains(&user("b"), &ClientId::new("a2")));
    }
}
