//! Pairwise session establishment.

use std::sync::Arc;

use courier_core::{
    CryptoEngine, PreKey, Recipient, SessionId, UsersWithoutSessions, store::PreKeySource,
};

use crate::error::SendError;

/// Ensures a pairwise session exists for every device of a recipient
/// snapshot before an envelope is built.
///
/// Devices that already have a session cost nothing beyond a lookup, so
/// calling this again for the same snapshot is cheap and has no further
/// effect.
pub struct SessionEstablisher {
    prekeys: Arc<dyn PreKeySource>,
}

impl SessionEstablisher {
    /// Create an establisher fetching key material from `prekeys`.
    pub fn new(prekeys: Arc<dyn PreKeySource>) -> Self {
        Self { prekeys }
    }

    /// Creates the missing sessions for `recipients`.
    ///
    /// Key material for every sessionless device is fetched in one batched
    /// request. Devices the backend has no key material for do not fail the
    /// call; they are returned so the caller can leave them out of the
    /// envelope and record them.
    ///
    /// # Errors
    ///
    /// - `Network`: the batched key fetch failed
    /// - `Crypto`: the engine could not check or create sessions
    pub async fn prepare_recipients(
        &self,
        crypto: &mut dyn CryptoEngine,
        recipients: &[Recipient],
    ) -> Result<UsersWithoutSessions, SendError> {
        let sessionless = Self::sessionless_devices(crypto, recipients).await?;
        if sessionless.is_empty() {
            return Ok(UsersWithoutSessions::default());
        }

        let fetched = self.prekeys.fetch_prekeys(&sessionless).await?;

        let mut without_sessions = UsersWithoutSessions::default();
        let mut to_create: Vec<(SessionId, PreKey)> = Vec::new();
        for recipient in &sessionless {
            let entries = fetched.get(&recipient.user_id);
            for client_id in &recipient.clients {
                let prekey = entries
                    .and_then(|entries| entries.iter().find(|(id, _)| id == client_id))
                    .and_then(|(_, prekey)| prekey.clone());

                match prekey {
                    Some(prekey) => to_create.push((
                        SessionId::new(recipient.user_id.clone(), client_id.clone()),
                        prekey,
                    )),
                    None => without_sessions.push(&recipient.user_id, client_id.clone()),
                }
            }
        }

        if !to_create.is_empty() {
            crypto.create_sessions(&to_create).await?;
        }

        if !without_sessions.is_empty() {
            tracing::warn!(
                users = without_sessions.recipients.len(),
                "no key material for some devices, sending without them"
            );
        }

        Ok(without_sessions)
    }

    async fn sessionless_devices(
        crypto: &mut dyn CryptoEngine,
        recipients: &[Recipient],
    ) -> Result<Vec<Recipient>, SendError> {
        let mut sessionless = Vec::new();
        for recipient in recipients {
            let mut clients = Vec::new();
            for client_id in &recipient.clients {
                let session = SessionId::new(recipient.user_id.clone(), client_id.clone());
                if !crypto.session_exists(&session).await? {
                    clients.push(client_id.clone());
                }
            }
            if !clients.is_empty() {
                sessionless.push(Recipient::new(recipient.user_id.clone(), clients));
            }
        }
        Ok(sessionless)
    }
}
