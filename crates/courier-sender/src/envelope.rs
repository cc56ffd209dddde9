//! Pairwise envelope construction.

use bytes::Bytes;
use courier_core::{
    BroadcastMessage, ClientId, ClientPayload, CryptoEngine, Environment, ExternalInstructions,
    Message, MessageEnvelope, MessageId, ProtoContent, Recipient, RecipientEntry, SessionId,
};
use courier_crypto::{BlobKey, seal_blob};

use crate::error::SendError;

/// Builds pairwise-encrypted envelopes.
pub struct MessageEnvelopeCreator<E: Environment> {
    env: E,
    external_threshold: usize,
}

impl<E: Environment> MessageEnvelopeCreator<E> {
    /// Create a creator sealing content larger than `external_threshold`
    /// bytes into an external blob.
    pub fn new(env: E, external_threshold: usize) -> Self {
        Self { env, external_threshold }
    }

    /// Encrypts `message` once for every device of `recipients`.
    ///
    /// The first encryption failure aborts the build; no further devices are
    /// encrypted for and no partial envelope is returned.
    pub async fn create_envelope(
        &self,
        crypto: &mut dyn CryptoEngine,
        recipients: &[Recipient],
        message: &Message,
    ) -> Result<MessageEnvelope, SendError> {
        let content = ProtoContent::readable(message);
        self.build(crypto, recipients, &message.sender_client_id, &content).await
    }

    /// Encrypts a broadcast once for every device of `recipients`.
    pub async fn create_broadcast_envelope(
        &self,
        crypto: &mut dyn CryptoEngine,
        recipients: &[Recipient],
        message: &BroadcastMessage,
    ) -> Result<MessageEnvelope, SendError> {
        let content = ProtoContent::Readable {
            message_id: message.id.clone(),
            content: message.content.clone(),
            expects_read_confirmation: false,
            expires_after_millis: None,
        };
        self.build(crypto, recipients, &message.sender_client_id, &content).await
    }

    async fn build(
        &self,
        crypto: &mut dyn CryptoEngine,
        recipients: &[Recipient],
        sender_client_id: &ClientId,
        content: &ProtoContent,
    ) -> Result<MessageEnvelope, SendError> {
        let plaintext = content.encode()?;

        let (device_plaintext, data_blob) = if plaintext.len() > self.external_threshold {
            let (instructions, blob) = self.seal_external(content.message_id(), &plaintext)?;
            (instructions, Some(blob))
        } else {
            (plaintext, None)
        };

        let mut entries = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut client_payloads = Vec::with_capacity(recipient.clients.len());
            for client_id in &recipient.clients {
                let session = SessionId::new(recipient.user_id.clone(), client_id.clone());
                let payload = crypto.encrypt_pairwise(&session, &device_plaintext).await?;
                client_payloads.push(ClientPayload { client_id: client_id.clone(), payload });
            }
            if !client_payloads.is_empty() {
                entries.push(RecipientEntry { user_id: recipient.user_id.clone(), client_payloads });
            }
        }

        Ok(MessageEnvelope {
            sender_client_id: sender_client_id.clone(),
            recipients: entries,
            data_blob,
        })
    }

    /// Seals `plaintext` into a blob and returns the encoded per-device
    /// instructions together with the blob.
    fn seal_external(
        &self,
        message_id: &MessageId,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, Bytes), SendError> {
        let key = BlobKey::new(self.env.random_array());
        let sealed = seal_blob(plaintext, &key, self.env.random_array());

        tracing::debug!(
            message_id = %message_id.obfuscated(),
            size = plaintext.len(),
            "content over external threshold, sending as blob"
        );

        let instructions = ProtoContent::External(ExternalInstructions {
            message_id: message_id.clone(),
            otr_key: key.as_bytes().to_vec(),
            sha256: sealed.sha256.to_vec(),
        })
        .encode()?;

        Ok((instructions, Bytes::from(sealed.data)))
    }
}
