//! Plaintext wire format.
//!
//! What gets encrypted per device (or per group) is a CBOR-encoded
//! [`ProtoContent`]. Most messages are sent as `Readable` content directly.
//! Content too large to encrypt once per device is sealed once into a data
//! blob attached to the envelope, and devices receive `External`
//! instructions holding the blob key instead.

use serde::{Deserialize, Serialize};

use crate::{
    error::CodecError,
    ids::MessageId,
    message::{Message, MessageContent},
};

/// Key and digest needed to open an envelope's external data blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalInstructions {
    /// Message the blob belongs to
    pub message_id: MessageId,
    /// Symmetric key the blob was sealed with
    pub otr_key: Vec<u8>,
    /// SHA-256 of the sealed blob
    pub sha256: Vec<u8>,
}

/// Plaintext handed to the crypto engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtoContent {
    /// Content carried inline
    Readable {
        /// Message id shared by every device copy
        message_id: MessageId,
        /// Application content
        content: MessageContent,
        /// Whether receivers should send read receipts
        expects_read_confirmation: bool,
        /// Self-deletion lifetime, in milliseconds
        expires_after_millis: Option<u64>,
    },
    /// Content carried in the envelope's data blob
    External(ExternalInstructions),
}

impl ProtoContent {
    /// Inline content for a stored message.
    pub fn readable(message: &Message) -> Self {
        Self::Readable {
            message_id: message.id.clone(),
            content: message.content.clone(),
            expects_read_confirmation: message.expects_read_confirmation,
            expires_after_millis: message
                .expiration
                .map(|e| u64::try_from(e.expire_after.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Id of the message this content belongs to.
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Readable { message_id, .. } => message_id,
            Self::External(instructions) => &instructions.message_id,
        }
    }

    /// Encode to CBOR.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| CodecError::Encode { reason: e.to_string() })?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode { reason: e.to_string() })
    }
}

/// Canonical CBOR encoding of a single content value.
///
/// Used wherever a stable byte representation of content is needed without
/// the surrounding message metadata (quote hashes).
pub fn encode_content(content: &MessageContent) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(content, &mut buf)
        .map_err(|e| CodecError::Encode { reason: e.to_string() })?;
    Ok(buf)
}
