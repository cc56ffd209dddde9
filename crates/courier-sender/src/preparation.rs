//! Content preparation before encryption.
//!
//! Runs once per send, before any crypto transaction is opened. A failure
//! here aborts the send without touching the network.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    Message, MessageContent,
    codec::encode_content,
    message::QuoteReference,
    store::{MessageStore, StoredMessage},
};
use courier_crypto::content_digest;

use crate::error::SendError;

/// Hook rewriting a message right before it is encrypted.
#[async_trait]
pub trait MessagePreparer: Send + Sync {
    /// Returns the message to encrypt.
    async fn prepare(&self, message: Message) -> Result<Message, SendError>;
}

/// Fills in the content hash of quoted messages so receivers can check that
/// a reply quotes what the sender saw.
pub struct QuoteHashPreparer {
    messages: Arc<dyn MessageStore>,
}

impl QuoteHashPreparer {
    /// Create a preparer reading quoted messages from `messages`.
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }

    async fn quote_hash(&self, message: &Message, quote: &QuoteReference) -> Result<Vec<u8>, SendError> {
        let quoted = self
            .messages
            .message_by_id(&message.conversation_id, &quote.message_id)
            .await
            .map_err(|err| SendError::Preparation {
                reason: format!("quoted message {} unavailable: {err}", quote.message_id),
            })?;

        let StoredMessage::Regular(quoted) = quoted else {
            return Err(SendError::Preparation {
                reason: format!("quoted message {} is a system message", quote.message_id),
            });
        };

        let encoded = encode_content(&quoted.content)?;
        Ok(content_digest(&encoded).to_vec())
    }
}

#[async_trait]
impl MessagePreparer for QuoteHashPreparer {
    async fn prepare(&self, mut message: Message) -> Result<Message, SendError> {
        let quote = match &message.content {
            MessageContent::Text { quote: Some(quote), .. } if quote.content_hash.is_none() => {
                quote.clone()
            },
            MessageContent::Text { .. }
            | MessageContent::Knock { .. }
            | MessageContent::Reaction { .. }
            | MessageContent::Receipt { .. }
            | MessageContent::TextEdited { .. }
            | MessageContent::DeleteMessage { .. }
            | MessageContent::DeleteForMe { .. }
            | MessageContent::Calling { .. }
            | MessageContent::Multipart { .. }
            | MessageContent::MultipartEdited { .. } => return Ok(message),
        };

        let hash = self.quote_hash(&message, &quote).await?;
        if let MessageContent::Text { quote: Some(quote), .. } = &mut message.content {
            quote.content_hash = Some(hash);
        }
        Ok(message)
    }
}

/// Preparer that sends content unchanged.
pub struct PassthroughPreparer;

#[async_trait]
impl MessagePreparer for PassthroughPreparer {
    async fn prepare(&self, message: Message) -> Result<Message, SendError> {
        Ok(message)
    }
}
