//! Group message construction.

use courier_core::{CryptoEngine, GroupId, Message, MlsOutgoingMessage, ProtoContent};

use crate::error::SendError;

/// Encrypts messages for MLS groups.
///
/// One encryption covers every member device, so unlike the pairwise path
/// there is no per-device work and no external blob.
#[derive(Debug, Default)]
pub struct MlsMessageCreator;

impl MlsMessageCreator {
    /// Create a creator.
    pub fn new() -> Self {
        Self
    }

    /// Encrypts `message` for `group_id`.
    pub async fn create_outgoing_message(
        &self,
        crypto: &mut dyn CryptoEngine,
        group_id: &GroupId,
        message: &Message,
    ) -> Result<MlsOutgoingMessage, SendError> {
        let content = ProtoContent::readable(message);

        let ciphertext = crypto.encrypt_group(group_id, &content.encode()?).await?;
        Ok(MlsOutgoingMessage { group_id: group_id.clone(), ciphertext })
    }
}
