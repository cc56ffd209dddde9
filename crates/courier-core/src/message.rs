//! Application-level messages and send targets.

use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    envelope::Recipient,
    ids::{ClientId, ConversationId, MessageId, UserId},
    time::Timestamp,
};

/// Delivery status of a stored message.
///
/// Messages start `Pending` and move to exactly one terminal state per send
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Created locally, not yet accepted by the server
    Pending,
    /// Accepted by the server
    Sent,
    /// Send failed locally or was rejected
    Failed,
    /// Accepted locally but a remote federated backend could not be reached
    FailedRemotely,
}

impl MessageStatus {
    /// Whether the status ends a send attempt.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Reference from a reply to the message it quotes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteReference {
    /// Quoted message
    pub message_id: MessageId,
    /// SHA-256 of the quoted message's encoded content, filled in before
    /// encryption so receivers can verify the quote
    pub content_hash: Option<Vec<u8>>,
}

/// User mention inside a text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    /// Mentioned user
    pub user_id: UserId,
    /// Character offset of the mention
    pub start: u32,
    /// Character length of the mention
    pub length: u32,
}

/// Attachment carried inside a multipart message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Asset id on the backend
    pub asset_id: String,
    /// MIME type
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
}

/// Kind of confirmation receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptKind {
    /// Message arrived on the device
    Delivered,
    /// Message was displayed to the user
    Read,
}

/// Closed set of content kinds the pipeline can send.
///
/// Every consumer matches exhaustively, so adding a kind forces each stage
/// (preparation, encoding, post-send handling) to decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    /// Plain text with optional mentions and quote
    Text {
        /// Message body
        text: String,
        /// Mentioned users
        mentions: Vec<Mention>,
        /// Quoted message, if this is a reply
        quote: Option<QuoteReference>,
    },
    /// Ping
    Knock {
        /// Whether the knock repeats a recent one
        hot_knock: bool,
    },
    /// Emoji reaction to another message
    Reaction {
        /// Reacted-to message
        message_id: MessageId,
        /// Full set of emojis after this reaction
        emojis: BTreeSet<String>,
    },
    /// Delivery or read confirmation
    Receipt {
        /// Receipt type
        kind: ReceiptKind,
        /// Confirmed messages
        message_ids: Vec<MessageId>,
    },
    /// Edit of an earlier text message
    TextEdited {
        /// Message being replaced
        edited_message_id: MessageId,
        /// Replacement text
        new_text: String,
        /// Replacement mentions
        new_mentions: Vec<Mention>,
    },
    /// Deletion of a message for everyone
    DeleteMessage {
        /// Deleted message
        message_id: MessageId,
    },
    /// Deletion of a message on the user's own devices only
    DeleteForMe {
        /// Deleted message
        message_id: MessageId,
        /// Conversation holding the deleted message
        conversation_id: ConversationId,
    },
    /// Opaque calling signal
    Calling {
        /// Signal payload
        value: String,
    },
    /// Text with attachments
    Multipart {
        /// Optional text body
        text: Option<String>,
        /// Attached assets
        attachments: Vec<AttachmentRef>,
    },
    /// Edit of an earlier multipart message
    MultipartEdited {
        /// Message being replaced
        edited_message_id: MessageId,
        /// Replacement text
        new_text: Option<String>,
        /// Replacement attachments
        new_attachments: Vec<AttachmentRef>,
    },
}

impl MessageContent {
    /// Id of the message this content replaces, for edits.
    pub fn edited_message_id(&self) -> Option<&MessageId> {
        match self {
            Self::TextEdited { edited_message_id, .. }
            | Self::MultipartEdited { edited_message_id, .. } => Some(edited_message_id),
            Self::Text { .. }
            | Self::Knock { .. }
            | Self::Reaction { .. }
            | Self::Receipt { .. }
            | Self::DeleteMessage { .. }
            | Self::DeleteForMe { .. }
            | Self::Calling { .. }
            | Self::Multipart { .. } => None,
        }
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Knock { .. } => "knock",
            Self::Reaction { .. } => "reaction",
            Self::Receipt { .. } => "receipt",
            Self::TextEdited { .. } => "text_edited",
            Self::DeleteMessage { .. } => "delete",
            Self::DeleteForMe { .. } => "delete_for_me",
            Self::Calling { .. } => "calling",
            Self::Multipart { .. } => "multipart",
            Self::MultipartEdited { .. } => "multipart_edited",
        }
    }
}

/// Progress of a self-deleting message's countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfDeletionStatus {
    /// Countdown not started yet (e.g. message not yet seen)
    NotStarted,
    /// Countdown started at the given wall-clock time
    Started {
        /// When the countdown began
        start: Timestamp,
    },
}

/// Self-deletion settings of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationData {
    /// Lifetime once the countdown starts
    pub expire_after: Duration,
    /// Countdown progress
    pub status: SelfDeletionStatus,
}

impl ExpirationData {
    /// Fresh expiration data whose countdown has not started.
    pub fn new(expire_after: Duration) -> Self {
        Self { expire_after, status: SelfDeletionStatus::NotStarted }
    }

    /// Time left at `now`, or the full lifetime if not started.
    pub fn time_left(&self, now: Timestamp) -> Duration {
        match self.status {
            SelfDeletionStatus::NotStarted => self.expire_after,
            SelfDeletionStatus::Started { start } => {
                self.expire_after.saturating_sub(now.saturating_duration_since(start))
            },
        }
    }

    /// Wall-clock time at which the message is due for deletion, if started.
    pub fn deletion_due(&self) -> Option<Timestamp> {
        match self.status {
            SelfDeletionStatus::NotStarted => None,
            SelfDeletionStatus::Started { start } => Some(start.saturating_add(self.expire_after)),
        }
    }
}

/// A regular message authored on this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message id, unique per conversation
    pub id: MessageId,
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Local creation time
    pub date: Timestamp,
    /// Authoring user
    pub sender_user_id: UserId,
    /// Authoring device
    pub sender_client_id: ClientId,
    /// Content to encrypt
    pub content: MessageContent,
    /// Delivery status
    pub status: MessageStatus,
    /// Self-deletion settings, if the message is ephemeral
    pub expiration: Option<ExpirationData>,
    /// Whether receivers should send read receipts
    pub expects_read_confirmation: bool,
}

impl Message {
    /// Compact identification for structured logs.
    pub fn log_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.content.kind(),
            self.conversation_id.value.chars().take(8).collect::<String>(),
            self.id.obfuscated()
        )
    }
}

/// A message broadcast to many users outside any conversation.
///
/// Broadcasts (availability updates and the like) are never stored, so they
/// carry no status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    /// Message id
    pub id: MessageId,
    /// Local creation time
    pub date: Timestamp,
    /// Authoring user
    pub sender_user_id: UserId,
    /// Authoring device
    pub sender_client_id: ClientId,
    /// Content to encrypt
    pub content: MessageContent,
}

/// Which devices a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// All conversation members except the listed users
    Conversation {
        /// Users to leave out
        excluded_users: Vec<UserId>,
    },
    /// Only the listed conversation members
    Users {
        /// Users to address
        user_ids: Vec<UserId>,
    },
    /// Explicit devices, bypassing conversation membership
    Client {
        /// Devices to address
        recipients: Vec<Recipient>,
    },
}

impl Default for MessageTarget {
    fn default() -> Self {
        Self::Conversation { excluded_users: Vec::new() }
    }
}

impl MessageTarget {
    /// Target that ignores `users` on top of whatever this target already
    /// excludes. Only conversation-wide targets can ignore users.
    pub fn ignoring(&self, users: &[UserId]) -> Self {
        match self {
            Self::Conversation { excluded_users } => {
                let mut excluded = excluded_users.clone();
                excluded.extend(users.iter().filter(|u| !excluded_users.contains(u)).cloned());
                Self::Conversation { excluded_users: excluded }
            },
            Self::Users { .. } | Self::Client { .. } => self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::new(name, "a.example")
    }

    #[test]
    fn time_left_counts_from_start() {
        let expiration = ExpirationData {
            expire_after: Duration::from_secs(10),
            status: SelfDeletionStatus::Started { start: Timestamp::from_millis(1_000) },
        };

        assert_eq!(expiration.time_left(Timestamp::from_millis(5_000)), Duration::from_secs(6));
        assert_eq!(expiration.time_left(Timestamp::from_millis(60_000)), Duration::ZERO);
        assert_eq!(expiration.deletion_due(), Some(Timestamp::from_millis(11_000)));
    }

    #[test]
    fn not_started_has_full_lifetime() {
        let expiration = ExpirationData::new(Duration::from_secs(30));

        assert_eq!(expiration.time_left(Timestamp::from_millis(99)), Duration::from_secs(30));
        assert_eq!(expiration.deletion_due(), None);
    }

    #[test]
    fn conversation_target_accumulates_ignored_users() {
        let target = MessageTarget::Conversation { excluded_users: vec![user("a")] };

        let ignoring = target.ignoring(&[user("a"), user("b")]);

        assert_eq!(ignoring, MessageTarget::Conversation { excluded_users: vec![user("a"), user("b")] });
    }

    #[test]
    fn explicit_targets_are_not_widened() {
        let target = MessageTarget::Users { user_ids: vec![user("a")] };

        assert_eq!(target.ignoring(&[user("a")]), target);
    }

    #[test]
    fn edit_ids() {
        let edit = MessageContent::TextEdited {
            edited_message_id: MessageId::new("old"),
            new_text: "fixed".into(),
            new_mentions: vec![],
        };

        assert_eq!(edit.edited_message_id(), Some(&MessageId::new("old")));
        assert_eq!(MessageContent::Knock { hot_knock: false }.edited_message_id(), None);
    }
}
