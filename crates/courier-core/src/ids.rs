//! Identifier newtypes.
//!
//! Users and conversations are federated, so their ids carry the owning
//! backend domain. Devices, messages and MLS groups are scoped by their
//! parent and use plain string ids.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Federated user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId {
    /// Id unique within `domain`
    pub value: String,
    /// Backend domain owning the user
    pub domain: String,
}

impl UserId {
    /// Create a user id.
    pub fn new(value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self { value: value.into(), domain: domain.into() }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.value, self.domain)
    }
}

/// Federated conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId {
    /// Id unique within `domain`
    pub value: String,
    /// Backend domain hosting the conversation
    pub domain: String,
}

impl ConversationId {
    /// Create a conversation id.
    pub fn new(value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self { value: value.into(), domain: domain.into() }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.value, self.domain)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create the id from anything string-like.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw id.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Device identifier, unique per user.
    ClientId
);
string_id!(
    /// Message identifier, unique per conversation.
    MessageId
);
string_id!(
    /// MLS group identifier.
    GroupId
);
string_id!(
    /// Sub-conversation identifier, unique per parent conversation.
    SubconversationId
);

impl MessageId {
    /// Shortened form safe to put in logs.
    pub fn obfuscated(&self) -> String {
        self.0.chars().take(8).collect()
    }
}
