//! Conversation protocol descriptors and MLS proposal timers.

use crate::{ids::GroupId, time::Timestamp};

/// Local state of an MLS group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Group exists and this device is a member
    Established,
    /// Join is in progress
    PendingJoin,
    /// Welcome message received, join pending after it
    PendingAfterReset,
}

/// Which encryption protocol a conversation uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolInfo {
    /// Pairwise sessions per device
    Proteus,
    /// Group-keyed MLS
    Mls {
        /// MLS group backing the conversation
        group_id: GroupId,
        /// Epoch known to the server
        epoch: u64,
        /// Local group state
        state: GroupState,
    },
    /// Migration phase; messages are still sent with Proteus
    Mixed {
        /// MLS group being migrated to
        group_id: GroupId,
        /// Epoch known to the server
        epoch: u64,
        /// Local group state
        state: GroupState,
    },
}

impl ProtocolInfo {
    /// Group id and epoch for MLS conversations.
    pub fn mls_group(&self) -> Option<(&GroupId, u64)> {
        match self {
            Self::Mls { group_id, epoch, .. } => Some((group_id, *epoch)),
            Self::Proteus | Self::Mixed { .. } => None,
        }
    }

    /// Short protocol label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Proteus => "proteus",
            Self::Mls { .. } => "mls",
            Self::Mixed { .. } => "mixed",
        }
    }
}

/// Deadline for committing a group's pending proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalTimer {
    /// Group holding pending proposals
    pub group_id: GroupId,
    /// When the commit is due
    pub due: Timestamp,
}

impl ProposalTimer {
    /// Create a timer.
    pub fn new(group_id: GroupId, due: Timestamp) -> Self {
        Self { group_id, due }
    }
}
