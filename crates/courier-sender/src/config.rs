//! Sender configuration.

use std::time::Duration;

/// Payload size above which content is sealed once into an external blob
/// instead of being encrypted for every device (256 KiB).
pub const DEFAULT_EXTERNAL_MESSAGE_THRESHOLD: usize = 256 * 1024;

/// Message sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Retries allowed after a "device set changed" rejection of a send
    pub send_retry_budget: u32,
    /// Retries allowed after a "device set changed" rejection of a broadcast
    pub broadcast_retry_budget: u32,
    /// Encoded content size above which the external blob path is used
    pub external_message_threshold: usize,
    /// Serialize pairwise sends per conversation, so two sends to the same
    /// conversation never race on the same session state
    pub serialize_proteus_sends: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            send_retry_budget: 1,
            broadcast_retry_budget: 2,
            external_message_threshold: DEFAULT_EXTERNAL_MESSAGE_THRESHOLD,
            serialize_proteus_sends: true,
        }
    }
}

/// Proposal scheduler configuration
#[derive(Debug, Clone)]
pub struct ProposalSchedulerConfig {
    /// Whether MLS is supported at all; the scheduler never commits otherwise
    pub mls_enabled: bool,
}

impl Default for ProposalSchedulerConfig {
    fn default() -> Self {
        Self { mls_enabled: true }
    }
}

/// Self-deletion configuration
#[derive(Debug, Clone)]
pub struct SelfDeletionConfig {
    /// Interval at which remaining time is published
    pub tick: Duration,
}

impl Default for SelfDeletionConfig {
    fn default() -> Self {
        Self { tick: Duration::from_secs(1) }
    }
}
