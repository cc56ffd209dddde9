//! Shared fixture for sender integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::{sync::Arc, time::Duration};

use courier_core::{
    ClientId, ConversationId, Environment, ExpirationData, GroupId, GroupState, Message,
    MessageContent, MessageId, MessageStatus, ProtocolInfo, SessionId, SyncState,
    SyncStateHandle, UserId,
};
use courier_harness::{
    MemoryDirectory, MemoryMessageStore, SimCrypto, SimEnv, SimTransport, init_tracing,
};
use courier_sender::{
    Collaborators, EphemeralMessageDeletionHandler, MessageSender, SelfDeletionConfig,
    SenderConfig,
};

/// Domain every fixture identity lives on.
pub const DOMAIN: &str = "wire.example";

/// The user sending messages.
pub fn self_user() -> UserId {
    UserId::new("self", DOMAIN)
}

/// Device the self user sends from.
pub fn self_client() -> ClientId {
    ClientId::new("self-phone")
}

/// First peer, two devices.
pub fn alice() -> UserId {
    UserId::new("alice", DOMAIN)
}

/// Second peer, one device.
pub fn bob() -> UserId {
    UserId::new("bob", DOMAIN)
}

/// The fixture conversation.
pub fn conversation() -> ConversationId {
    ConversationId::new("conv-1", DOMAIN)
}

/// Group backing the fixture conversation when it uses MLS.
pub fn group() -> GroupId {
    GroupId::new("group-1")
}

/// Session with a device.
pub fn session(user: &UserId, client: &str) -> SessionId {
    SessionId::new(user.clone(), ClientId::new(client))
}

/// Wired-up collaborators around a proteus conversation with alice (`a1`,
/// `a2`) and bob (`b1`), every device already holding a session.
pub struct Fixture {
    /// Simulated environment
    pub env: SimEnv,
    /// Message persistence
    pub store: Arc<MemoryMessageStore>,
    /// Conversations, devices and key material
    pub directory: Arc<MemoryDirectory>,
    /// Crypto engine
    pub crypto: SimCrypto,
    /// Backend
    pub transport: Arc<SimTransport>,
    /// Sync state, live by default
    pub sync: SyncStateHandle,
    /// Self-deletion countdowns
    pub deletion: Arc<EphemeralMessageDeletionHandler<SimEnv>>,
}

impl Fixture {
    /// Proteus fixture.
    pub fn proteus() -> Self {
        init_tracing();

        let env = SimEnv::with_seed(42);
        let store = Arc::new(MemoryMessageStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let crypto = SimCrypto::new();

        directory.add_conversation(&conversation(), ProtocolInfo::Proteus, &[alice(), bob()]);
        directory.set_clients(&alice(), &["a1", "a2"]);
        directory.set_clients(&bob(), &["b1"]);
        for (user, client) in [(alice(), "a1"), (alice(), "a2"), (bob(), "b1")] {
            crypto.add_session(session(&user, client));
        }

        let deletion = Arc::new(EphemeralMessageDeletionHandler::new(
            env.clone(),
            Arc::clone(&store) as _,
            SelfDeletionConfig::default(),
        ));

        Self {
            env,
            store,
            directory,
            crypto,
            transport: Arc::new(SimTransport::new()),
            sync: SyncStateHandle::new(SyncState::Live),
            deletion,
        }
    }

    /// MLS fixture: the conversation is backed by [`group`] at `epoch`,
    /// locally and remotely.
    pub fn mls(epoch: u64) -> Self {
        let fixture = Self::proteus();
        fixture.directory.add_conversation(
            &conversation(),
            ProtocolInfo::Mls { group_id: group(), epoch, state: GroupState::Established },
            &[alice(), bob()],
        );
        fixture.crypto.set_group_epoch(&group(), epoch);
        fixture
    }

    /// Collaborators for a sender or a standalone component.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            messages: Arc::clone(&self.store) as _,
            conversations: Arc::clone(&self.directory) as _,
            clients: Arc::clone(&self.directory) as _,
            prekeys: Arc::clone(&self.directory) as _,
            subconversations: Arc::clone(&self.directory) as _,
            crypto: Arc::new(self.crypto.clone()),
            transport: Arc::clone(&self.transport) as _,
            sync: self.sync.observer(),
        }
    }

    /// Sender with the default configuration.
    pub fn sender(&self) -> MessageSender<SimEnv> {
        self.sender_with(SenderConfig::default())
    }

    /// Sender with `config`.
    pub fn sender_with(&self, config: SenderConfig) -> MessageSender<SimEnv> {
        MessageSender::new(
            config,
            self.env.clone(),
            self_user(),
            self.collaborators(),
            Arc::clone(&self.deletion) as _,
        )
    }

    /// A pending text message, stored and ready to send.
    pub fn text(&self, id: &str, text: &str) -> Message {
        self.store_message(id, MessageContent::Text {
            text: text.to_owned(),
            mentions: Vec::new(),
            quote: None,
        })
    }

    /// A pending message with `content`, stored and ready to send.
    pub fn store_message(&self, id: &str, content: MessageContent) -> Message {
        let message = Message {
            id: MessageId::new(id),
            conversation_id: conversation(),
            date: self.env.wall_clock(),
            sender_user_id: self_user(),
            sender_client_id: self_client(),
            content,
            status: MessageStatus::Pending,
            expiration: None,
            expects_read_confirmation: false,
        };
        self.store.insert(message.clone());
        message
    }

    /// A pending self-deleting text message, stored and ready to send.
    pub fn ephemeral(&self, id: &str, expire_after: Duration) -> Message {
        let mut message = self.text(id, "ephemeral");
        message.expiration = Some(ExpirationData::new(expire_after));
        self.store.insert(message.clone());
        message
    }
}
