//! Pairwise send path.
//!
//! Every test runs the full `MessageSender` against the in-memory harness
//! and checks what reached the backend and what was persisted.

mod common;

use std::time::Duration;

use common::{Fixture, alice, bob, conversation, self_client, session};
use courier_core::{
    ClientId, Environment, MessageContent, MessageId, MessageStatus, MessageTarget, NetworkError,
    ProtoContent, Recipient, SessionId, SyncState, UserId,
    codec::encode_content,
    message::QuoteReference,
    store::{SystemNotice, SystemNoticeKind},
};
use courier_crypto::{BlobKey, content_digest, open_blob};
use courier_harness::{DEFAULT_EPOCH, SimCrypto};
use courier_sender::{SendError, SenderConfig};

fn decrypt(session: &SessionId, payload: &[u8]) -> ProtoContent {
    let plaintext = SimCrypto::decrypt_pairwise(session, payload).expect("payload for session");
    ProtoContent::decode(&plaintext).expect("decodable content")
}

#[tokio::test(start_paused = true)]
async fn encrypts_once_per_device_and_promotes() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let message = fixture.text("m1", "hello");

    let time = sender.send(message.clone(), MessageTarget::default()).await.unwrap();

    assert_eq!(time, DEFAULT_EPOCH);
    let submitted = fixture.transport.envelopes();
    assert_eq!(submitted.len(), 1);

    let envelope = &submitted[0].envelope;
    assert_eq!(envelope.sender_client_id, self_client());
    assert_eq!(envelope.payload_count(), 3);
    assert!(envelope.data_blob.is_none());

    for entry in &envelope.recipients {
        for payload in &entry.client_payloads {
            let session = SessionId::new(entry.user_id.clone(), payload.client_id.clone());
            assert_eq!(decrypt(&session, &payload.payload), ProtoContent::readable(&message));
        }
    }

    assert_eq!(fixture.store.status(&conversation(), &message.id), Some(MessageStatus::Sent));
    assert_eq!(fixture.store.promotions(), vec![(message.id.clone(), Some(time))]);
    assert!(fixture.store.status_updates().is_empty());
    assert_eq!(fixture.crypto.transactions(), vec!["send_proteus".to_owned()]);
    assert_eq!(fixture.crypto.finished(), 1);
}

#[tokio::test(start_paused = true)]
async fn oversized_content_travels_as_external_blob() {
    let fixture = Fixture::proteus();
    let sender = fixture
        .sender_with(SenderConfig { external_message_threshold: 64, ..SenderConfig::default() });
    let message = fixture.text("big", &"x".repeat(1_000));

    sender.send(message.clone(), MessageTarget::default()).await.unwrap();

    let envelope = fixture.transport.envelopes().remove(0).envelope;
    let blob = envelope.data_blob.clone().expect("external blob attached");

    for entry in &envelope.recipients {
        for payload in &entry.client_payloads {
            let session = SessionId::new(entry.user_id.clone(), payload.client_id.clone());
            let ProtoContent::External(instructions) = decrypt(&session, &payload.payload) else {
                panic!("device received inline content");
            };
            assert_eq!(instructions.message_id, message.id);

            let key = BlobKey::from_slice(&instructions.otr_key).unwrap();
            let sha: [u8; 32] = instructions.sha256.as_slice().try_into().unwrap();
            let opened = open_blob(&blob, &key, &sha).unwrap();
            assert_eq!(ProtoContent::decode(&opened).unwrap(), ProtoContent::readable(&message));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn missing_sessions_are_created_from_one_batched_fetch() {
    let fixture = Fixture::proteus();
    fixture.directory.set_clients(&bob(), &["b1", "b2"]);
    fixture.directory.set_clients(&alice(), &["a1", "a2", "a3"]);
    fixture.directory.publish_prekey(&bob(), "b2", 7);
    fixture.directory.publish_prekey(&alice(), "a3", 8);
    let sender = fixture.sender();

    sender.send(fixture.text("m1", "hi"), MessageTarget::default()).await.unwrap();

    let requests = fixture.directory.prekey_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0],
        vec![
            Recipient::new(alice(), vec![ClientId::new("a3")]),
            Recipient::new(bob(), vec![ClientId::new("b2")]),
        ]
    );
    assert_eq!(fixture.crypto.created_sessions(), vec![session(&alice(), "a3"), session(&bob(), "b2")]);
    assert_eq!(fixture.transport.envelopes()[0].envelope.payload_count(), 5);
    assert!(fixture.store.no_clients_to_deliver().is_empty());
}

#[tokio::test(start_paused = true)]
async fn devices_without_key_material_are_skipped_and_recorded() {
    let fixture = Fixture::proteus();
    fixture.directory.set_clients(&bob(), &["b9"]);
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");

    sender.send(message.clone(), MessageTarget::default()).await.unwrap();

    let submitted = fixture.transport.envelopes().remove(0);
    assert_eq!(submitted.envelope.user_ids().cloned().collect::<Vec<_>>(), vec![alice()]);
    assert_eq!(submitted.target, MessageTarget::Conversation { excluded_users: vec![bob()] });
    assert_eq!(fixture.store.no_clients_to_deliver(), vec![(message.id.clone(), vec![bob()])]);
    assert_eq!(fixture.store.status(&conversation(), &message.id), Some(MessageStatus::Sent));
}

#[tokio::test(start_paused = true)]
async fn devices_without_key_material_are_recorded_even_when_submit_fails() {
    let fixture = Fixture::proteus();
    fixture.directory.set_clients(&bob(), &["b9"]);
    fixture.transport.reject_with(NetworkError::NoConnection);
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");

    let err = sender.send(message.clone(), MessageTarget::default()).await.unwrap_err();

    assert_eq!(err, SendError::Network(NetworkError::NoConnection));
    assert_eq!(fixture.store.no_clients_to_deliver(), vec![(message.id.clone(), vec![bob()])]);
    assert_eq!(fixture.store.status(&conversation(), &message.id), Some(MessageStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn one_failed_encryption_aborts_the_whole_envelope() {
    let fixture = Fixture::proteus();
    fixture.crypto.fail_encryption_for(session(&alice(), "a2"));
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");

    let err = sender.send(message.clone(), MessageTarget::default()).await.unwrap_err();

    assert!(matches!(err, SendError::Crypto(_)));
    assert_eq!(
        fixture.crypto.pairwise_encryptions(),
        vec![session(&alice(), "a1"), session(&alice(), "a2")]
    );
    assert_eq!(fixture.transport.submissions(), 0);
    assert_eq!(fixture.crypto.rolled_back(), 1);
    assert_eq!(fixture.store.status_updates(), vec![(message.id, MessageStatus::Failed)]);
}

#[tokio::test(start_paused = true)]
async fn users_target_only_addresses_listed_members() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();

    sender
        .send(fixture.text("m1", "psst"), MessageTarget::Users { user_ids: vec![bob()] })
        .await
        .unwrap();

    let envelope = fixture.transport.envelopes().remove(0).envelope;
    assert_eq!(envelope.user_ids().cloned().collect::<Vec<_>>(), vec![bob()]);
    assert_eq!(envelope.payload_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn client_target_bypasses_membership() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let recipients = vec![Recipient::new(alice(), vec![ClientId::new("a2")])];

    sender
        .send(fixture.text("m1", "device only"), MessageTarget::Client { recipients })
        .await
        .unwrap();

    let envelope = fixture.transport.envelopes().remove(0).envelope;
    assert_eq!(envelope.payload_count(), 1);
    assert_eq!(envelope.recipients[0].client_payloads[0].client_id, ClientId::new("a2"));
}

#[tokio::test(start_paused = true)]
async fn server_time_skew_shifts_pending_messages() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let message = fixture.text("m1", "first");
    let queued = fixture.text("m2", "second");
    let server_time = DEFAULT_EPOCH.shifted_by(5_000);
    fixture.transport.set_server_time(server_time);

    sender.send(message.clone(), MessageTarget::default()).await.unwrap();

    assert_eq!(fixture.store.shifts(), vec![(conversation(), 5_000)]);
    assert_eq!(fixture.store.message(&conversation(), &message.id).unwrap().date, server_time);
    assert_eq!(
        fixture.store.message(&conversation(), &queued.id).unwrap().date,
        queued.date.shifted_by(5_000)
    );
}

#[tokio::test(start_paused = true)]
async fn edit_keeps_the_original_creation_date() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let original = fixture.text("m0", "typo");
    sender.send(original.clone(), MessageTarget::default()).await.unwrap();
    let original_date = fixture.store.message(&conversation(), &original.id).unwrap().date;

    tokio::time::sleep(Duration::from_secs(60)).await;
    fixture.transport.set_server_time(fixture.env.wall_clock());
    let edit = fixture.store_message("m1", MessageContent::TextEdited {
        edited_message_id: original.id.clone(),
        new_text: "fixed".into(),
        new_mentions: Vec::new(),
    });

    sender.send(edit.clone(), MessageTarget::default()).await.unwrap();

    let stored = fixture.store.message(&conversation(), &edit.id).unwrap();
    assert_eq!(stored.date, original_date);
    assert_eq!(stored.content, edit.content);
    assert_eq!(stored.status, MessageStatus::Sent);
    assert!(!fixture.store.contains(&conversation(), &original.id));
    assert_eq!(fixture.store.promotions().last(), Some(&(edit.id.clone(), None)));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_users_are_split_by_envelope_membership() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");
    let carol = UserId::new("carol", "remote.example");
    fixture.transport.accept_unconfirmed(DEFAULT_EPOCH, vec![bob(), carol.clone()]);

    sender.send(message.clone(), MessageTarget::default()).await.unwrap();

    assert_eq!(fixture.store.no_clients_to_deliver(), vec![(message.id.clone(), vec![carol])]);
    assert_eq!(fixture.store.delivery_failures(), vec![(message.id.clone(), vec![bob()])]);
    assert_eq!(fixture.store.status(&conversation(), &message.id), Some(MessageStatus::Sent));
}

#[tokio::test(start_paused = true)]
async fn unreachable_federated_backend_fails_remotely() {
    let fixture = Fixture::proteus();
    fixture.transport.reject_with(NetworkError::FederatedBackendUnreachable {
        domains: vec!["remote.example".into()],
    });
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");

    let err = sender.send(message.clone(), MessageTarget::default()).await.unwrap_err();

    assert!(matches!(err, SendError::Network(NetworkError::FederatedBackendUnreachable { .. })));
    assert_eq!(fixture.store.status_updates(), vec![(message.id.clone(), MessageStatus::FailedRemotely)]);
    assert!(fixture.store.promotions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn server_rejection_fails_exactly_once() {
    let fixture = Fixture::proteus();
    fixture.transport.reject_with(NetworkError::Server { status: 500, label: "internal".into() });
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");

    sender.send(message.clone(), MessageTarget::default()).await.unwrap_err();

    assert_eq!(fixture.store.status_updates(), vec![(message.id.clone(), MessageStatus::Failed)]);
    assert!(fixture.store.promotions().is_empty());
    assert_eq!(fixture.transport.submissions(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_send_leaves_message_pending() {
    let fixture = Fixture::proteus();
    fixture.transport.set_latency(Duration::from_secs(30));
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");

    let outcome =
        tokio::time::timeout(Duration::from_secs(1), sender.send(message.clone(), MessageTarget::default()))
            .await;

    assert!(outcome.is_err());
    assert_eq!(fixture.store.status(&conversation(), &message.id), Some(MessageStatus::Pending));
    assert!(fixture.store.status_updates().is_empty());
    assert!(fixture.store.promotions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_waits_for_live_sync() {
    let fixture = Fixture::proteus();
    fixture.sync.set(SyncState::CatchingUp);
    let sender = fixture.sender();
    let message = fixture.text("m1", "hi");

    let (result, ()) = tokio::join!(sender.send(message, MessageTarget::default()), async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fixture.transport.submissions(), 0);
        fixture.sync.set(SyncState::Live);
    });

    result.unwrap();
    assert_eq!(fixture.transport.submissions(), 1);
}

#[tokio::test(start_paused = true)]
async fn replies_carry_the_quoted_content_hash() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let quoted = fixture.text("m0", "original");
    let reply = fixture.store_message("m1", MessageContent::Text {
        text: "reply".into(),
        mentions: Vec::new(),
        quote: Some(QuoteReference { message_id: quoted.id.clone(), content_hash: None }),
    });

    sender.send(reply, MessageTarget::default()).await.unwrap();

    let envelope = fixture.transport.envelopes().remove(0).envelope;
    let entry = &envelope.recipients[0];
    let payload = &entry.client_payloads[0];
    let ProtoContent::Readable { content: MessageContent::Text { quote: Some(quote), .. }, .. } =
        decrypt(&SessionId::new(entry.user_id.clone(), payload.client_id.clone()), &payload.payload)
    else {
        panic!("reply lost its quote");
    };
    let expected = content_digest(&encode_content(&quoted.content).unwrap()).to_vec();
    assert_eq!(quote.content_hash, Some(expected));
}

#[tokio::test(start_paused = true)]
async fn unresolvable_quote_fails_before_any_network_io() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let reply = fixture.store_message("m1", MessageContent::Text {
        text: "reply".into(),
        mentions: Vec::new(),
        quote: Some(QuoteReference { message_id: MessageId::new("gone"), content_hash: None }),
    });

    let err = sender.send(reply.clone(), MessageTarget::default()).await.unwrap_err();

    assert!(matches!(err, SendError::Preparation { .. }));
    assert_eq!(fixture.transport.submissions(), 0);
    assert!(fixture.crypto.transactions().is_empty());
    assert_eq!(fixture.store.status_updates(), vec![(reply.id, MessageStatus::Failed)]);
}

#[tokio::test(start_paused = true)]
async fn pending_message_is_loaded_and_sent() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let message = fixture.text("m1", "from storage");

    sender.send_pending_message(&conversation(), &message.id).await.unwrap();

    assert_eq!(fixture.transport.submissions(), 1);
    assert_eq!(fixture.store.status(&conversation(), &message.id), Some(MessageStatus::Sent));
}

#[tokio::test(start_paused = true)]
async fn system_messages_are_not_sendable() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let id = MessageId::new("sys");
    fixture.store.insert_system(id.clone(), SystemNotice {
        conversation_id: conversation(),
        date: DEFAULT_EPOCH,
        kind: SystemNoticeKind::MlsMessagesLost,
    });

    let err = sender.send_pending_message(&conversation(), &id).await.unwrap_err();

    assert_eq!(err, SendError::NotSendable(id.clone()));
    assert_eq!(fixture.transport.submissions(), 0);
    assert_eq!(fixture.store.status_updates(), vec![(id, MessageStatus::Failed)]);
}

#[tokio::test(start_paused = true)]
async fn mixed_conversations_send_pairwise() {
    let fixture = Fixture::proteus();
    fixture.directory.add_conversation(
        &conversation(),
        courier_core::ProtocolInfo::Mixed {
            group_id: common::group(),
            epoch: 1,
            state: courier_core::GroupState::Established,
        },
        &[alice(), bob()],
    );
    let sender = fixture.sender();

    sender.send(fixture.text("m1", "hi"), MessageTarget::default()).await.unwrap();

    assert_eq!(fixture.transport.envelopes().len(), 1);
    assert!(fixture.transport.group_messages().is_empty());
}
