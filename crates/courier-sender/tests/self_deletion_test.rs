//! Self-deleting message countdowns.

mod common;

use std::time::Duration;

use common::{Fixture, conversation};
use courier_core::{
    Environment, ExpirationData, Message, MessageStatus, MessageTarget, SelfDeletionStatus,
};
use courier_harness::DEFAULT_EPOCH;
use courier_sender::SelfDeletionScheduler;

fn sent_ephemeral(fixture: &Fixture, id: &str, expire_after: Duration, start_secs_ago: u64) -> Message {
    let mut message = fixture.ephemeral(id, expire_after);
    let start = fixture.env.wall_clock().shifted_by(-(start_secs_ago as i64 * 1000));
    message.status = MessageStatus::Sent;
    message.expiration = Some(ExpirationData {
        expire_after,
        status: SelfDeletionStatus::Started { start },
    });
    fixture.store.insert(message.clone());
    message
}

#[tokio::test(start_paused = true)]
async fn sent_ephemeral_message_is_deleted_when_its_time_is_up() {
    let fixture = Fixture::proteus();
    let sender = fixture.sender();
    let message = fixture.ephemeral("e1", Duration::from_secs(10));

    sender.send(message.clone(), MessageTarget::default()).await.unwrap();
    tokio::task::yield_now().await;

    assert!(fixture.deletion.is_scheduled(&conversation(), &message.id));
    assert_eq!(fixture.store.self_deletion_starts(), vec![(message.id.clone(), DEFAULT_EPOCH)]);

    tokio::time::sleep(Duration::from_millis(9_900)).await;
    assert!(fixture.store.contains(&conversation(), &message.id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!fixture.store.contains(&conversation(), &message.id));
    assert_eq!(fixture.store.deleted(), vec![message.id.clone()]);
    assert!(!fixture.deletion.is_scheduled(&conversation(), &message.id));
}

#[tokio::test(start_paused = true)]
async fn resumed_countdown_counts_time_already_elapsed() {
    let fixture = Fixture::proteus();
    let message = sent_ephemeral(&fixture, "e1", Duration::from_secs(10), 4);

    assert_eq!(fixture.deletion.enqueue_pending_self_deletion_messages().await.unwrap(), 1);

    let remaining = fixture.deletion.observe_time_remaining(&conversation(), &message.id).unwrap();
    assert_eq!(*remaining.borrow(), Duration::from_secs(6));

    tokio::time::sleep(Duration::from_millis(5_900)).await;
    assert!(fixture.store.contains(&conversation(), &message.id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.store.deleted(), vec![message.id]);
    assert!(fixture.store.self_deletion_starts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remaining_time_ticks_down() {
    let fixture = Fixture::proteus();
    let message = sent_ephemeral(&fixture, "e1", Duration::from_secs(5), 0);

    fixture.deletion.enqueue_pending_self_deletion_messages().await.unwrap();
    let mut remaining = fixture.deletion.observe_time_remaining(&conversation(), &message.id).unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let seen = *remaining.borrow_and_update();
    assert!(seen <= Duration::from_secs(3) && seen >= Duration::from_secs(2), "saw {seen:?}");
}

#[tokio::test(start_paused = true)]
async fn registering_twice_keeps_one_countdown() {
    let fixture = Fixture::proteus();
    let message = sent_ephemeral(&fixture, "e1", Duration::from_secs(10), 0);
    let expiration = message.expiration.unwrap();

    fixture.deletion.enqueue_self_deletion(&conversation(), &message.id, expiration);
    tokio::time::sleep(Duration::from_secs(3)).await;
    fixture.deletion.enqueue_self_deletion(&conversation(), &message.id, ExpirationData {
        expire_after: Duration::from_secs(60),
        status: SelfDeletionStatus::NotStarted,
    });

    assert_eq!(fixture.deletion.active_countdowns(), 1);
    tokio::time::sleep(Duration::from_millis(7_100)).await;
    assert_eq!(fixture.store.deleted(), vec![message.id]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_countdowns_and_keeps_start_times() {
    let fixture = Fixture::proteus();
    let message = fixture.ephemeral("e1", Duration::from_secs(10));
    fixture.store.insert(Message { status: MessageStatus::Sent, ..message.clone() });

    fixture.deletion.start_self_deletion(&conversation(), &message.id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    fixture.deletion.shutdown();

    assert_eq!(fixture.deletion.active_countdowns(), 0);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(fixture.store.deleted().is_empty());

    let stored = fixture.store.message(&conversation(), &message.id).unwrap();
    assert_eq!(
        stored.expiration.unwrap().status,
        SelfDeletionStatus::Started { start: DEFAULT_EPOCH }
    );
}

#[tokio::test(start_paused = true)]
async fn ended_countdowns_are_deleted_at_startup() {
    let fixture = Fixture::proteus();
    let ended = sent_ephemeral(&fixture, "ended", Duration::from_secs(5), 0);
    let running = sent_ephemeral(&fixture, "running", Duration::from_secs(60), 0);
    tokio::time::sleep(Duration::from_secs(10)).await;

    let deleted = fixture.deletion.delete_already_ended_self_deletion_messages().await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(fixture.store.deleted(), vec![ended.id]);
    assert!(fixture.store.contains(&conversation(), &running.id));
}

#[tokio::test(start_paused = true)]
async fn pending_messages_do_not_start_counting() {
    let fixture = Fixture::proteus();
    let message = fixture.ephemeral("e1", Duration::from_secs(10));

    fixture.deletion.start_self_deletion(&conversation(), &message.id).await.unwrap();

    assert!(!fixture.deletion.is_scheduled(&conversation(), &message.id));
    assert!(fixture.store.self_deletion_starts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_delete_releases_the_slot() {
    let fixture = Fixture::proteus();
    let message = sent_ephemeral(&fixture, "e1", Duration::from_secs(2), 0);
    fixture.store.fail_deletes();

    fixture.deletion.enqueue_pending_self_deletion_messages().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(fixture.store.contains(&conversation(), &message.id));
    assert_eq!(fixture.deletion.active_countdowns(), 0);
}
