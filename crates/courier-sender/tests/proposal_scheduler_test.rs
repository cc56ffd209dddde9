//! Pending proposal commit scheduling.

mod common;

use std::{sync::Arc, time::Duration};

use common::{Fixture, conversation, group};
use courier_core::{
    Environment, GroupId, ProposalTimer, SubconversationId, SyncState,
    store::SubconversationDetails,
};
use courier_harness::{DEFAULT_EPOCH, MemoryProposalTimerStore, SimEnv};
use courier_sender::{PendingProposalScheduler, ProposalSchedulerConfig, ProposalState};

struct Scheduled {
    fixture: Fixture,
    timers: Arc<MemoryProposalTimerStore>,
    scheduler: PendingProposalScheduler<SimEnv>,
}

fn spawn_with(config: ProposalSchedulerConfig, timers: Arc<MemoryProposalTimerStore>) -> Scheduled {
    let fixture = Fixture::mls(1);
    let scheduler = PendingProposalScheduler::spawn(
        config,
        fixture.env.clone(),
        fixture.sync.observer(),
        Arc::new(fixture.crypto.clone()),
        Arc::clone(&timers) as _,
        Arc::clone(&fixture.directory) as _,
    );
    Scheduled { fixture, timers, scheduler }
}

fn spawn() -> Scheduled {
    spawn_with(ProposalSchedulerConfig::default(), Arc::new(MemoryProposalTimerStore::new()))
}

/// Lets spawned tasks run without moving the deadlines used below.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn in_secs(env: &SimEnv, secs: u64) -> courier_core::Timestamp {
    env.wall_clock().saturating_add(Duration::from_secs(secs))
}

#[tokio::test(start_paused = true)]
async fn commits_when_the_deadline_passes() {
    let s = spawn();
    settle().await;
    let due = in_secs(&s.fixture.env, 5);

    s.scheduler.schedule_commit(&group(), due).await.unwrap();
    settle().await;
    assert_eq!(s.scheduler.state(&group()), ProposalState::Scheduled { due });

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(s.fixture.crypto.commits().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(s.fixture.crypto.commits(), vec![group()]);
    assert_eq!(s.fixture.crypto.transactions(), vec!["commit_pending_proposals".to_owned()]);
    assert_eq!(s.scheduler.state(&group()), ProposalState::Idle);
    assert_eq!(s.timers.persisted_timer(&group()), None);
}

#[tokio::test(start_paused = true)]
async fn newer_timer_replaces_the_armed_one() {
    let s = spawn();
    settle().await;

    s.scheduler.schedule_commit(&group(), in_secs(&s.fixture.env, 10)).await.unwrap();
    let earlier = in_secs(&s.fixture.env, 3);
    s.scheduler.schedule_commit(&group(), earlier).await.unwrap();
    settle().await;
    assert_eq!(s.scheduler.state(&group()), ProposalState::Scheduled { due: earlier });

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(s.fixture.crypto.commits(), vec![group()]);
}

#[tokio::test(start_paused = true)]
async fn timer_set_during_a_commit_stays_persisted() {
    let s = spawn();
    s.fixture.crypto.set_commit_delay(Duration::from_secs(5));
    settle().await;

    s.scheduler.schedule_commit(&group(), in_secs(&s.fixture.env, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(s.scheduler.state(&group()), ProposalState::Committing);

    let later = in_secs(&s.fixture.env, 60);
    s.scheduler.schedule_commit(&group(), later).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(s.fixture.crypto.commits(), vec![group()]);
    assert_eq!(s.scheduler.state(&group()), ProposalState::Scheduled { due: later });
    assert_eq!(s.timers.persisted_timer(&group()), Some(ProposalTimer::new(group(), later)));
}

#[tokio::test(start_paused = true)]
async fn commits_never_overlap() {
    let s = spawn();
    s.fixture.crypto.set_commit_delay(Duration::from_secs(2));
    settle().await;
    let other = GroupId::new("group-2");
    let due = in_secs(&s.fixture.env, 1);

    s.scheduler.schedule_commit(&group(), due).await.unwrap();
    s.scheduler.schedule_commit(&other, due).await.unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let committing = [group(), other.clone()]
        .iter()
        .filter(|g| s.scheduler.state(g) == ProposalState::Committing)
        .count();
    assert_eq!(committing, 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(s.fixture.crypto.commits().len(), 2);
    assert_eq!(s.fixture.crypto.max_concurrent_commits(), 1);
}

#[tokio::test(start_paused = true)]
async fn stands_down_while_sync_is_not_live() {
    let s = spawn();
    settle().await;
    s.scheduler.schedule_commit(&group(), in_secs(&s.fixture.env, 5)).await.unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    s.fixture.sync.set(SyncState::CatchingUp);
    settle().await;
    assert_eq!(s.scheduler.state(&group()), ProposalState::Idle);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(s.fixture.crypto.commits().is_empty());

    // The deadline passed while offline, so the commit runs right away.
    s.fixture.sync.set(SyncState::Live);
    settle().await;
    settle().await;
    assert_eq!(s.fixture.crypto.commits(), vec![group()]);
}

#[tokio::test(start_paused = true)]
async fn persisted_timer_from_earlier_session_is_armed_on_start() {
    let timers = Arc::new(MemoryProposalTimerStore::new());
    let due = DEFAULT_EPOCH.saturating_add(Duration::from_secs(2));
    timers.preload(ProposalTimer::new(group(), due));

    let s = spawn_with(ProposalSchedulerConfig::default(), timers);
    settle().await;
    assert_eq!(s.scheduler.state(&group()), ProposalState::Scheduled { due });

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(s.fixture.crypto.commits(), vec![group()]);
    assert_eq!(s.timers.persisted_timer(&group()), None);
}

#[tokio::test(start_paused = true)]
async fn disabled_mls_schedules_nothing() {
    let s = spawn_with(
        ProposalSchedulerConfig { mls_enabled: false },
        Arc::new(MemoryProposalTimerStore::new()),
    );

    s.scheduler.schedule_commit(&group(), in_secs(&s.fixture.env, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(s.timers.persisted_timer(&group()), None);
    assert_eq!(s.scheduler.state(&group()), ProposalState::Idle);
    assert!(s.fixture.crypto.transactions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn subconversation_timers_stay_in_memory() {
    let s = spawn();
    let call_group = GroupId::new("call-group");
    s.fixture.directory.add_subconversation(SubconversationDetails {
        parent_id: conversation(),
        id: SubconversationId::new("conference"),
        group_id: call_group.clone(),
        epoch: 1,
    });
    settle().await;
    let due = in_secs(&s.fixture.env, 30);

    s.scheduler.schedule_commit(&call_group, due).await.unwrap();

    assert_eq!(s.timers.persisted_timer(&call_group), None);
    assert_eq!(s.timers.in_memory_timer(&call_group), Some(ProposalTimer::new(call_group, due)));
}

#[tokio::test(start_paused = true)]
async fn failed_commit_returns_to_idle_and_keeps_the_timer() {
    let s = spawn();
    s.fixture.crypto.fail_commits();
    settle().await;

    s.scheduler.schedule_commit(&group(), in_secs(&s.fixture.env, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(s.scheduler.state(&group()), ProposalState::Idle);
    assert!(s.fixture.crypto.commits().is_empty());
    assert_eq!(s.fixture.crypto.rolled_back(), 1);
    assert!(s.timers.persisted_timer(&group()).is_some());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_armed_timers_but_keeps_them_persisted() {
    let mut s = spawn();
    settle().await;
    s.scheduler.schedule_commit(&group(), in_secs(&s.fixture.env, 5)).await.unwrap();
    settle().await;

    s.scheduler.shutdown();
    assert_eq!(s.scheduler.state(&group()), ProposalState::Idle);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(s.fixture.crypto.commits().is_empty());
    assert!(s.timers.persisted_timer(&group()).is_some());
}
