//! Scheduled commits of pending MLS proposals.
//!
//! Proposals received for a group must be committed by a deadline the
//! backend sets. Deadlines arrive as persisted [`ProposalTimer`]s; this
//! scheduler keeps at most one armed timer per group and commits when it
//! fires.
//!
//! # State machine (per group)
//!
//! ```text
//! Idle ──timer──► Scheduled(due) ──due──► Committing ──done──► Idle
//!                   │  ▲
//!                   └──┘ newer timer replaces due
//! ```
//!
//! Commits run one at a time across all groups. Timers are only armed while
//! sync is live: when sync drops every armed timer is cancelled, and when it
//! comes back they are re-armed from the persisted timers, so deadlines that
//! passed in the meantime commit immediately.

#![allow(clippy::disallowed_types, reason = "Registry lock is never held across an await")]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use courier_core::{
    CryptoError, CryptoTransactionProvider, Environment, GroupId, ProposalTimer, StorageError,
    SyncStateObserver, Timestamp,
    store::{ProposalTimerStore, SubconversationSource},
};
use tokio::{
    sync::{Semaphore, broadcast::error::RecvError},
    task::AbortHandle,
};

use crate::config::ProposalSchedulerConfig;

/// Observable commit state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalState {
    /// No timer armed
    Idle,
    /// Timer armed
    Scheduled {
        /// When the commit is due
        due: Timestamp,
    },
    /// Commit in progress
    Committing,
}

struct ScheduledCommit {
    due: Timestamp,
    generation: u64,
    committing: Arc<AtomicBool>,
    handle: Option<AbortHandle>,
}

impl ScheduledCommit {
    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for ScheduledCommit {
    // An in-flight commit finishes on its own; aborting it mid-transaction
    // would only force the engine to roll back.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && !self.committing.load(Ordering::Acquire)
        {
            handle.abort();
        }
    }
}

struct Shared<E: Environment> {
    config: ProposalSchedulerConfig,
    env: E,
    crypto: Arc<dyn CryptoTransactionProvider>,
    timers: Arc<dyn ProposalTimerStore>,
    commit_permit: Semaphore,
    scheduled: Mutex<HashMap<GroupId, ScheduledCommit>>,
    next_generation: AtomicU64,
}

impl<E: Environment> Shared<E> {
    fn lock_scheduled(&self) -> MutexGuard<'_, HashMap<GroupId, ScheduledCommit>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(self: &Arc<Self>, timer: ProposalTimer) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let committing = Arc::new(AtomicBool::new(false));

        let mut scheduled = self.lock_scheduled();
        let task = tokio::spawn(Arc::clone(self).fire(
            timer.clone(),
            generation,
            Arc::clone(&committing),
        ));
        let entry = ScheduledCommit {
            due: timer.due,
            generation,
            committing,
            handle: Some(task.abort_handle()),
        };

        match scheduled.insert(timer.group_id.clone(), entry) {
            Some(previous) => tracing::debug!(
                group = %timer.group_id,
                previous_due = %previous.due,
                due = %timer.due,
                "proposal timer replaced"
            ),
            None => tracing::debug!(group = %timer.group_id, due = %timer.due, "proposal timer armed"),
        }
    }

    fn cancel_all(&self) {
        let cancelled: Vec<ScheduledCommit> =
            self.lock_scheduled().drain().map(|(_, commit)| commit).collect();
        if !cancelled.is_empty() {
            tracing::debug!(cancelled = cancelled.len(), "proposal timers cancelled");
        }
    }

    async fn rearm_persisted(self: &Arc<Self>) {
        match self.timers.persisted_timers().await {
            Ok(timers) => {
                for timer in timers {
                    self.arm(timer);
                }
            },
            Err(err) => tracing::warn!(%err, "failed to load persisted proposal timers"),
        }
    }

    async fn fire(self: Arc<Self>, timer: ProposalTimer, generation: u64, committing: Arc<AtomicBool>) {
        self.env.sleep_until(timer.due).await;

        let Ok(_permit) = self.commit_permit.acquire().await else {
            return;
        };
        committing.store(true, Ordering::Release);

        match self.commit(&timer.group_id).await {
            Ok(()) => {
                tracing::info!(group = %timer.group_id, "pending proposals committed");
                if let Err(err) = self.timers.clear_proposal_timer(&timer).await {
                    tracing::warn!(group = %timer.group_id, %err, "failed to clear proposal timer");
                }
            },
            Err(err) => {
                tracing::warn!(group = %timer.group_id, %err, "failed to commit pending proposals");
            },
        }

        let mut scheduled = self.lock_scheduled();
        if scheduled.get(&timer.group_id).is_some_and(|entry| entry.generation == generation)
            && let Some(mut entry) = scheduled.remove(&timer.group_id)
        {
            entry.disarm();
        }
    }

    async fn commit(&self, group_id: &GroupId) -> Result<(), CryptoError> {
        let mut crypto = self.crypto.begin("commit_pending_proposals").await?;
        crypto.commit_pending_proposals(group_id).await?;
        crypto.finish().await
    }

    async fn drive(self: Arc<Self>, mut sync: SyncStateObserver) {
        let mut incoming = self.timers.subscribe();

        loop {
            if sync.wait_until_live().await.is_err() {
                self.cancel_all();
                return;
            }
            sync.mark_seen();
            tracing::debug!("sync live, arming proposal timers");
            self.rearm_persisted().await;

            loop {
                tokio::select! {
                    state = sync.changed() => match state {
                        Ok(state) if state.is_live() => {},
                        Ok(state) => {
                            tracing::debug!(?state, "sync no longer live, standing down");
                            self.cancel_all();
                            break;
                        },
                        Err(_) => {
                            self.cancel_all();
                            return;
                        },
                    },
                    timer = incoming.recv() => match timer {
                        Ok(timer) => self.arm(timer),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "proposal timer stream lagged, reloading");
                            self.rearm_persisted().await;
                        },
                        Err(RecvError::Closed) => return,
                    },
                }
            }
        }
    }
}

/// Commits pending proposals when their deadlines pass.
pub struct PendingProposalScheduler<E: Environment> {
    shared: Arc<Shared<E>>,
    subconversations: Arc<dyn SubconversationSource>,
    driver: Option<AbortHandle>,
}

impl<E: Environment> PendingProposalScheduler<E> {
    /// Starts the scheduler. Timers are armed as soon as `sync` is live.
    ///
    /// With MLS disabled the scheduler never arms anything.
    pub fn spawn(
        config: ProposalSchedulerConfig,
        env: E,
        sync: SyncStateObserver,
        crypto: Arc<dyn CryptoTransactionProvider>,
        timers: Arc<dyn ProposalTimerStore>,
        subconversations: Arc<dyn SubconversationSource>,
    ) -> Self {
        let enabled = config.mls_enabled;
        let shared = Arc::new(Shared {
            config,
            env,
            crypto,
            timers,
            commit_permit: Semaphore::new(1),
            scheduled: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        });

        let driver = enabled
            .then(|| tokio::spawn(Arc::clone(&shared).drive(sync)).abort_handle());
        if !enabled {
            tracing::info!("MLS disabled, proposal scheduler idle");
        }

        Self { shared, subconversations, driver }
    }

    /// Requests a commit of the group's pending proposals at `due`.
    ///
    /// The timer is persisted (in memory only for sub-conversation groups)
    /// and replaces any earlier timer for the group.
    pub async fn schedule_commit(&self, group_id: &GroupId, due: Timestamp) -> Result<(), StorageError> {
        if !self.shared.config.mls_enabled {
            return Ok(());
        }

        let in_memory = self.subconversations.is_subconversation_group(group_id).await?;
        self.shared.timers.set_proposal_timer(ProposalTimer::new(group_id.clone(), due), in_memory).await
    }

    /// Current commit state of a group.
    pub fn state(&self, group_id: &GroupId) -> ProposalState {
        match self.shared.lock_scheduled().get(group_id) {
            None => ProposalState::Idle,
            Some(entry) if entry.committing.load(Ordering::Acquire) => ProposalState::Committing,
            Some(entry) => ProposalState::Scheduled { due: entry.due },
        }
    }

    /// Stops the scheduler and cancels every armed timer. Persisted timers
    /// are kept.
    pub fn shutdown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.shared.cancel_all();
    }
}

impl<E: Environment> Drop for PendingProposalScheduler<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
