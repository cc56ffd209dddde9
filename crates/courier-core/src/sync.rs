//! Incremental sync state.
//!
//! The sync engine lives outside this workspace; it only publishes its state
//! here. Sends wait for `Live` before hitting the network, and the proposal
//! scheduler runs only while sync is `Live`.

use tokio::sync::watch;

use crate::error::SyncError;

/// State of the event stream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Sync has not started
    Pending,
    /// Connected, processing the backlog of pending events
    CatchingUp,
    /// Connected and up to date
    Live,
    /// Sync stopped with an error and will retry on its own schedule
    Failed {
        /// Reason reported by the sync engine
        reason: String,
    },
}

impl SyncState {
    /// Whether sync is up to date.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

/// Publishing side of the sync state, owned by the sync engine.
#[derive(Debug)]
pub struct SyncStateHandle {
    tx: watch::Sender<SyncState>,
}

impl SyncStateHandle {
    /// Create a handle publishing `initial`.
    pub fn new(initial: SyncState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publishes a new state. Observers are only woken if it changed.
    pub fn set(&self, state: SyncState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// New observer of this state.
    pub fn observer(&self) -> SyncStateObserver {
        SyncStateObserver { rx: self.tx.subscribe() }
    }
}

/// Read side of the sync state.
#[derive(Debug, Clone)]
pub struct SyncStateObserver {
    rx: watch::Receiver<SyncState>,
}

impl SyncStateObserver {
    /// Latest published state.
    pub fn current(&self) -> SyncState {
        self.rx.borrow().clone()
    }

    /// Waits until sync is live, however long that takes.
    pub async fn wait_until_live(&mut self) -> Result<(), SyncError> {
        self.rx.wait_for(SyncState::is_live).await.map(|_| ()).map_err(|_| SyncError::Closed)
    }

    /// Waits until sync is live, giving up as soon as it fails or if it is
    /// not running at all.
    pub async fn wait_until_live_or_failure(&mut self) -> Result<(), SyncError> {
        let state = self
            .rx
            .wait_for(|state| !matches!(state, SyncState::CatchingUp))
            .await
            .map_err(|_| SyncError::Closed)?
            .clone();

        match state {
            SyncState::Live => Ok(()),
            SyncState::Pending => Err(SyncError::NotRunning),
            SyncState::Failed { reason } => Err(SyncError::Failed { reason }),
            SyncState::CatchingUp => Err(SyncError::NotRunning),
        }
    }

    /// Waits for the next state change and returns the new state.
    pub async fn changed(&mut self) -> Result<SyncState, SyncError> {
        self.rx.changed().await.map_err(|_| SyncError::Closed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Marks the current state as seen so [`Self::changed`] only reports
    /// later transitions.
    pub fn mark_seen(&mut self) -> SyncState {
        self.rx.borrow_and_update().clone()
    }
}
