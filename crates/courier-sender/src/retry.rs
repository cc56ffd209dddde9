//! Retry state machine for "device set changed" rejections.
//!
//! Kept free of I/O so the budget arithmetic can be tested on its own.
//!
//! ```text
//! Attempting(n) ──device set changed──► Recovering(n)
//! Recovering(n) ──reconciled, n > 0───► Attempting(n - 1)
//! Recovering(0) ──reconciled──────────► Terminal (budget exhausted)
//! Recovering(n) ──legal hold / error──► Terminal
//! Attempting(n) ──success / error─────► Terminal
//! ```

/// Phase of a send's retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    /// Submitting, with `remaining` retries left afterwards
    Attempting {
        /// Retries left after this attempt
        remaining: u32,
    },
    /// Reconciling devices after a rejection
    Recovering {
        /// Retries left once reconciliation succeeds
        remaining: u32,
    },
    /// No further attempts will be made
    Terminal,
}

/// What to do after a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Submit again with a fresh recipient snapshot
    Retry,
    /// Budget exhausted
    GiveUp,
}

/// Retry bookkeeping for one send.
#[derive(Debug, Clone)]
pub struct RetryState {
    phase: RetryPhase,
    attempts: u32,
}

impl RetryState {
    /// Start the first attempt with `budget` retries available.
    pub fn new(budget: u32) -> Self {
        Self { phase: RetryPhase::Attempting { remaining: budget }, attempts: 1 }
    }

    /// Current phase.
    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    /// Submission attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The current attempt was rejected because the device set changed.
    pub fn on_device_set_changed(&mut self) {
        if let RetryPhase::Attempting { remaining } = self.phase {
            self.phase = RetryPhase::Recovering { remaining };
        }
    }

    /// Reconciliation finished without blocking the send.
    pub fn on_reconciled(&mut self) -> RetryDecision {
        match self.phase {
            RetryPhase::Recovering { remaining } if remaining > 0 => {
                self.phase = RetryPhase::Attempting { remaining: remaining - 1 };
                self.attempts += 1;
                RetryDecision::Retry
            },
            RetryPhase::Recovering { .. } | RetryPhase::Attempting { .. } | RetryPhase::Terminal => {
                self.phase = RetryPhase::Terminal;
                RetryDecision::GiveUp
            },
        }
    }

    /// The send finished, successfully or not.
    pub fn finish(&mut self) {
        self.phase = RetryPhase::Terminal;
    }
}
