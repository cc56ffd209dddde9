//! Fuzz target for the send retry state machine
//!
//! # Invariants
//!
//! - Attempts never exceed budget + 1
//! - Terminal is absorbing
//! - A retry is only granted while budget remains

#![no_main]

use arbitrary::Arbitrary;
use courier_sender::{RetryDecision, RetryPhase, RetryState};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Copy, Arbitrary)]
enum RetryOp {
    DeviceSetChanged,
    Reconciled,
    Finish,
}

#[derive(Debug, Arbitrary)]
struct Input {
    budget: u8,
    ops: Vec<RetryOp>,
}

fuzz_target!(|input: Input| {
    let budget = u32::from(input.budget);
    let mut retry = RetryState::new(budget);
    let mut retries = 0u32;

    for op in input.ops {
        let before = retry.phase();
        match op {
            RetryOp::DeviceSetChanged => retry.on_device_set_changed(),
            RetryOp::Reconciled => {
                if retry.on_reconciled() == RetryDecision::Retry {
                    assert!(matches!(before, RetryPhase::Recovering { remaining } if remaining > 0));
                    retries += 1;
                }
            },
            RetryOp::Finish => retry.finish(),
        }

        if before == RetryPhase::Terminal {
            assert_eq!(retry.phase(), RetryPhase::Terminal);
        }
        assert!(retries <= budget);
        assert_eq!(retry.attempts(), retries + 1);
    }
});
