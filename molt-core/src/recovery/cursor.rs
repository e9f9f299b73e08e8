//! The step cursor: aligns replay with live execution.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Monotonic step bookkeeping for one subtask instance.
///
/// Holds the last durably recorded step from storage (the recovery target),
/// the step most recently replayed, and the dispenser for fresh live steps.
/// Live steps start at `recovery_target + 1`, so every step assigned after a
/// restart is strictly greater than anything already in the log.
pub struct StepCursor {
    recovery_target: u64,
    replayed: AtomicU64,
    next_live: AtomicU64,
    recovery_completed: AtomicBool,
}

impl StepCursor {
    /// Create a cursor for a log whose last recorded step is
    /// `recovery_target` (zero for an empty log, in which case recovery is
    /// complete from the start).
    pub fn new(recovery_target: u64) -> Self {
        Self {
            recovery_target,
            replayed: AtomicU64::new(0),
            next_live: AtomicU64::new(recovery_target + 1),
            recovery_completed: AtomicBool::new(recovery_target == 0),
        }
    }

    pub fn recovery_target(&self) -> u64 {
        self.recovery_target
    }

    pub fn last_replayed(&self) -> u64 {
        self.replayed.load(Ordering::Acquire)
    }

    /// Dispense the next live step number.
    pub fn next_step(&self) -> u64 {
        self.next_live.fetch_add(1, Ordering::AcqRel)
    }

    /// Record that `step` has been replayed. Completes recovery exactly once
    /// when the target is reached.
    pub fn advance_replayed(&self, step: u64) {
        debug_assert!(step > self.replayed.load(Ordering::Acquire));
        self.replayed.store(step, Ordering::Release);
        if step >= self.recovery_target {
            self.mark_recovery_completed();
        }
    }

    /// True once live execution owns the schedule again.
    pub fn is_recovery_completed(&self) -> bool {
        self.recovery_completed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_recovery_completed(&self) {
        if !self.recovery_completed.swap(true, Ordering::AcqRel) {
            tracing::info!(
                recovery_target = self.recovery_target,
                "replay caught up with the recovery target, switching to live execution"
            );
        }
    }
}
