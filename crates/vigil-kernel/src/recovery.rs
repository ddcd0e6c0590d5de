//! [`RecoveryEngine`] – bounded-retry corrective-action dispatcher.
//!
//! Each fault kind gets a per-kind retry budget and an exponential backoff
//! delay (initial × factor^n, capped). The backoff is *deferred*, not
//! slept: a failed attempt schedules a due time and the safety-monitor
//! thread re-drives it through [`RecoveryEngine::poll_due`] on its next
//! pass, so one kind's backoff never starves the other monitors. At most
//! one attempt per kind is ever in flight.
//!
//! Corrective actions live behind the [`RecoveryActions`] trait, dispatched
//! by an exhaustive match on [`FaultKind`] (no nullable handler tables):
//! control-flow violations reset the checkpoint buffers, memory corruption
//! tries a mirror restore, redundancy mismatches repair from the agreeing
//! pair, and task timing faults re-arm the offending task's monitoring.
//! Kinds with no corrective action are immediately fail-safe.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use vigil_types::{FaultKind, RecoveryResult};

use crate::task_registry::TaskId;

// ────────────────────────────────────────────────────────────────────────────
// Types
// ────────────────────────────────────────────────────────────────────────────

/// One fault to recover from: the kind plus the offending task, when the
/// fault is task-scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub task: Option<TaskId>,
}

impl Fault {
    pub fn system(kind: FaultKind) -> Self {
        Self { kind, task: None }
    }

    pub fn task(kind: FaultKind, task: TaskId) -> Self {
        Self {
            kind,
            task: Some(task),
        }
    }
}

/// The corrective actions the engine can dispatch. Implemented by the
/// supervisor, which owns the subsystems the actions operate on. Each
/// action returns whether the system verified clean afterwards.
pub trait RecoveryActions {
    /// Reset checkpoint buffers and re-verify every sequence.
    fn recover_control_flow(&self) -> bool;

    /// Attempt mirror restoration of corrupted regions.
    fn recover_memory(&self) -> bool;

    /// Re-vote redundant values, repairing from agreement.
    fn recover_redundancy(&self) -> bool;

    /// Re-arm monitoring of a task that missed its timing contract.
    fn recover_task(&self, task: TaskId) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
struct AttemptState {
    attempts: u32,
    /// Current backoff delay; monotonically non-decreasing across
    /// consecutive failures until a success resets it.
    delay_ms: u64,
    last_attempt: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRetry {
    fault: Fault,
    due: Instant,
}

/// Per-kind bounded-retry engine. One instance per supervisor.
pub struct RecoveryEngine {
    states: HashMap<FaultKind, AttemptState>,
    pending: HashMap<FaultKind, PendingRetry>,
    max_attempts: u32,
    initial_delay_ms: u64,
    backoff_factor: u32,
    max_delay_ms: u64,
}

impl RecoveryEngine {
    pub fn new(
        max_attempts: u32,
        initial_delay_ms: u64,
        backoff_factor: u32,
        max_delay_ms: u64,
    ) -> Self {
        Self {
            states: HashMap::new(),
            pending: HashMap::new(),
            max_attempts,
            initial_delay_ms,
            backoff_factor,
            max_delay_ms,
        }
    }

    /// Attempt recovery of `fault` at time `now`.
    ///
    /// Returns [`RecoveryResult::Success`] when the corrective action
    /// verified clean (the kind's attempt counter resets immediately),
    /// [`RecoveryResult::Retry`] when the attempt failed and a backoff
    /// retry is scheduled (or one is already pending), and
    /// [`RecoveryResult::FailSafe`] when the kind has no corrective action
    /// or its retry budget is exhausted; the caller must engage the safe
    /// state.
    pub fn attempt(
        &mut self,
        fault: Fault,
        actions: &dyn RecoveryActions,
        now: Instant,
    ) -> RecoveryResult {
        if fault.kind.is_immediately_fatal() {
            return RecoveryResult::FailSafe;
        }
        if fault.kind.is_informational() {
            return RecoveryResult::Success;
        }

        // Never run overlapping attempts for one kind: while a retry is
        // pending and not yet due, report Retry without acting.
        if let Some(pending) = self.pending.get(&fault.kind) {
            if now < pending.due {
                return RecoveryResult::Retry;
            }
        }
        self.pending.remove(&fault.kind);

        let (initial, factor, cap) = (self.initial_delay_ms, self.backoff_factor, self.max_delay_ms);
        let state = self.states.entry(fault.kind).or_default();
        if state.attempts >= self.max_attempts {
            return RecoveryResult::FailSafe;
        }
        state.last_attempt = Some(now);

        if Self::dispatch(fault, actions) {
            info!(kind = %fault.kind, attempts = state.attempts + 1, "recovery succeeded");
            *state = AttemptState::default();
            return RecoveryResult::Success;
        }

        state.attempts += 1;
        if state.attempts >= self.max_attempts {
            warn!(kind = %fault.kind, attempts = state.attempts, "recovery budget exhausted");
            return RecoveryResult::FailSafe;
        }

        state.delay_ms = backoff_delay(initial, factor, cap, state.attempts);
        let due = now + Duration::from_millis(state.delay_ms);
        warn!(
            kind = %fault.kind,
            attempt = state.attempts,
            delay_ms = state.delay_ms,
            "recovery failed; retry scheduled"
        );
        self.pending.insert(fault.kind, PendingRetry { fault, due });
        RecoveryResult::Retry
    }

    /// Re-drive every pending retry whose backoff has elapsed. Called by
    /// the safety-monitor thread each pass.
    pub fn poll_due(
        &mut self,
        actions: &dyn RecoveryActions,
        now: Instant,
    ) -> Vec<(Fault, RecoveryResult)> {
        let due: Vec<Fault> = self
            .pending
            .values()
            .filter(|p| now >= p.due)
            .map(|p| p.fault)
            .collect();
        due.into_iter()
            .map(|fault| (fault, self.attempt(fault, actions, now)))
            .collect()
    }

    /// `true` while any retry is scheduled; the global state should read
    /// Recovery for the duration.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Attempts consumed so far for `kind`.
    pub fn attempts(&self, kind: FaultKind) -> u32 {
        self.states.get(&kind).map_or(0, |s| s.attempts)
    }

    /// Current backoff delay for `kind`, if it has failed at least once.
    pub fn current_delay_ms(&self, kind: FaultKind) -> Option<u64> {
        self.states
            .get(&kind)
            .filter(|s| s.attempts > 0)
            .map(|s| s.delay_ms)
    }

    fn dispatch(fault: Fault, actions: &dyn RecoveryActions) -> bool {
        match fault.kind {
            FaultKind::ControlFlowViolation => actions.recover_control_flow(),
            FaultKind::MemoryCorruption => actions.recover_memory(),
            FaultKind::RedundancyMismatch => actions.recover_redundancy(),
            FaultKind::DeadlineMissed | FaultKind::RuntimeExceeded => {
                fault.task.is_some_and(|id| actions.recover_task(id))
            }
            // Informational and fatal kinds are filtered before dispatch.
            FaultKind::TaskInterference => true,
            FaultKind::StackOverflow | FaultKind::Unrecognized => false,
        }
    }
}

/// `initial * factor^(n-1)` milliseconds, capped.
fn backoff_delay(initial_delay_ms: u64, backoff_factor: u32, max_delay_ms: u64, attempts: u32) -> u64 {
    let factor = u64::from(backoff_factor).saturating_pow(attempts.saturating_sub(1));
    initial_delay_ms.saturating_mul(factor).min(max_delay_ms)
}
