//! [`SafetyStateMachine`] – the global Normal/Degraded/Recovery/SafeStop
//! state, plus the [`OutputGuard`] seam through which the core reaches the
//! outside world when it halts.
//!
//! The state is a single atomic so [`SafetyStateMachine::get`] never
//! blocks, including while a monitor thread is parked forever inside
//! `enter_safe_state`. SafeStop is terminal: no transition leaves it short
//! of an external process reset.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{error, warn};
use vigil_types::{SafetyEvent, SafetyState};

// ────────────────────────────────────────────────────────────────────────────
// Output guard seam
// ────────────────────────────────────────────────────────────────────────────

/// Outward calls the core makes when escalating. Implemented by the
/// actuator/communication modules that own the hardware.
pub trait OutputGuard: Send + Sync {
    /// Disable every actuator output. Must be safe to call repeatedly.
    fn disable_all_outputs(&self);

    /// Tell the supervising controller the system entered the safe state.
    fn notify_safe_state(&self, event: &SafetyEvent);

    /// Request an unconditional cold reset (critical memory corruption
    /// with no usable mirror).
    fn request_cold_reset(&self);
}

/// Default guard that only logs; the demo binary and tests use it.
pub struct LoggingOutputGuard;

impl OutputGuard for LoggingOutputGuard {
    fn disable_all_outputs(&self) {
        error!("disabling all actuator outputs");
    }

    fn notify_safe_state(&self, event: &SafetyEvent) {
        error!(description = %event.description, "notifying supervising controller of safe state");
    }

    fn request_cold_reset(&self) {
        error!("cold reset requested");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// State machine
// ────────────────────────────────────────────────────────────────────────────

const NORMAL: u8 = 0;
const DEGRADED: u8 = 1;
const RECOVERY: u8 = 2;
const SAFE_STOP: u8 = 3;

fn encode(state: SafetyState) -> u8 {
    match state {
        SafetyState::Normal => NORMAL,
        SafetyState::Degraded => DEGRADED,
        SafetyState::Recovery => RECOVERY,
        SafetyState::SafeStop => SAFE_STOP,
    }
}

fn decode(raw: u8) -> SafetyState {
    match raw {
        NORMAL => SafetyState::Normal,
        DEGRADED => SafetyState::Degraded,
        RECOVERY => SafetyState::Recovery,
        _ => SafetyState::SafeStop,
    }
}

/// Lock-free holder of the global [`SafetyState`].
pub struct SafetyStateMachine {
    state: AtomicU8,
}

impl Default for SafetyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyStateMachine {
    /// Starts in [`SafetyState::Normal`].
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(NORMAL),
        }
    }

    pub fn get(&self) -> SafetyState {
        decode(self.state.load(Ordering::SeqCst))
    }

    /// Attempt a transition to `to`.
    ///
    /// Returns `false` (leaving the state untouched) when the machine is
    /// already in terminal SafeStop and `to` differs. Every other request
    /// is applied; policy about *when* to move (e.g. Degraded only through
    /// an explicit hook) lives in the supervisor, not here.
    pub fn transition(&self, to: SafetyState) -> bool {
        let target = encode(to);
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current == SAFE_STOP && target != SAFE_STOP {
                warn!(requested = %to, "transition refused: safe stop is terminal");
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                target,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}
