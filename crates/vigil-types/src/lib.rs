//! `vigil-types` – shared data model for the Vigil safety supervision core.
//!
//! Every crate in the workspace speaks these types: the global
//! [`SafetyState`], the per-task [`TaskState`] lifecycle, the fault taxonomy
//! ([`FaultKind`]), structured [`SafetyEvent`] log entries, task and
//! system-wide statistics, and the static configuration tables.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Global safety state
// ────────────────────────────────────────────────────────────────────────────

/// Global operating state of the supervised system.
///
/// `SafeStop` is terminal: once entered, no transition leaves it short of an
/// external reset of the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyState {
    /// All monitors healthy; outputs enabled.
    Normal,
    /// Reduced-functionality mode, entered only through an explicit policy
    /// decision (never automatically from a single event).
    Degraded,
    /// A bounded-retry recovery attempt is in flight.
    Recovery,
    /// Terminal fail-safe halt: outputs disabled, monitors stopped.
    SafeStop,
}

impl SafetyState {
    /// `true` only for [`SafetyState::SafeStop`].
    pub fn is_terminal(self) -> bool {
        matches!(self, SafetyState::SafeStop)
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyState::Normal => "normal",
            SafetyState::Degraded => "degraded",
            SafetyState::Recovery => "recovery",
            SafetyState::SafeStop => "safe_stop",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Task lifecycle
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a monitored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Init,
    Ready,
    Running,
    Blocked,
    Suspended,
    Terminated,
    /// Reached from any non-terminal state on an unrecovered violation.
    Error,
}

impl TaskState {
    /// Whether a transition `self → next` is part of the legal lifecycle.
    ///
    /// Legal flow: Init → Ready → Running → {Blocked, Suspended} → Ready,
    /// any non-terminal state → Terminated or Error, and Error → Ready
    /// (the `reset_task_monitoring` path). Self-transitions are allowed.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        if self == next {
            return true;
        }
        match self {
            Init => matches!(next, Ready | Terminated | Error),
            Ready => matches!(next, Running | Suspended | Terminated | Error),
            Running => matches!(next, Ready | Blocked | Suspended | Terminated | Error),
            Blocked => matches!(next, Ready | Running | Terminated | Error),
            Suspended => matches!(next, Ready | Terminated | Error),
            Terminated => false,
            Error => matches!(next, Ready | Terminated),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Init => "init",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Blocked => "blocked",
            TaskState::Suspended => "suspended",
            TaskState::Terminated => "terminated",
            TaskState::Error => "error",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Fault taxonomy
// ────────────────────────────────────────────────────────────────────────────

/// Every category of violation the supervision core can detect or be told
/// about by collaborating modules (CAN stack, sensor drivers, comms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    ControlFlowViolation,
    DeadlineMissed,
    RuntimeExceeded,
    StackOverflow,
    MemoryCorruption,
    RedundancyMismatch,
    TaskInterference,
    /// Anything reported with a kind the core does not know. Treated as
    /// immediately fatal.
    Unrecognized,
}

impl FaultKind {
    /// Kinds that bypass the recovery engine and escalate straight to
    /// SafeStop: stack corruption risks system-wide memory safety, and an
    /// unknown fault cannot have a corrective action.
    pub fn is_immediately_fatal(self) -> bool {
        matches!(self, FaultKind::StackOverflow | FaultKind::Unrecognized)
    }

    /// Kinds that are purely informational: recorded in statistics and the
    /// event log but never routed to recovery or the state machine.
    pub fn is_informational(self) -> bool {
        matches!(self, FaultKind::TaskInterference)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::ControlFlowViolation => "control_flow_violation",
            FaultKind::DeadlineMissed => "deadline_missed",
            FaultKind::RuntimeExceeded => "runtime_exceeded",
            FaultKind::StackOverflow => "stack_overflow",
            FaultKind::MemoryCorruption => "memory_corruption",
            FaultKind::RedundancyMismatch => "redundancy_mismatch",
            FaultKind::TaskInterference => "task_interference",
            FaultKind::Unrecognized => "unrecognized",
        };
        f.write_str(s)
    }
}

/// Outcome of a single recovery engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryResult {
    /// The corrective action worked; attempt counter reset, state Normal.
    Success,
    /// The attempt failed or is still backing off; a retry is scheduled.
    Retry,
    /// The retry budget is exhausted (or the kind has no corrective
    /// action); the caller must engage the safe state.
    FailSafe,
}

// ────────────────────────────────────────────────────────────────────────────
// Safety events
// ────────────────────────────────────────────────────────────────────────────

/// One structured entry in the bounded safety-event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Free-text description, e.g. `"deadline miss: brake_ctrl"`.
    pub description: String,
    /// Numeric parameter whose meaning depends on the description
    /// (checkpoint id, region index, miss count, …).
    pub param: u64,
}

impl SafetyEvent {
    pub fn new(description: impl Into<String>, param: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            description: description.into(),
            param,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Statistics
// ────────────────────────────────────────────────────────────────────────────

/// Per-task counters maintained by the monitor threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub deadline_misses: u32,
    pub control_flow_violations: u32,
    pub interference_count: u32,
    pub recovery_attempts: u32,
    /// High-water mark of observed stack usage, in bytes.
    pub stack_usage_peak: usize,
    pub cpu_usage_percent: u8,
    /// Latched when measured free stack dropped below the task's floor.
    pub stack_overflow: bool,
}

/// System-wide counters across all monitors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub control_flow_violations: u32,
    pub timing_violations: u32,
    pub memory_violations: u32,
    pub redundancy_mismatches: u32,
    pub successful_recoveries: u32,
    pub failed_recoveries: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Registration-time description of a task to supervise. All fields are
/// immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique task name; registration fails on duplicates.
    pub name: String,
    /// Maximum time between two checkpoints before a deadline miss.
    pub deadline_ms: u64,
    /// Maximum length of one execution window.
    pub max_runtime_ms: u64,
    /// Minimum free stack; dropping below it latches a stack overflow.
    pub min_stack_remaining: usize,
    /// Nominal period of the task; informational, used by load shedding.
    pub expected_cycle_time_ms: u64,
    /// Critical tasks escalate deadline-miss exhaustion straight to
    /// SafeStop instead of the recovery engine.
    pub is_critical: bool,
    /// Allocates a triplicated output buffer verified by the voter.
    pub needs_redundancy: bool,
    /// Preemptions per scan interval tolerated before interference is
    /// logged.
    pub max_interference_count: u32,
}

impl TaskConfig {
    /// A sensible non-critical default for the given name: 100 ms deadline,
    /// 50 ms runtime cap, 512 B stack floor.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deadline_ms: 100,
            max_runtime_ms: 50,
            min_stack_remaining: 512,
            expected_cycle_time_ms: 100,
            is_critical: false,
            needs_redundancy: false,
            max_interference_count: 8,
        }
    }
}

/// Static configuration table for the whole supervision core.
///
/// Defaults reproduce the shipped firmware constants; deployments override
/// individual fields at construction time, never at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub max_monitored_tasks: usize,
    pub max_recovery_attempts: u32,
    /// Cadence of the safety-monitor thread (control flow, memory,
    /// redundancy, recovery polling).
    pub safety_monitor_period_ms: u64,
    /// Cadence of the task-scan thread (deadline/runtime/stack checks).
    pub task_monitor_period_ms: u64,
    /// Cadence of per-task CPU accounting.
    pub cpu_sample_period_ms: u64,
    /// System CPU load (percent) above which a warning is logged.
    pub cpu_overload_threshold: u8,
    pub recovery_initial_delay_ms: u64,
    pub recovery_backoff_factor: u32,
    pub recovery_max_delay_ms: u64,
    /// Consecutive deadline misses tolerated before escalation.
    pub max_missed_deadlines: u32,
    pub max_event_log_size: usize,
    pub max_sequences: usize,
    pub max_checkpoints: usize,
    pub max_protected_regions: usize,
    /// Alignment and granularity required of protected regions.
    pub page_size: usize,
    /// Tolerance applied when voting over triplicated task outputs.
    pub redundancy_tolerance: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_monitored_tasks: 16,
            max_recovery_attempts: 3,
            safety_monitor_period_ms: 100,
            task_monitor_period_ms: 10,
            cpu_sample_period_ms: 1000,
            cpu_overload_threshold: 80,
            recovery_initial_delay_ms: 100,
            recovery_backoff_factor: 2,
            recovery_max_delay_ms: 2000,
            max_missed_deadlines: 3,
            max_event_log_size: 64,
            max_sequences: 8,
            max_checkpoints: 16,
            max_protected_regions: 8,
            page_size: 4096,
            redundancy_tolerance: 1e-6,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type for every fallible API in the supervision core.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum VigilError {
    #[error("resource exhausted: {what} (capacity {capacity})")]
    ResourceExhausted { what: &'static str, capacity: usize },

    #[error("capacity exceeded: {what} (capacity {capacity})")]
    CapacityExceeded { what: &'static str, capacity: usize },

    #[error("task already registered: {0}")]
    DuplicateTask(String),

    #[error("unknown task id {0}")]
    UnknownTask(usize),

    #[error("unknown sequence id {0}")]
    UnknownSequence(usize),

    #[error("unknown region id {0}")]
    UnknownRegion(usize),

    #[error("address {addr:#x} is not aligned to {page_size} bytes")]
    NotAligned { addr: usize, page_size: usize },

    #[error("region [{addr:#x}, +{size}) overlaps an existing protected region")]
    Overlap { addr: usize, size: usize },

    #[error("invalid task state transition {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("bus fault accessing [{addr:#x}, +{len})")]
    BusFault { addr: usize, len: usize },

    #[error("task has no redundancy buffer: {0}")]
    NoRedundancy(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_stop_is_the_only_terminal_state() {
        assert!(SafetyState::SafeStop.is_terminal());
        assert!(!SafetyState::Normal.is_terminal());
        assert!(!SafetyState::Degraded.is_terminal());
        assert!(!SafetyState::Recovery.is_terminal());
    }

    #[test]
    fn fault_kind_serialization_roundtrip() {
        let kind = FaultKind::MemoryCorruption;
        let json = serde_json::to_string(&kind).unwrap();
        let back: FaultKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, back);
    }

    #[test]
    fn fatal_kinds_bypass_recovery() {
        assert!(FaultKind::StackOverflow.is_immediately_fatal());
        assert!(FaultKind::Unrecognized.is_immediately_fatal());
        assert!(!FaultKind::DeadlineMissed.is_immediately_fatal());
        assert!(!FaultKind::MemoryCorruption.is_immediately_fatal());
    }

    #[test]
    fn interference_is_informational_only() {
        assert!(FaultKind::TaskInterference.is_informational());
        assert!(!FaultKind::ControlFlowViolation.is_informational());
    }

    #[test]
    fn legal_lifecycle_transitions() {
        use TaskState::*;
        assert!(Init.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Blocked));
        assert!(Running.can_transition_to(Suspended));
        assert!(Blocked.can_transition_to(Ready));
        assert!(Running.can_transition_to(Terminated));
    }

    #[test]
    fn error_is_reachable_from_non_terminal_states() {
        use TaskState::*;
        for state in [Init, Ready, Running, Blocked, Suspended] {
            assert!(state.can_transition_to(Error), "{state} -> Error");
        }
        assert!(!Terminated.can_transition_to(Error));
    }

    #[test]
    fn error_recovers_only_to_ready() {
        use TaskState::*;
        assert!(Error.can_transition_to(Ready));
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Blocked));
    }

    #[test]
    fn terminated_is_final() {
        use TaskState::*;
        for state in [Init, Ready, Running, Blocked, Suspended, Error] {
            assert!(!Terminated.can_transition_to(state));
        }
    }

    #[test]
    fn safety_event_roundtrip() {
        let event = SafetyEvent::new("deadline miss: brake_ctrl", 3);
        let json = serde_json::to_string(&event).unwrap();
        let back: SafetyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(back.description, "deadline miss: brake_ctrl");
        assert_eq!(back.param, 3);
    }

    #[test]
    fn default_config_matches_firmware_constants() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.max_monitored_tasks, 16);
        assert_eq!(cfg.max_recovery_attempts, 3);
        assert_eq!(cfg.safety_monitor_period_ms, 100);
        assert_eq!(cfg.recovery_initial_delay_ms, 100);
        assert_eq!(cfg.recovery_backoff_factor, 2);
        assert_eq!(cfg.recovery_max_delay_ms, 2000);
        assert_eq!(cfg.max_missed_deadlines, 3);
        assert_eq!(cfg.page_size, 4096);
    }

    #[test]
    fn vigil_error_display() {
        let err = VigilError::NotAligned {
            addr: 0x1001,
            page_size: 4096,
        };
        assert!(err.to_string().contains("0x1001"));

        let err2 = VigilError::ResourceExhausted {
            what: "monitored tasks",
            capacity: 16,
        };
        assert!(err2.to_string().contains("monitored tasks"));
    }
}
