//! [`Supervisor`] – the root context object of the safety core.
//!
//! One `Supervisor` owns every subsystem (task registry, control-flow
//! monitor, memory guard, recovery engine, state machine, event log) and
//! exposes the whole public operation surface; there is no process-wide
//! static state anywhere in the core. Collaborating modules share it via
//! `Arc` and report their faults through [`Supervisor::handle_error`] /
//! [`Supervisor::handle_task_error`]; the monitor threads drive the
//! periodic passes ([`Supervisor::scan_tasks_once`],
//! [`Supervisor::safety_pass_once`], [`Supervisor::cpu_pass_once`]).
//!
//! # Example
//!
//! ```
//! use vigil_kernel::{SramBus, Supervisor};
//! use vigil_types::{SafetyState, SupervisorConfig, TaskConfig};
//!
//! let bus = SramBus::shared(0x1000, 4096 * 4);
//! let supervisor = Supervisor::new(SupervisorConfig::default(), bus);
//!
//! let brake = supervisor
//!     .register_monitored_task(TaskConfig::named("brake_ctrl"))
//!     .unwrap();
//! supervisor.task_monitor_checkpoint(brake).unwrap();
//! assert_eq!(supervisor.get_safety_state(), SafetyState::Normal);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use vigil_types::{
    FaultKind, RecoveryResult, SafetyEvent, SafetyState, SupervisorConfig, SupervisorStats,
    TaskConfig, TaskState, TaskStatistics, VigilError,
};

use crate::control_flow::{ControlFlowMonitor, SequenceId};
use crate::event_log::EventLog;
use crate::memory_guard::{MemoryGuard, RegionFlags, RegionId, RegionOutcome, SharedBus};
use crate::recovery::{Fault, RecoveryActions, RecoveryEngine};
use crate::redundancy::VotingOutcome;
use crate::safety_state::{LoggingOutputGuard, OutputGuard, SafetyStateMachine};
use crate::task_registry::{NullProbe, RuntimeProbe, TaskId, TaskRegistry, TaskViolation};

/// Result of one sequential task-scan pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every task was examined.
    Completed,
    /// A critical escalation engaged SafeStop part-way through; the scan
    /// stopped immediately and no further task was examined.
    SafeStopped,
}

/// The supervision core. Construct once, share via `Arc`.
pub struct Supervisor {
    config: SupervisorConfig,
    state: SafetyStateMachine,
    registry: TaskRegistry,
    control_flow: Mutex<ControlFlowMonitor>,
    /// Optional owner binding of a control-flow sequence to a task, for
    /// statistics attribution.
    sequence_owner: Mutex<HashMap<usize, TaskId>>,
    memory: Mutex<MemoryGuard>,
    recovery: Mutex<RecoveryEngine>,
    events: Mutex<EventLog>,
    stats: Mutex<SupervisorStats>,
    system_cpu_load: AtomicU8,
    outputs: Box<dyn OutputGuard>,
    probe: Box<dyn RuntimeProbe>,
}

impl Supervisor {
    /// Build a supervisor with the default (logging-only) output guard and
    /// a probe that measures nothing.
    pub fn new(config: SupervisorConfig, bus: SharedBus) -> Self {
        Self::with_collaborators(config, bus, Box::new(LoggingOutputGuard), Box::new(NullProbe))
    }

    /// Build a supervisor wired to real collaborators: the actuator-side
    /// [`OutputGuard`] and the OS-side [`RuntimeProbe`].
    pub fn with_collaborators(
        config: SupervisorConfig,
        bus: SharedBus,
        outputs: Box<dyn OutputGuard>,
        probe: Box<dyn RuntimeProbe>,
    ) -> Self {
        Self {
            registry: TaskRegistry::new(config.max_monitored_tasks, config.max_missed_deadlines),
            control_flow: Mutex::new(ControlFlowMonitor::new(
                config.max_sequences,
                config.max_checkpoints,
            )),
            sequence_owner: Mutex::new(HashMap::new()),
            memory: Mutex::new(MemoryGuard::new(
                bus,
                config.max_protected_regions,
                config.page_size,
            )),
            recovery: Mutex::new(RecoveryEngine::new(
                config.max_recovery_attempts,
                config.recovery_initial_delay_ms,
                config.recovery_backoff_factor,
                config.recovery_max_delay_ms,
            )),
            events: Mutex::new(EventLog::new(config.max_event_log_size)),
            stats: Mutex::new(SupervisorStats::default()),
            system_cpu_load: AtomicU8::new(0),
            state: SafetyStateMachine::new(),
            outputs,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // ── Task surface ──────────────────────────────────────────────────────

    pub fn register_monitored_task(&self, config: TaskConfig) -> Result<TaskId, VigilError> {
        self.registry.register(config)
    }

    /// Liveness checkpoint; resets the task's deadline timer.
    pub fn task_monitor_checkpoint(&self, id: TaskId) -> Result<(), VigilError> {
        self.registry.checkpoint(id)
    }

    pub fn begin_execution(&self, id: TaskId) -> Result<(), VigilError> {
        self.registry.begin_execution(id)
    }

    pub fn end_execution(&self, id: TaskId) -> Result<(), VigilError> {
        self.registry.end_execution(id)
    }

    pub fn set_task_state(&self, id: TaskId, state: TaskState) -> Result<(), VigilError> {
        self.registry.set_state(id, state)
    }

    pub fn get_task_statistics(&self, id: TaskId) -> Result<TaskStatistics, VigilError> {
        self.registry.statistics(id)
    }

    pub fn lookup_task(&self, name: &str) -> Option<TaskId> {
        self.registry.lookup(name)
    }

    /// Clear a task's counters and re-arm its monitoring (idempotent).
    pub fn reset_task_monitoring(&self, id: TaskId) -> Result<(), VigilError> {
        self.registry.reset_task_monitoring(id)
    }

    pub fn record_redundant_output(
        &self,
        id: TaskId,
        primary: f64,
        secondary: f64,
        reference: f64,
    ) -> Result<(), VigilError> {
        self.registry
            .record_redundant_output(id, primary, secondary, reference)
    }

    // ── Control-flow surface ──────────────────────────────────────────────

    /// Register an expected checkpoint sequence, optionally attributed to a
    /// task for statistics purposes.
    pub fn register_sequence(
        &self,
        expected: Vec<u32>,
        owner: Option<TaskId>,
    ) -> Result<SequenceId, VigilError> {
        let id = self.lock_control_flow().register_sequence(expected)?;
        if let Some(task) = owner {
            self.lock_sequence_owner().insert(id.index(), task);
        }
        Ok(id)
    }

    pub fn checkpoint_reached(&self, seq: SequenceId, checkpoint: u32) -> Result<(), VigilError> {
        self.lock_control_flow().checkpoint_reached(seq, checkpoint)
    }

    pub fn verify_sequence(&self, seq: SequenceId) -> Result<bool, VigilError> {
        self.lock_control_flow().verify(seq)
    }

    /// Re-arm a flow for its next cycle, clearing the observed buffer.
    /// Tasks call this after a verified pass through their sequence.
    pub fn reset_sequence(&self, seq: SequenceId) -> Result<(), VigilError> {
        self.lock_control_flow().reset(seq)
    }

    // ── Memory surface ────────────────────────────────────────────────────

    pub fn protect_memory_region(
        &self,
        addr: usize,
        size: usize,
        flags: RegionFlags,
    ) -> Result<RegionId, VigilError> {
        self.lock_memory().protect(addr, size, flags)
    }

    pub fn pair_memory_regions(
        &self,
        primary: usize,
        secondary: usize,
        size: usize,
        flags: RegionFlags,
    ) -> Result<(RegionId, RegionId), VigilError> {
        self.lock_memory().pair(primary, secondary, size, flags)
    }

    /// Fault-handler entry point: route a faulting address through the
    /// same violation path as the periodic check. Returns the owning
    /// region, or `None` when the address is outside every protected
    /// region.
    pub fn memory_fault(&self, addr: usize) -> Option<RegionId> {
        let hit = self.lock_memory().handle_fault(addr);
        if let Some((region, outcome)) = hit {
            self.log_safety_event(
                format!("memory fault in region {}", region.index()),
                addr as u64,
            );
            self.route_memory_outcome(region, outcome);
            return Some(region);
        }
        None
    }

    // ── Safety surface ────────────────────────────────────────────────────

    pub fn get_safety_state(&self) -> SafetyState {
        self.state.get()
    }

    /// Explicit policy hook for entering Degraded from Normal. Never
    /// triggered automatically by a single event.
    pub fn degrade(&self, reason: &str) -> bool {
        if self.get_safety_state() != SafetyState::Normal {
            warn!(reason, "degrade refused outside Normal");
            return false;
        }
        let applied = self.state.transition(SafetyState::Degraded);
        if applied {
            self.log_safety_event(format!("degraded: {reason}"), 0);
        }
        applied
    }

    pub fn log_safety_event(&self, description: impl Into<String>, param: u64) {
        self.lock_events().record(description, param);
    }

    /// The most recent `n` safety events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<SafetyEvent> {
        self.lock_events().tail(n)
    }

    pub fn safety_statistics(&self) -> SupervisorStats {
        self.lock_stats().clone()
    }

    /// System CPU load from the most recent sampling pass, in percent.
    pub fn system_cpu_load(&self) -> u8 {
        self.system_cpu_load.load(Ordering::Relaxed)
    }

    /// Terminal fail-safe halt: disables outputs, notifies the supervising
    /// controller, logs, and parks the calling thread forever. Idempotent
    /// beyond re-logging when already in SafeStop.
    pub fn enter_safe_state(&self) -> ! {
        self.engage_safe_stop("enter_safe_state called");
        loop {
            thread::park();
        }
    }

    /// Everything [`Supervisor::enter_safe_state`] does except parking the
    /// caller. Exposed so monitor loops can mark the halt and then unwind
    /// their own stacks.
    pub fn engage_safe_stop(&self, reason: &str) {
        let already = self.get_safety_state() == SafetyState::SafeStop;
        self.state.transition(SafetyState::SafeStop);
        let event = self.lock_events().record(format!("safe stop: {reason}"), 0).clone();
        if already {
            // Re-entry is a no-op beyond the re-log above.
            return;
        }
        error!(reason, "entering safe state; all outputs disabled");
        self.outputs.disable_all_outputs();
        self.outputs.notify_safe_state(&event);
    }

    // ── Fault routing ─────────────────────────────────────────────────────

    /// Entry point for system-scoped faults reported by collaborating
    /// modules (CAN stack, sensor drivers, comms).
    pub fn handle_error(&self, kind: FaultKind) -> RecoveryResult {
        self.route_fault(Fault::system(kind))
    }

    /// Entry point for task-scoped faults.
    pub fn handle_task_error(&self, id: TaskId, kind: FaultKind) -> RecoveryResult {
        self.route_fault(Fault::task(kind, id))
    }

    /// Run the recovery engine for `kind` without escalating on failure:
    /// per the engine contract the *caller* translates
    /// [`RecoveryResult::FailSafe`] into [`Supervisor::enter_safe_state`].
    pub fn attempt_recovery(&self, kind: FaultKind) -> RecoveryResult {
        self.drive_recovery(Fault::system(kind))
    }

    fn route_fault(&self, fault: Fault) -> RecoveryResult {
        self.log_safety_event(
            format!("fault reported: {}", fault.kind),
            fault.task.map_or(0, |t| t.index() as u64),
        );
        self.count_fault(fault.kind);

        if fault.kind.is_informational() {
            info!(kind = %fault.kind, "informational fault; no state change");
            return RecoveryResult::Success;
        }
        if fault.kind.is_immediately_fatal() {
            if let Some(task) = fault.task {
                let _ = self.registry.mark_error(task);
            }
            self.engage_safe_stop("fatal fault");
            return RecoveryResult::FailSafe;
        }

        let result = self.drive_recovery(fault);
        if result == RecoveryResult::FailSafe {
            self.engage_safe_stop("recovery exhausted");
        }
        result
    }

    /// Run one engine attempt and apply the state-machine and statistics
    /// bookkeeping that goes with the result.
    fn drive_recovery(&self, fault: Fault) -> RecoveryResult {
        if let Some(task) = fault.task {
            let _ = self.registry.note_recovery_attempt(task);
        }
        // Lock order: recovery before any subsystem the actions touch.
        let result = {
            let mut engine = self.lock_recovery();
            engine.attempt(fault, self, Instant::now())
        };
        match result {
            RecoveryResult::Success => {
                self.lock_stats().successful_recoveries += 1;
                self.state.transition(SafetyState::Normal);
            }
            RecoveryResult::Retry => {
                if let Some(task) = fault.task {
                    let _ = self.registry.mark_error(task);
                }
                self.state.transition(SafetyState::Recovery);
            }
            RecoveryResult::FailSafe => {
                self.lock_stats().failed_recoveries += 1;
            }
        }
        result
    }

    fn count_fault(&self, kind: FaultKind) {
        let mut stats = self.lock_stats();
        match kind {
            FaultKind::ControlFlowViolation => stats.control_flow_violations += 1,
            FaultKind::DeadlineMissed | FaultKind::RuntimeExceeded => {
                stats.timing_violations += 1
            }
            FaultKind::StackOverflow | FaultKind::MemoryCorruption => {
                stats.memory_violations += 1
            }
            FaultKind::RedundancyMismatch => stats.redundancy_mismatches += 1,
            FaultKind::TaskInterference | FaultKind::Unrecognized => {}
        }
    }

    // ── Periodic passes (driven by the monitor threads) ───────────────────

    /// One sequential task-scan pass at time `now`.
    ///
    /// Tasks are processed strictly in order; a critical deadline
    /// escalation (or any fatal violation) engages SafeStop immediately
    /// and the pass returns without examining the next task.
    pub fn scan_tasks_once(&self, now: Instant) -> ScanOutcome {
        if self.get_safety_state().is_terminal() {
            return ScanOutcome::SafeStopped;
        }
        for id in self.registry.task_ids() {
            let violations = match self.registry.check_task(id, now, self.probe.as_ref()) {
                Ok(v) => v,
                Err(err) => {
                    warn!(task = id.index(), error = %err, "task scan failed");
                    continue;
                }
            };
            for violation in violations {
                if self.route_task_violation(&violation) == RecoveryResult::FailSafe {
                    return ScanOutcome::SafeStopped;
                }
            }
        }
        ScanOutcome::Completed
    }

    fn route_task_violation(&self, violation: &TaskViolation) -> RecoveryResult {
        self.log_safety_event(
            format!("{}: {}", violation.kind, violation.name),
            violation.param,
        );
        match violation.kind {
            // A critical task exhausting its deadline budget goes straight
            // to SafeStop; the recovery engine is for the non-critical
            // path.
            FaultKind::DeadlineMissed if violation.is_critical => {
                self.count_fault(violation.kind);
                self.engage_safe_stop("critical task missed deadline budget");
                RecoveryResult::FailSafe
            }
            _ => self.route_fault(Fault::task(violation.kind, violation.task)),
        }
    }

    /// One safety-monitor pass: verify control flow, check memory, vote
    /// over redundant task outputs, and re-drive any recovery retries
    /// whose backoff has elapsed.
    pub fn safety_pass_once(&self, now: Instant) {
        if self.get_safety_state().is_terminal() {
            return;
        }

        // Control flow.
        let failing = self.lock_control_flow().verify_all();
        for seq in failing {
            let owner = self.lock_sequence_owner().get(&seq.index()).copied();
            let offender = self
                .lock_control_flow()
                .last_offender(seq)
                .ok()
                .flatten()
                .unwrap_or(0);
            self.log_safety_event(
                format!("control flow violation in sequence {}", seq.index()),
                u64::from(offender),
            );
            match owner {
                Some(task) => {
                    let _ = self.registry.note_control_flow_violation(task);
                    self.handle_task_error(task, FaultKind::ControlFlowViolation);
                }
                None => {
                    self.handle_error(FaultKind::ControlFlowViolation);
                }
            }
            if self.get_safety_state().is_terminal() {
                return;
            }
        }

        // Memory integrity.
        let outcomes = self.lock_memory().periodic_check();
        for (region, outcome) in outcomes {
            self.route_memory_outcome(region, outcome);
            if self.get_safety_state().is_terminal() {
                return;
            }
        }

        // Redundant task outputs.
        for id in self.registry.task_ids() {
            let vote = self
                .registry
                .vote_redundant(id, self.config.redundancy_tolerance);
            if let Ok(Some(VotingOutcome::Rejected { .. })) = vote {
                self.handle_task_error(id, FaultKind::RedundancyMismatch);
                if self.get_safety_state().is_terminal() {
                    return;
                }
            }
        }

        // Deferred recovery retries.
        let results = {
            let mut engine = self.lock_recovery();
            engine.poll_due(self, now)
        };
        for (fault, result) in results {
            match result {
                RecoveryResult::Success => {
                    self.lock_stats().successful_recoveries += 1;
                    self.state.transition(SafetyState::Normal);
                }
                RecoveryResult::Retry => {}
                RecoveryResult::FailSafe => {
                    self.lock_stats().failed_recoveries += 1;
                    self.log_safety_event(
                        format!("recovery exhausted: {}", fault.kind),
                        0,
                    );
                    self.engage_safe_stop("recovery exhausted");
                    return;
                }
            }
        }
    }

    /// One CPU accounting pass over the `elapsed` sampling window.
    /// Overload is a warning that informs load shedding, never a safety
    /// violation by itself.
    pub fn cpu_pass_once(&self, elapsed: Duration) {
        let load = self.registry.sample_cpu(elapsed, self.probe.as_ref());
        self.system_cpu_load.store(load, Ordering::Relaxed);
        if load > self.config.cpu_overload_threshold {
            warn!(load, threshold = self.config.cpu_overload_threshold, "system CPU overload");
            self.log_safety_event("cpu overload", u64::from(load));
        }
    }

    fn route_memory_outcome(&self, region: RegionId, outcome: RegionOutcome) {
        match outcome {
            RegionOutcome::Clean => {}
            RegionOutcome::RestoredFromMirror => {
                self.log_safety_event(
                    format!("region {} restored from mirror", region.index()),
                    region.index() as u64,
                );
            }
            RegionOutcome::Corrupted { critical: true } => {
                self.count_fault(FaultKind::MemoryCorruption);
                self.log_safety_event(
                    format!("critical region {} corrupted", region.index()),
                    region.index() as u64,
                );
                // Unrecoverable corruption of a critical region: cold
                // reset, then halt in case the reset request is ignored.
                self.outputs.request_cold_reset();
                self.engage_safe_stop("critical memory corruption");
            }
            RegionOutcome::Corrupted { critical: false } => {
                self.handle_error(FaultKind::MemoryCorruption);
            }
        }
    }

    // ── Lock helpers ──────────────────────────────────────────────────────
    // Poisoned subsystem locks are recovered rather than propagated: the
    // safety monitors must keep running after a panicked application
    // thread.

    fn lock_control_flow(&self) -> MutexGuard<'_, ControlFlowMonitor> {
        self.control_flow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sequence_owner(&self) -> MutexGuard<'_, HashMap<usize, TaskId>> {
        self.sequence_owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryGuard> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_recovery(&self) -> MutexGuard<'_, RecoveryEngine> {
        self.recovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_events(&self) -> MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, SupervisorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecoveryActions for Supervisor {
    fn recover_control_flow(&self) -> bool {
        let mut cfm = self.lock_control_flow();
        cfm.reset_all();
        cfm.verify_all().is_empty()
    }

    fn recover_memory(&self) -> bool {
        self.lock_memory().restore_corrupted()
    }

    fn recover_redundancy(&self) -> bool {
        // Re-vote everything; a single drifted member is repaired by the
        // agreeing pair, a three-way disagreement stays rejected.
        self.registry.task_ids().into_iter().all(|id| {
            !matches!(
                self.registry
                    .vote_redundant(id, self.config.redundancy_tolerance),
                Ok(Some(VotingOutcome::Rejected { .. }))
            )
        })
    }

    fn recover_task(&self, task: TaskId) -> bool {
        self.registry.reset_task_monitoring(task).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_guard::SramBus;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    const PAGE: usize = 4096;
    const BASE: usize = 0x2000_0000;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn supervisor() -> (Arc<Supervisor>, SharedBus) {
        let bus = SramBus::shared(BASE, 8 * PAGE);
        (
            Arc::new(Supervisor::new(SupervisorConfig::default(), bus.clone())),
            bus,
        )
    }

    fn brake_config() -> TaskConfig {
        TaskConfig {
            deadline_ms: 50,
            is_critical: true,
            ..TaskConfig::named("brake_ctrl")
        }
    }

    #[test]
    fn starts_normal() {
        let (sup, _bus) = supervisor();
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
    }

    #[test]
    fn critical_deadline_exhaustion_engages_safe_stop() {
        let (sup, _bus) = supervisor();
        let id = sup.register_monitored_task(brake_config()).unwrap();
        let t0 = Instant::now();

        // 200 ms of scanning with no checkpoint: misses accrue once per
        // 50 ms deadline period; the third consecutive miss escalates.
        let mut outcome = ScanOutcome::Completed;
        for tick in 1..=20 {
            outcome = sup.scan_tasks_once(t0 + ms(10 * tick));
            if outcome == ScanOutcome::SafeStopped {
                break;
            }
        }
        assert_eq!(outcome, ScanOutcome::SafeStopped);
        assert_eq!(sup.get_safety_state(), SafetyState::SafeStop);
        assert!(sup.get_task_statistics(id).unwrap().deadline_misses >= 3);

        // Further scans are refused.
        assert_eq!(
            sup.scan_tasks_once(Instant::now() + ms(1000)),
            ScanOutcome::SafeStopped
        );
    }

    #[test]
    fn non_critical_misses_below_budget_keep_normal() {
        let (sup, _bus) = supervisor();
        let config = TaskConfig {
            deadline_ms: 50,
            ..TaskConfig::named("telemetry")
        };
        sup.register_monitored_task(config).unwrap();
        let t0 = Instant::now();

        // Two consecutive misses: below the budget of three.
        sup.scan_tasks_once(t0 + ms(60));
        sup.scan_tasks_once(t0 + ms(120));
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
    }

    #[test]
    fn non_critical_exhaustion_recovers_via_task_reset() {
        let (sup, _bus) = supervisor();
        let config = TaskConfig {
            deadline_ms: 50,
            ..TaskConfig::named("telemetry")
        };
        let id = sup.register_monitored_task(config).unwrap();
        let t0 = Instant::now();

        for tick in 1..=20 {
            sup.scan_tasks_once(t0 + ms(10 * tick));
        }
        // The recovery engine reset the task instead of halting.
        assert_ne!(sup.get_safety_state(), SafetyState::SafeStop);
        assert_eq!(sup.registry.state(id).unwrap(), TaskState::Ready);
        assert!(sup.safety_statistics().successful_recoveries >= 1);
    }

    #[test]
    fn stack_overflow_is_fatal_even_for_non_critical_tasks() {
        struct ShallowStackProbe;
        impl RuntimeProbe for ShallowStackProbe {
            fn stack(&self, _task: &str) -> Option<crate::task_registry::StackReport> {
                Some(crate::task_registry::StackReport {
                    free_bytes: 16,
                    used_bytes: 2032,
                })
            }
            fn preemptions(&self, _task: &str) -> Option<u32> {
                None
            }
            fn cpu_time(&self, _task: &str) -> Option<Duration> {
                None
            }
        }

        let bus = SramBus::shared(BASE, PAGE);
        let sup = Supervisor::with_collaborators(
            SupervisorConfig::default(),
            bus,
            Box::new(LoggingOutputGuard),
            Box::new(ShallowStackProbe),
        );
        sup.register_monitored_task(TaskConfig::named("logger")).unwrap();

        assert_eq!(sup.scan_tasks_once(Instant::now()), ScanOutcome::SafeStopped);
        assert_eq!(sup.get_safety_state(), SafetyState::SafeStop);
    }

    #[test]
    fn unrecognized_fault_is_immediately_fatal() {
        let (sup, _bus) = supervisor();
        assert_eq!(
            sup.handle_error(FaultKind::Unrecognized),
            RecoveryResult::FailSafe
        );
        assert_eq!(sup.get_safety_state(), SafetyState::SafeStop);
    }

    #[test]
    fn interference_changes_nothing_but_statistics() {
        let (sup, _bus) = supervisor();
        let id = sup.register_monitored_task(TaskConfig::named("can_rx")).unwrap();
        assert_eq!(
            sup.handle_task_error(id, FaultKind::TaskInterference),
            RecoveryResult::Success
        );
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
    }

    #[test]
    fn control_flow_violation_recovers_by_buffer_reset() {
        let (sup, _bus) = supervisor();
        let seq = sup.register_sequence(vec![0x1, 0x2, 0x4], None).unwrap();
        sup.checkpoint_reached(seq, 0x4).unwrap(); // deviation

        sup.safety_pass_once(Instant::now());
        // First attempt resets the buffers and re-verifies clean.
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
        assert!(sup.verify_sequence(seq).unwrap());
        assert_eq!(sup.safety_statistics().control_flow_violations, 1);
    }

    #[test]
    fn sequence_owner_gets_statistics_attribution() {
        let (sup, _bus) = supervisor();
        let id = sup.register_monitored_task(TaskConfig::named("fuel_map")).unwrap();
        let seq = sup.register_sequence(vec![0x1, 0x2], Some(id)).unwrap();
        sup.checkpoint_reached(seq, 0x7).unwrap();

        sup.safety_pass_once(Instant::now());
        assert_eq!(
            sup.get_task_statistics(id).unwrap().control_flow_violations,
            1
        );
    }

    #[test]
    fn protect_then_check_is_stable() {
        let (sup, bus) = supervisor();
        bus.lock().unwrap().write(BASE, b"steering gains").unwrap();
        sup.protect_memory_region(BASE, PAGE, RegionFlags::read_write())
            .unwrap();

        sup.safety_pass_once(Instant::now());
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
        assert_eq!(sup.safety_statistics().memory_violations, 0);
    }

    #[test]
    fn mirrored_corruption_is_restored_silently() {
        let (sup, bus) = supervisor();
        bus.lock().unwrap().write(BASE, b"limits").unwrap();
        bus.lock().unwrap().write(BASE + PAGE, b"limits").unwrap();
        sup.pair_memory_regions(BASE, BASE + PAGE, PAGE, RegionFlags::read_write())
            .unwrap();

        bus.lock().unwrap().write(BASE + 2, &[0xFF]).unwrap();
        sup.safety_pass_once(Instant::now());
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);

        let mut readback = [0u8; 6];
        bus.lock().unwrap().read(BASE, &mut readback).unwrap();
        assert_eq!(&readback, b"limits");
    }

    #[test]
    fn critical_region_corruption_requests_cold_reset() {
        struct CountingGuard(Arc<AtomicU32>);
        impl OutputGuard for CountingGuard {
            fn disable_all_outputs(&self) {}
            fn notify_safe_state(&self, _event: &SafetyEvent) {}
            fn request_cold_reset(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let resets = Arc::new(AtomicU32::new(0));
        let bus = SramBus::shared(BASE, 4 * PAGE);
        let sup = Supervisor::with_collaborators(
            SupervisorConfig::default(),
            bus.clone(),
            Box::new(CountingGuard(resets.clone())),
            Box::new(NullProbe),
        );
        sup.protect_memory_region(BASE, PAGE, RegionFlags::read_write().critical())
            .unwrap();

        bus.lock().unwrap().write(BASE + 8, &[0x55]).unwrap();
        sup.safety_pass_once(Instant::now());

        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(sup.get_safety_state(), SafetyState::SafeStop);
    }

    #[test]
    fn memory_fault_routes_like_periodic_check() {
        let (sup, bus) = supervisor();
        bus.lock().unwrap().write(BASE, b"abs config").unwrap();
        let region = sup
            .protect_memory_region(BASE, PAGE, RegionFlags::read_write())
            .unwrap();

        bus.lock().unwrap().write(BASE + 1, &[0x00]).unwrap();
        assert_eq!(sup.memory_fault(BASE + 1), Some(region));
        assert!(sup.safety_statistics().memory_violations >= 1);
    }

    #[test]
    fn memory_fault_outside_regions_is_none() {
        let (sup, _bus) = supervisor();
        assert_eq!(sup.memory_fault(0xDEAD_0000), None);
    }

    #[test]
    fn rejected_task_redundancy_routes_to_recovery() {
        let (sup, _bus) = supervisor();
        let id = sup
            .register_monitored_task(TaskConfig {
                needs_redundancy: true,
                ..TaskConfig::named("torque_calc")
            })
            .unwrap();
        sup.record_redundant_output(id, 10.0, 55.0, 99.0).unwrap();

        sup.safety_pass_once(Instant::now());
        // Three-way disagreement cannot be repaired; recovery is pending.
        assert_eq!(sup.get_safety_state(), SafetyState::Recovery);
        assert_eq!(sup.safety_statistics().redundancy_mismatches, 1);
    }

    #[test]
    fn repairable_redundancy_stays_normal() {
        let (sup, _bus) = supervisor();
        let id = sup
            .register_monitored_task(TaskConfig {
                needs_redundancy: true,
                ..TaskConfig::named("torque_calc")
            })
            .unwrap();
        sup.record_redundant_output(id, 10.0, 10.0, 94.0).unwrap();

        sup.safety_pass_once(Instant::now());
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
    }

    #[test]
    fn exhausted_recovery_ends_in_safe_stop() {
        let (sup, _bus) = supervisor();
        let id = sup
            .register_monitored_task(TaskConfig {
                needs_redundancy: true,
                ..TaskConfig::named("torque_calc")
            })
            .unwrap();

        let t0 = Instant::now();
        // A three-way disagreement that is never refreshed keeps failing
        // recovery; drive the deferred retries past the budget.
        sup.record_redundant_output(id, 10.0, 55.0, 99.0).unwrap();
        sup.safety_pass_once(t0);
        sup.safety_pass_once(t0 + ms(150));
        sup.safety_pass_once(t0 + ms(400));
        sup.safety_pass_once(t0 + ms(900));

        assert_eq!(sup.get_safety_state(), SafetyState::SafeStop);
        assert!(sup.safety_statistics().failed_recoveries >= 1);
    }

    #[test]
    fn engage_safe_stop_is_idempotent() {
        let (sup, _bus) = supervisor();
        sup.engage_safe_stop("test halt");
        let events_after_first = sup.recent_events(64).len();
        sup.engage_safe_stop("test halt again");

        assert_eq!(sup.get_safety_state(), SafetyState::SafeStop);
        // Re-entry re-logged but did nothing else.
        assert_eq!(sup.recent_events(64).len(), events_after_first + 1);
    }

    #[test]
    fn degrade_is_an_explicit_policy_hook() {
        let (sup, _bus) = supervisor();
        assert!(sup.degrade("sensor cluster offline"));
        assert_eq!(sup.get_safety_state(), SafetyState::Degraded);

        // Not available outside Normal.
        assert!(!sup.degrade("again"));
    }

    #[test]
    fn attempt_recovery_does_not_escalate_by_itself() {
        let (sup, _bus) = supervisor();
        // StackOverflow has no corrective action: the engine reports
        // FailSafe but attempt_recovery leaves escalation to the caller.
        assert_eq!(
            sup.attempt_recovery(FaultKind::StackOverflow),
            RecoveryResult::FailSafe
        );
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
    }

    #[test]
    fn cpu_overload_is_logged_not_escalated() {
        /// Cumulative CPU time the test bumps between sampling passes.
        struct BusyProbe(Mutex<Duration>);
        impl RuntimeProbe for BusyProbe {
            fn stack(&self, _task: &str) -> Option<crate::task_registry::StackReport> {
                None
            }
            fn preemptions(&self, _task: &str) -> Option<u32> {
                None
            }
            fn cpu_time(&self, _task: &str) -> Option<Duration> {
                Some(*self.0.lock().unwrap())
            }
        }

        let cumulative = Arc::new(BusyProbe(Mutex::new(Duration::ZERO)));
        struct SharedProbe(Arc<BusyProbe>);
        impl RuntimeProbe for SharedProbe {
            fn stack(&self, task: &str) -> Option<crate::task_registry::StackReport> {
                self.0.stack(task)
            }
            fn preemptions(&self, task: &str) -> Option<u32> {
                self.0.preemptions(task)
            }
            fn cpu_time(&self, task: &str) -> Option<Duration> {
                self.0.cpu_time(task)
            }
        }

        let bus = SramBus::shared(BASE, PAGE);
        let sup = Supervisor::with_collaborators(
            SupervisorConfig::default(),
            bus,
            Box::new(LoggingOutputGuard),
            Box::new(SharedProbe(cumulative.clone())),
        );
        sup.register_monitored_task(TaskConfig::named("hog")).unwrap();
        sup.register_monitored_task(TaskConfig::named("hog2")).unwrap();

        sup.cpu_pass_once(ms(1000)); // baseline
        // Each task burned 900 ms of the next 1 s window.
        *cumulative.0.lock().unwrap() = ms(900);
        sup.cpu_pass_once(ms(1000));

        assert_eq!(sup.system_cpu_load(), 180);
        // Over the 80 % threshold: logged, never a safety violation.
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
        assert!(sup
            .recent_events(8)
            .iter()
            .any(|e| e.description.contains("cpu overload")));
    }

    #[test]
    fn safety_events_are_recorded_for_faults() {
        let (sup, _bus) = supervisor();
        sup.handle_error(FaultKind::ControlFlowViolation);
        let events = sup.recent_events(8);
        assert!(events
            .iter()
            .any(|e| e.description.contains("control_flow_violation")));
    }
}
