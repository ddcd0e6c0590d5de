//! [`TaskRegistry`] – the monitored-task table and its supervisory checks.
//!
//! Application tasks register once ([`TaskRegistry::register`]) and then
//! touch the registry only as a side effect of running: checkpoints reset
//! their deadline timer, execution windows bracket their work, state
//! changes are validated against the task lifecycle. The task-scan thread
//! drives [`TaskRegistry::check_task`] for every task on a 10 ms cadence
//! and routes whatever violations come back; CPU accounting runs separately
//! on a 1 s cadence through [`TaskRegistry::sample_cpu`].
//!
//! Locking: one global registry lock (`RwLock`) over the table, one `Mutex`
//! per task. The registry lock is always taken before a task lock and
//! released after it, so unrelated tasks' statistics updates never
//! serialize against each other and the ordering admits no deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vigil_types::{FaultKind, TaskConfig, TaskState, TaskStatistics, VigilError};

use crate::redundancy::{RedundantTriple, VotingOutcome, vote};

// ────────────────────────────────────────────────────────────────────────────
// Probe seam
// ────────────────────────────────────────────────────────────────────────────

/// One stack measurement for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackReport {
    pub free_bytes: usize,
    pub used_bytes: usize,
}

/// OS/HAL collaborator that measures what the kernel cannot observe from
/// inside the process: stack headroom, preemption counts, CPU time.
///
/// Firmware wires the RTOS accessors; tests use a settable fake.
pub trait RuntimeProbe: Send + Sync {
    /// Current stack headroom of `task`, if measurable.
    fn stack(&self, task: &str) -> Option<StackReport>;

    /// Cumulative preemption count of `task` since boot.
    fn preemptions(&self, task: &str) -> Option<u32>;

    /// Cumulative CPU time consumed by `task` since boot.
    fn cpu_time(&self, task: &str) -> Option<Duration>;
}

/// Probe that measures nothing; stack/interference/CPU checks become
/// no-ops.
pub struct NullProbe;

impl RuntimeProbe for NullProbe {
    fn stack(&self, _task: &str) -> Option<StackReport> {
        None
    }

    fn preemptions(&self, _task: &str) -> Option<u32> {
        None
    }

    fn cpu_time(&self, _task: &str) -> Option<Duration> {
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Task table
// ────────────────────────────────────────────────────────────────────────────

/// Handle to a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One violation detected during a scan pass, ready for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskViolation {
    pub task: TaskId,
    pub name: String,
    pub kind: FaultKind,
    /// Kind-dependent detail: consecutive miss count, overrun milliseconds,
    /// free stack bytes, preemption delta.
    pub param: u64,
    /// Snapshot of the task's criticality, so the router does not need to
    /// re-lock the task.
    pub is_critical: bool,
}

struct MonitoredTask {
    config: TaskConfig,
    state: TaskState,
    last_state: TaskState,
    last_checkpoint: Instant,
    execution_start: Option<Instant>,
    consecutive_misses: u32,
    missed_deadlines: u32,
    stats: TaskStatistics,
    redundant: Option<RedundantTriple>,
    last_preemptions: Option<u32>,
    last_cpu_time: Option<Duration>,
}

impl MonitoredTask {
    fn new(config: TaskConfig, now: Instant) -> Self {
        let redundant = config
            .needs_redundancy
            .then(|| RedundantTriple::new(0.0, 0.0, 0.0, f64::EPSILON));
        Self {
            config,
            state: TaskState::Init,
            last_state: TaskState::Init,
            last_checkpoint: now,
            execution_start: None,
            consecutive_misses: 0,
            missed_deadlines: 0,
            stats: TaskStatistics::default(),
            redundant,
            last_preemptions: None,
            last_cpu_time: None,
        }
    }

    /// Deadline/runtime/stack checks are skipped for tasks that are not
    /// scheduled to run.
    fn is_scanned(&self) -> bool {
        !matches!(self.state, TaskState::Suspended | TaskState::Terminated)
    }
}

type Slot = Arc<Mutex<MonitoredTask>>;

struct Inner {
    tasks: Vec<Slot>,
    by_name: HashMap<String, usize>,
}

/// The monitored-task table. Shared across all monitor threads by `&self`.
pub struct TaskRegistry {
    inner: RwLock<Inner>,
    capacity: usize,
    max_missed_deadlines: u32,
}

impl TaskRegistry {
    pub fn new(capacity: usize, max_missed_deadlines: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                tasks: Vec::with_capacity(capacity),
                by_name: HashMap::new(),
            }),
            capacity,
            max_missed_deadlines,
        }
    }

    /// Register a task for supervision. The deadline timer starts now.
    ///
    /// # Errors
    ///
    /// [`VigilError::ResourceExhausted`] above capacity,
    /// [`VigilError::DuplicateTask`] when the name is already registered.
    pub fn register(&self, config: TaskConfig) -> Result<TaskId, VigilError> {
        let mut inner = self.write_inner();
        if inner.tasks.len() >= self.capacity {
            return Err(VigilError::ResourceExhausted {
                what: "monitored tasks",
                capacity: self.capacity,
            });
        }
        if inner.by_name.contains_key(&config.name) {
            return Err(VigilError::DuplicateTask(config.name));
        }
        let id = TaskId(inner.tasks.len());
        debug!(task = %config.name, critical = config.is_critical, "registered task");
        inner.by_name.insert(config.name.clone(), id.0);
        inner
            .tasks
            .push(Arc::new(Mutex::new(MonitoredTask::new(config, Instant::now()))));
        Ok(id)
    }

    /// Look a task up by name.
    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.read_inner().by_name.get(name).copied().map(TaskId)
    }

    /// All task ids, in registration order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        (0..self.read_inner().tasks.len()).map(TaskId).collect()
    }

    /// Record a liveness checkpoint: re-arms the deadline timer and clears
    /// the consecutive-miss count.
    pub fn checkpoint(&self, id: TaskId) -> Result<(), VigilError> {
        self.with_task(id, |t| {
            t.last_checkpoint = Instant::now();
            t.consecutive_misses = 0;
        })
    }

    /// Open an execution window; the runtime check measures from here.
    pub fn begin_execution(&self, id: TaskId) -> Result<(), VigilError> {
        self.with_task(id, |t| {
            t.execution_start = Some(Instant::now());
        })
    }

    /// Close the execution window.
    pub fn end_execution(&self, id: TaskId) -> Result<(), VigilError> {
        self.with_task(id, |t| {
            t.execution_start = None;
        })
    }

    /// Apply a lifecycle state change, validating it against the transition
    /// table. Invalid transitions leave the task state untouched.
    pub fn set_state(&self, id: TaskId, next: TaskState) -> Result<(), VigilError> {
        self.try_with_task(id, |t| {
            if !t.state.can_transition_to(next) {
                warn!(task = %t.config.name, from = %t.state, to = %next, "invalid task state transition");
                return Err(VigilError::InvalidTransition {
                    from: t.state,
                    to: next,
                });
            }
            t.last_state = t.state;
            t.state = next;
            Ok(())
        })
    }

    pub fn state(&self, id: TaskId) -> Result<TaskState, VigilError> {
        self.try_with_task(id, |t| Ok(t.state))
    }

    /// Snapshot of a task's statistics.
    pub fn statistics(&self, id: TaskId) -> Result<TaskStatistics, VigilError> {
        self.try_with_task(id, |t| Ok(t.stats.clone()))
    }

    pub fn is_critical(&self, id: TaskId) -> Result<bool, VigilError> {
        self.try_with_task(id, |t| Ok(t.config.is_critical))
    }

    /// Store one round of triplicated outputs for a `needs_redundancy`
    /// task; the safety loop votes on them.
    pub fn record_redundant_output(
        &self,
        id: TaskId,
        primary: f64,
        secondary: f64,
        reference: f64,
    ) -> Result<(), VigilError> {
        self.try_with_task(id, |t| match &mut t.redundant {
            Some(triple) => {
                triple.refresh(primary, secondary, reference);
                Ok(())
            }
            None => Err(VigilError::NoRedundancy(id.0)),
        })
    }

    /// Vote over the task's triplicated outputs with `tolerance`.
    ///
    /// `Ok(None)` when the task does not carry a redundancy buffer.
    pub fn vote_redundant(
        &self,
        id: TaskId,
        tolerance: f64,
    ) -> Result<Option<VotingOutcome>, VigilError> {
        self.try_with_task(id, |t| {
            Ok(t.redundant.as_mut().map(|triple| vote(triple, tolerance)))
        })
    }

    /// Clear counters and re-arm monitoring, moving the task to `Ready`.
    /// Idempotent: applying it twice leaves the same zeroed statistics and
    /// `Ready` state as applying it once. A `Terminated` task keeps its
    /// state (the lifecycle admits no way back); only its counters clear.
    pub fn reset_task_monitoring(&self, id: TaskId) -> Result<(), VigilError> {
        self.with_task(id, |t| {
            t.stats = TaskStatistics::default();
            t.consecutive_misses = 0;
            t.missed_deadlines = 0;
            t.execution_start = None;
            t.last_checkpoint = Instant::now();
            if t.state.can_transition_to(TaskState::Ready) {
                t.last_state = t.state;
                t.state = TaskState::Ready;
            }
        })
    }

    /// Count one recovery attempt against the task's statistics.
    pub fn note_recovery_attempt(&self, id: TaskId) -> Result<(), VigilError> {
        self.with_task(id, |t| {
            t.stats.recovery_attempts += 1;
        })
    }

    /// Count a control-flow violation against the task's statistics.
    pub fn note_control_flow_violation(&self, id: TaskId) -> Result<(), VigilError> {
        self.with_task(id, |t| {
            t.stats.control_flow_violations += 1;
        })
    }

    /// Mark the task as faulted (`Error` state), from any non-terminal
    /// state.
    pub fn mark_error(&self, id: TaskId) -> Result<(), VigilError> {
        self.with_task(id, |t| {
            if t.state.can_transition_to(TaskState::Error) {
                t.last_state = t.state;
                t.state = TaskState::Error;
            }
        })
    }

    /// Run the deadline, runtime, stack and interference checks for one
    /// task at time `now`, returning the violations to route.
    ///
    /// Deadline misses are counted once per overdue `deadline_ms` period
    /// (the timer is re-armed on each counted miss); a `DeadlineMissed`
    /// violation is emitted only when the consecutive count reaches the
    /// configured maximum. `RuntimeExceeded` closes the execution window so
    /// one overrun reports once. A stack floor breach latches
    /// `stack_overflow` and is always reported as critical.
    pub fn check_task(
        &self,
        id: TaskId,
        now: Instant,
        probe: &dyn RuntimeProbe,
    ) -> Result<Vec<TaskViolation>, VigilError> {
        self.try_with_task(id, |t| {
            let mut violations = Vec::new();
            if !t.is_scanned() {
                return Ok(violations);
            }
            let name = t.config.name.clone();

            // 1. Deadline.
            if now.duration_since(t.last_checkpoint).as_millis() as u64 > t.config.deadline_ms {
                t.consecutive_misses += 1;
                t.missed_deadlines += 1;
                t.stats.deadline_misses += 1;
                t.last_checkpoint = now;
                warn!(task = %name, consecutive = t.consecutive_misses, "deadline miss");
                if t.consecutive_misses >= self.max_missed_deadlines {
                    violations.push(TaskViolation {
                        task: id,
                        name: name.clone(),
                        kind: FaultKind::DeadlineMissed,
                        param: u64::from(t.consecutive_misses),
                        is_critical: t.config.is_critical,
                    });
                }
            }

            // 2. Runtime window.
            if let Some(start) = t.execution_start {
                let elapsed = now.duration_since(start).as_millis() as u64;
                if elapsed > t.config.max_runtime_ms {
                    t.execution_start = None;
                    violations.push(TaskViolation {
                        task: id,
                        name: name.clone(),
                        kind: FaultKind::RuntimeExceeded,
                        param: elapsed,
                        is_critical: t.config.is_critical,
                    });
                }
            }

            // 3. Stack headroom. Stack corruption risks system-wide memory
            // safety, so the violation is critical regardless of the task's
            // own flag.
            if let Some(stack) = probe.stack(&name) {
                t.stats.stack_usage_peak = t.stats.stack_usage_peak.max(stack.used_bytes);
                if stack.free_bytes < t.config.min_stack_remaining {
                    t.stats.stack_overflow = true;
                    violations.push(TaskViolation {
                        task: id,
                        name: name.clone(),
                        kind: FaultKind::StackOverflow,
                        param: stack.free_bytes as u64,
                        is_critical: true,
                    });
                }
            }

            // 4. Interference: preemptions since the last scan.
            if let Some(current) = probe.preemptions(&name) {
                let delta = current.saturating_sub(t.last_preemptions.unwrap_or(current));
                t.last_preemptions = Some(current);
                if delta > t.config.max_interference_count {
                    t.stats.interference_count += 1;
                    violations.push(TaskViolation {
                        task: id,
                        name,
                        kind: FaultKind::TaskInterference,
                        param: u64::from(delta),
                        is_critical: t.config.is_critical,
                    });
                }
            }

            Ok(violations)
        })
    }

    /// Update per-task CPU percentages from cumulative probe counters over
    /// the `elapsed` sampling window, returning the summed system load.
    pub fn sample_cpu(&self, elapsed: Duration, probe: &dyn RuntimeProbe) -> u8 {
        let mut system_load: u32 = 0;
        for id in self.task_ids() {
            // Tasks cannot disappear, so the lookup cannot fail here.
            let _ = self.with_task(id, |t| {
                if let Some(current) = probe.cpu_time(&t.config.name) {
                    if let Some(previous) = t.last_cpu_time {
                        let used = current.saturating_sub(previous);
                        let percent = if elapsed.is_zero() {
                            0
                        } else {
                            (used.as_micros() * 100 / elapsed.as_micros()).min(100) as u8
                        };
                        t.stats.cpu_usage_percent = percent;
                        system_load += u32::from(percent);
                    }
                    t.last_cpu_time = Some(current);
                }
            });
        }
        system_load.min(u32::from(u8::MAX)) as u8
    }

    // ── Lock helpers ──────────────────────────────────────────────────────

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: TaskId) -> Result<Slot, VigilError> {
        self.read_inner()
            .tasks
            .get(id.0)
            .cloned()
            .ok_or(VigilError::UnknownTask(id.0))
    }

    fn with_task<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut MonitoredTask) -> R,
    ) -> Result<R, VigilError> {
        let slot = self.slot(id)?;
        let mut task = lock_task(&slot);
        Ok(f(&mut task))
    }

    fn try_with_task<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut MonitoredTask) -> Result<R, VigilError>,
    ) -> Result<R, VigilError> {
        let slot = self.slot(id)?;
        let mut task = lock_task(&slot);
        f(&mut task)
    }
}

fn lock_task(slot: &Slot) -> MutexGuard<'_, MonitoredTask> {
    // A poisoned task entry still holds coherent counters; keep monitoring
    // rather than losing the task.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
