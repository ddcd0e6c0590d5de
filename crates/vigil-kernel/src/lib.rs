//! `vigil-kernel` – Safety Supervision Core
//!
//! The fault-detection-and-recovery kernel of the vehicle firmware. It does
//! not acquire sensors or speak CAN; it verifies that the modules that do
//! are still behaving, and escalates when they are not.
//!
//! # Modules
//!
//! - [`control_flow`] – [`ControlFlowMonitor`][control_flow::ControlFlowMonitor]:
//!   records checkpoint sequences per supervised flow and verifies them
//!   against the registered expected order.
//! - [`task_registry`] – [`TaskRegistry`][task_registry::TaskRegistry]:
//!   the table of monitored tasks plus the deadline / runtime / stack /
//!   CPU / interference checks run by the periodic scan.
//! - [`redundancy`] – the single 2-of-3 [`vote`][redundancy::vote]
//!   algorithm shared by triplicated sensor readings and triplicated task
//!   outputs.
//! - [`memory_guard`] – [`MemoryGuard`][memory_guard::MemoryGuard]:
//!   CRC-backed protected regions with optional mirror pairs, checked
//!   periodically and from the fault handler.
//! - [`recovery`] – [`RecoveryEngine`][recovery::RecoveryEngine]:
//!   bounded-retry, exponential-backoff corrective-action dispatcher with
//!   deferred (non-blocking) backoff.
//! - [`safety_state`] – [`SafetyStateMachine`][safety_state::SafetyStateMachine]:
//!   the global Normal/Degraded/Recovery/SafeStop state, with SafeStop
//!   terminal.
//! - [`event_log`] – [`EventLog`][event_log::EventLog]: bounded FIFO of
//!   [`SafetyEvent`][vigil_types::SafetyEvent]s.
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: the single
//!   root context object owning every subsystem; all public operations go
//!   through it (no process-wide statics).
//!
//! # Lock ordering
//!
//! `recovery` → registry (read) → per-task mutex → `control_flow` →
//! `memory_guard` → `event_log`, acquired in that order and released in
//! reverse. The global safety state is atomic and never blocks.

pub mod control_flow;
pub mod crc32;
pub mod event_log;
pub mod memory_guard;
pub mod recovery;
pub mod redundancy;
pub mod safety_state;
pub mod supervisor;
pub mod task_registry;

pub use control_flow::{ControlFlowMonitor, SequenceId};
pub use event_log::EventLog;
pub use memory_guard::{
    MemoryBus, MemoryGuard, RegionFlags, RegionId, RegionOutcome, SharedBus, SramBus,
};
pub use recovery::{Fault, RecoveryActions, RecoveryEngine};
pub use redundancy::{RedundantTriple, TripleSlot, VotingOutcome, consensus_value, vote};
pub use safety_state::{LoggingOutputGuard, OutputGuard, SafetyStateMachine};
pub use supervisor::{ScanOutcome, Supervisor};
pub use task_registry::{
    NullProbe, RuntimeProbe, StackReport, TaskId, TaskRegistry, TaskViolation,
};
