//! `vigil` – safety-core demo binary.
//!
//! Runs the full supervision stack against a simulated SRAM window and a
//! handful of simulated control tasks:
//!
//! 1. Initialises structured logging (`RUST_LOG`, `VIGIL_LOG_FORMAT=json`
//!    for newline-delimited JSON).
//! 2. Builds a [`Supervisor`] over an [`SramBus`], protects a mirrored
//!    parameter region, and registers three tasks plus one checkpoint
//!    sequence.
//! 3. Spawns the monitor threads and a set of worker threads: a healthy
//!    steering task, a redundant torque task whose reference channel
//!    slowly drifts, and a brake task that stops checkpointing after a
//!    while to demonstrate the escalation to SafeStop.
//! 4. Intercepts **Ctrl-C** to stop the workers and monitors cleanly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use vigil_kernel::{RegionFlags, SramBus, Supervisor};
use vigil_supervisor::MonitorHarness;
use vigil_types::{SafetyState, SupervisorConfig, TaskConfig};

const SRAM_BASE: usize = 0x2000_0000;
const PAGE: usize = 4096;

fn main() {
    init_logging();

    let config = SupervisorConfig::default();
    let bus = SramBus::shared(SRAM_BASE, 8 * PAGE);
    let supervisor = Arc::new(Supervisor::new(config, bus.clone()));

    // ── Protected parameters ─────────────────────────────────────────────
    // A mirrored pair holding the (simulated) torque limit map.
    {
        let mut sram = bus.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        sram.write(SRAM_BASE, b"torque limit map v3")
            .expect("sram write");
        sram.write(SRAM_BASE + PAGE, b"torque limit map v3")
            .expect("sram write");
    }
    supervisor
        .pair_memory_regions(SRAM_BASE, SRAM_BASE + PAGE, PAGE, RegionFlags::read_write())
        .expect("pair regions");

    // ── Tasks ────────────────────────────────────────────────────────────
    let steer = supervisor
        .register_monitored_task(TaskConfig {
            deadline_ms: 50,
            is_critical: true,
            ..TaskConfig::named("steer_ctrl")
        })
        .expect("register steer_ctrl");
    let torque = supervisor
        .register_monitored_task(TaskConfig {
            deadline_ms: 100,
            needs_redundancy: true,
            ..TaskConfig::named("torque_calc")
        })
        .expect("register torque_calc");
    let brake = supervisor
        .register_monitored_task(TaskConfig {
            deadline_ms: 50,
            is_critical: true,
            ..TaskConfig::named("brake_ctrl")
        })
        .expect("register brake_ctrl");

    let steer_seq = supervisor
        .register_sequence(vec![0x10, 0x20, 0x30], Some(steer))
        .expect("register sequence");

    // ── Shutdown flag + Ctrl-C ───────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("Ctrl-C received; shutting down");
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    // ── Monitors + workers ───────────────────────────────────────────────
    let harness = MonitorHarness::spawn(Arc::clone(&supervisor));
    info!("vigil demo running; Ctrl-C to stop");

    let workers = vec![
        // Healthy steering task: checkpoints on time, walks its sequence.
        spawn_worker("steer_ctrl", &supervisor, &shutdown, move |sup, _cycle| {
            sup.task_monitor_checkpoint(steer)?;
            for checkpoint in [0x10, 0x20, 0x30] {
                sup.checkpoint_reached(steer_seq, checkpoint)?;
            }
            if sup.verify_sequence(steer_seq)? {
                sup.reset_sequence(steer_seq)?;
            }
            Ok(())
        }),
        // Redundant torque task: the reference channel drifts until the
        // voter starts repairing it.
        spawn_worker("torque_calc", &supervisor, &shutdown, move |sup, cycle| {
            sup.task_monitor_checkpoint(torque)?;
            let value = 180.0;
            let drift = f64::from(cycle) * 0.02;
            sup.record_redundant_output(torque, value, value, value + drift)?;
            Ok(())
        }),
        // Brake task: healthy for 5 s, then stops checkpointing. Three
        // consecutive 50 ms misses later the supervisor goes to SafeStop.
        spawn_worker("brake_ctrl", &supervisor, &shutdown, move |sup, cycle| {
            if cycle < 250 {
                sup.task_monitor_checkpoint(brake)?;
            } else if cycle == 250 {
                warn!("brake_ctrl worker going silent");
            }
            Ok(())
        }),
    ];

    // ── Main loop: report until SafeStop or Ctrl-C ───────────────────────
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        let state = supervisor.get_safety_state();
        let stats = supervisor.safety_statistics();
        info!(
            %state,
            timing = stats.timing_violations,
            control_flow = stats.control_flow_violations,
            memory = stats.memory_violations,
            redundancy = stats.redundancy_mismatches,
            recovered = stats.successful_recoveries,
            cpu = supervisor.system_cpu_load(),
            "supervisor status"
        );
        if state == SafetyState::SafeStop {
            warn!("safe stop reached; recent events follow");
            for event in supervisor.recent_events(10) {
                warn!(at = %event.timestamp, param = event.param, "{}", event.description);
            }
            break;
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    for worker in workers {
        let _ = worker.join();
    }
    harness.shutdown();
    info!("vigil demo stopped");
}

/// Simulated application task on a 20 ms cycle. The closure gets the cycle
/// counter; supervision errors stop the worker.
fn spawn_worker(
    name: &'static str,
    supervisor: &Arc<Supervisor>,
    shutdown: &Arc<AtomicBool>,
    body: impl Fn(&Supervisor, u32) -> Result<(), vigil_types::VigilError> + Send + 'static,
) -> thread::JoinHandle<()> {
    let supervisor = Arc::clone(supervisor);
    let shutdown = Arc::clone(shutdown);
    thread::spawn(move || {
        let mut cycle = 0u32;
        while !shutdown.load(Ordering::SeqCst)
            && supervisor.get_safety_state() != SafetyState::SafeStop
        {
            if let Err(e) = body(&supervisor, cycle) {
                warn!(worker = name, error = %e, "worker stopping");
                return;
            }
            cycle = cycle.wrapping_add(1);
            thread::sleep(Duration::from_millis(20));
        }
    })
}

/// Initialise tracing-subscriber from RUST_LOG (defaults to "info").
/// Set VIGIL_LOG_FORMAT=json for newline-delimited JSON logs suitable for
/// log aggregators.
fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("VIGIL_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }
}
