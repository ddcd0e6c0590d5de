//! `vigil-supervisor` – the monitor threads around a
//! [`Supervisor`][vigil_kernel::Supervisor].
//!
//! The kernel crate is entirely passive: its periodic passes run only when
//! something calls them. [`MonitorHarness`] provides that something for a
//! std-threaded deployment, spawning one thread per cadence:
//!
//! - **task scan** – [`Supervisor::scan_tasks_once`] every
//!   `task_monitor_period_ms` (10 ms by default),
//! - **safety monitor** – [`Supervisor::safety_pass_once`] every
//!   `safety_monitor_period_ms` (100 ms),
//! - **cpu sampler** – [`Supervisor::cpu_pass_once`] every
//!   `cpu_sample_period_ms` (1 s).
//!
//! All three threads exit on [`MonitorHarness::shutdown`] or as soon as the
//! supervisor reaches SafeStop; the harness never restarts them, since
//! SafeStop is terminal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use vigil_kernel::{ScanOutcome, Supervisor};

/// Owns the monitor threads for one [`Supervisor`].
///
/// Dropping the harness without calling [`MonitorHarness::shutdown`] also
/// stops the threads, but detaches instead of joining them.
pub struct MonitorHarness {
    supervisor: Arc<Supervisor>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl MonitorHarness {
    /// Spawn the three monitor threads over `supervisor`, using the periods
    /// from its configuration.
    pub fn spawn(supervisor: Arc<Supervisor>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = supervisor.config();
        let task_period = Duration::from_millis(config.task_monitor_period_ms);
        let safety_period = Duration::from_millis(config.safety_monitor_period_ms);
        let cpu_period = Duration::from_millis(config.cpu_sample_period_ms);

        let threads = vec![
            spawn_loop("vigil-task-scan", &supervisor, &shutdown, task_period, |sup, _| {
                sup.scan_tasks_once(Instant::now()) != ScanOutcome::SafeStopped
            }),
            spawn_loop(
                "vigil-safety",
                &supervisor,
                &shutdown,
                safety_period,
                |sup, _| {
                    sup.safety_pass_once(Instant::now());
                    !sup.get_safety_state().is_terminal()
                },
            ),
            spawn_loop("vigil-cpu", &supervisor, &shutdown, cpu_period, |sup, elapsed| {
                sup.cpu_pass_once(elapsed);
                !sup.get_safety_state().is_terminal()
            }),
        ];
        info!(
            task_ms = config.task_monitor_period_ms,
            safety_ms = config.safety_monitor_period_ms,
            cpu_ms = config.cpu_sample_period_ms,
            "monitor threads started"
        );
        Self {
            supervisor,
            shutdown,
            threads,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// `true` while at least one monitor thread is still running.
    pub fn is_running(&self) -> bool {
        self.threads.iter().any(|t| !t.is_finished())
    }

    /// Signal every monitor thread to stop and join them.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            // A panicked monitor thread has nothing left to clean up.
            let _ = handle.join();
        }
        info!("monitor threads stopped");
    }
}

impl Drop for MonitorHarness {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// One monitor loop: run `pass` on its cadence until it returns `false` or
/// the shutdown flag is set. `pass` receives the time elapsed since its
/// previous invocation.
fn spawn_loop(
    name: &str,
    supervisor: &Arc<Supervisor>,
    shutdown: &Arc<AtomicBool>,
    period: Duration,
    pass: impl Fn(&Supervisor, Duration) -> bool + Send + 'static,
) -> JoinHandle<()> {
    let supervisor = Arc::clone(supervisor);
    let shutdown = Arc::clone(shutdown);
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut last = Instant::now();
            while !shutdown.load(Ordering::SeqCst) {
                thread::sleep(period);
                let now = Instant::now();
                let elapsed = now.duration_since(last);
                last = now;
                if !pass(&supervisor, elapsed) {
                    debug!(thread = %thread_name, "monitor loop stopping");
                    break;
                }
            }
        })
        // Thread spawning fails only on OS resource exhaustion, at which
        // point the process is unsupervisable anyway.
        .unwrap_or_else(|e| panic!("failed to spawn monitor thread {name}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_kernel::SramBus;
    use vigil_types::{SafetyState, SupervisorConfig};

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            task_monitor_period_ms: 1,
            safety_monitor_period_ms: 2,
            cpu_sample_period_ms: 5,
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn harness_starts_and_shuts_down() {
        let bus = SramBus::shared(0x1000, 4096);
        let sup = Arc::new(Supervisor::new(fast_config(), bus));
        let harness = MonitorHarness::spawn(Arc::clone(&sup));

        assert!(harness.is_running());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);

        harness.shutdown();
    }

    #[test]
    fn critical_task_that_never_checkpoints_reaches_safe_stop() {
        let bus = SramBus::shared(0x1000, 4096);
        let config = SupervisorConfig {
            task_monitor_period_ms: 1,
            safety_monitor_period_ms: 2,
            cpu_sample_period_ms: 50,
            ..SupervisorConfig::default()
        };
        let sup = Arc::new(Supervisor::new(config, bus));
        sup.register_monitored_task(vigil_types::TaskConfig {
            deadline_ms: 5,
            is_critical: true,
            ..vigil_types::TaskConfig::named("brake_ctrl")
        })
        .unwrap();

        let harness = MonitorHarness::spawn(Arc::clone(&sup));
        // Three consecutive 5 ms deadline misses take ~15 ms; allow ample
        // scheduling slack.
        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.get_safety_state() != SafetyState::SafeStop && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(sup.get_safety_state(), SafetyState::SafeStop);
        let id = sup.lookup_task("brake_ctrl").unwrap();
        assert!(sup.get_task_statistics(id).unwrap().deadline_misses >= 3);
        harness.shutdown();
    }

    #[test]
    fn checkpointing_task_stays_normal() {
        let bus = SramBus::shared(0x1000, 4096);
        let sup = Arc::new(Supervisor::new(fast_config(), bus));
        let id = sup
            .register_monitored_task(vigil_types::TaskConfig {
                deadline_ms: 10,
                is_critical: true,
                ..vigil_types::TaskConfig::named("steer_ctrl")
            })
            .unwrap();

        let harness = MonitorHarness::spawn(Arc::clone(&sup));
        // Simulate a healthy task beating its deadline.
        for _ in 0..20 {
            sup.task_monitor_checkpoint(id).unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(sup.get_safety_state(), SafetyState::Normal);
        assert_eq!(sup.get_task_statistics(id).unwrap().deadline_misses, 0);
        harness.shutdown();
    }

    #[test]
    fn threads_stop_after_safe_stop() {
        let bus = SramBus::shared(0x1000, 4096);
        let sup = Arc::new(Supervisor::new(fast_config(), bus));
        let harness = MonitorHarness::spawn(Arc::clone(&sup));

        sup.engage_safe_stop("test");
        // Each loop notices the terminal state on its next tick.
        for _ in 0..100 {
            if !harness.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!harness.is_running());
        harness.shutdown();
    }
}
