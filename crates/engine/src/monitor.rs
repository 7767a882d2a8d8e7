//! The per-target supervisor: owns the trigger threads for one resolved
//! pid, watches for target death, and tears everything down when the
//! target's quit event fires.

use crate::discovery::DiscoveredTarget;
use crate::proc::TargetProcess;
use crate::registry::TargetRegistry;
use crate::sync::{QuitEvent, WaitOutcome};
use crate::target::TargetState;
use crate::triggers::managed::{AgentListener, ManagedDumper};
use crate::triggers::{polled, signal};
use config::Config;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

pub struct TargetMonitor {
    target: Arc<TargetState>,
    managed: Arc<dyn ManagedDumper>,
}

impl TargetMonitor {
    /// Build the monitor for one discovered target: a deep copy of the
    /// reference configuration with the resolved pid substituted.
    pub fn new(
        reference: &Config,
        discovered: DiscoveredTarget,
        engine_quit: &Arc<QuitEvent>,
        managed: Arc<dyn ManagedDumper>,
    ) -> Self {
        let config = reference.clone();
        let target = TargetState::new(config, discovered.pid, discovered.name, Some(engine_quit));
        Self { target, managed }
    }

    pub fn target(&self) -> &Arc<TargetState> {
        &self.target
    }

    /// Run until the target's quit event fires or the target dies, then
    /// join the trigger threads and signal cleanup-complete. Returns the
    /// first fatal dump-pipeline error, if any.
    pub fn run(self, registry: Arc<TargetRegistry>) -> Result<(), crate::error::Error> {
        let target = self.target;
        let pid = target.pid();

        print_configuration(&target);

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut spawn = |name: String, run: Box<dyn FnOnce() + Send>| {
            match std::thread::Builder::new().name(name).spawn(run) {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(pid, %err, "failed to spawn trigger thread"),
            }
        };

        let config = target.config();
        if config.cpu.is_some() {
            let (target, managed) = (Arc::clone(&target), Arc::clone(&self.managed));
            spawn(
                format!("cpu/{pid}"),
                Box::new(move || polled::cpu_monitor(target, managed)),
            );
        }
        if config.memory.is_some() {
            let (target, managed) = (Arc::clone(&target), Arc::clone(&self.managed));
            spawn(
                format!("commit/{pid}"),
                Box::new(move || polled::memory_monitor(target, managed)),
            );
        }
        if config.thread_count.is_some() {
            let (target, managed) = (Arc::clone(&target), Arc::clone(&self.managed));
            spawn(
                format!("threads/{pid}"),
                Box::new(move || polled::thread_monitor(target, managed)),
            );
        }
        if config.fd_count.is_some() {
            let (target, managed) = (Arc::clone(&target), Arc::clone(&self.managed));
            spawn(
                format!("fds/{pid}"),
                Box::new(move || polled::fd_monitor(target, managed)),
            );
        }
        if config.timer {
            let (target, managed) = (Arc::clone(&target), Arc::clone(&self.managed));
            spawn(
                format!("timer/{pid}"),
                Box::new(move || polled::timer_monitor(target, managed)),
            );
        }
        if !config.signals.is_empty() {
            let (signal_target, managed) = (Arc::clone(&target), Arc::clone(&self.managed));
            spawn(
                format!("ptrace/{pid}"),
                Box::new(move || signal::signal_monitor(signal_target, managed)),
            );
            // Monitoring must not start before the tracer is in place.
            if target
                .debug_thread_ready
                .wait_quit_aware(&target.quit, None)
                != WaitOutcome::Signaled
            {
                info!(pid, "shutdown before the tracer was ready");
            }
        }
        if config.dotnet_trigger_count() > 0 {
            match AgentListener::bind(Arc::clone(&target)) {
                Ok(listener) => {
                    let managed = Arc::clone(&self.managed);
                    spawn(
                        format!("agent/{pid}"),
                        Box::new(move || listener.run(managed)),
                    );
                }
                Err(err) => error!(pid, %err, "failed to bind the agent socket"),
            }
        }

        target.start_monitoring.set();
        info!("Starting monitor for process {} ({})", target.name(), pid);

        // Supervise: quit ends the monitor; so does target death, which the
        // trigger threads also notice on their own when /proc reads fail.
        let process = TargetProcess::new(pid);
        let interval = target.config().polling_interval();
        loop {
            if target.wait_tick(interval) {
                break;
            }
            if !process.alive() {
                info!("Target process {} ({}) has exited", target.name(), pid);
                target.terminated.store(true, Ordering::SeqCst);
                target.quit.set();
                break;
            }
        }

        for worker in workers {
            let _ = worker.join();
        }

        registry.remove(pid);
        target.cleanup_complete.set();
        info!(
            "Stopping monitor for process {} ({}): {} dump(s) collected",
            target.name(),
            pid,
            target.dumps_collected()
        );

        match target.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Log the effective configuration for a target, exactly once (gated by the
/// configuration-printed event even if this is ever called from more than
/// one thread).
fn print_configuration(target: &TargetState) {
    if target.configuration_printed.is_set() {
        return;
    }
    target.configuration_printed.set();

    let config = target.config();
    if !config.signals.is_empty() {
        info!("** NOTE ** Signal triggers use PTRACE which will impact the performance of the target process");
    }

    info!("Process:\t\t\t{} ({})", target.name(), target.pid());
    match config.cpu {
        Some(cpu) if cpu.below => info!("CPU Threshold:\t\t< {}%", cpu.percent),
        Some(cpu) => info!("CPU Threshold:\t\t>= {}%", cpu.percent),
        None => info!("CPU Threshold:\t\tn/a"),
    }
    match &config.memory {
        Some(memory) => {
            let list = memory
                .thresholds_mb
                .iter()
                .map(|mb| format!("{mb} MB"))
                .collect::<Vec<_>>()
                .join(",");
            let relation = if memory.below { "<" } else { ">=" };
            info!("Commit Threshold:\t\t{relation} {list}");
        }
        None => info!("Commit Threshold:\t\tn/a"),
    }
    match config.thread_count {
        Some(threshold) => info!("Thread Threshold:\t\t{threshold}"),
        None => info!("Thread Threshold:\t\tn/a"),
    }
    match config.fd_count {
        Some(threshold) => info!("File Descriptor Threshold:\t{threshold}"),
        None => info!("File Descriptor Threshold:\tn/a"),
    }
    if config.signals.is_empty() {
        info!("Signal:\t\t\tn/a");
    } else {
        let list = config
            .signals
            .iter()
            .map(|signal| signal.to_string())
            .collect::<Vec<_>>()
            .join(",");
        info!("Signal(s):\t\t\t{list}");
    }
    if config.exception {
        info!("Exception monitor:\t\tOn");
        info!(
            "Exception filter:\t\t{}",
            config.exception_filter.as_deref().unwrap_or("n/a")
        );
    } else {
        info!("Exception monitor:\t\tn/a");
    }
    info!(
        "Polling Interval (ms):\t{}",
        config.polling_interval().as_millis()
    );
    info!("Threshold (s):\t\t{}", config.threshold().as_secs());
    info!("Number of Dumps:\t\t{}", config.dumps_to_collect());
    info!("Output directory:\t\t{}", config.dump_path.display());
    if let Some(name) = &config.dump_name {
        info!("Custom name for core dumps:\t{name}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::TargetSelector;

    fn monitor_for(mut config: Config, pid: i32) -> TargetMonitor {
        config.validate().unwrap();
        config.apply_defaults();
        let quit = Arc::new(QuitEvent::new());
        TargetMonitor::new(
            &config,
            DiscoveredTarget {
                pid,
                name: "sleep".into(),
            },
            &quit,
            Arc::new(crate::triggers::NoopManagedDumper),
        )
    }

    #[test]
    fn monitor_ends_when_the_target_dies() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id() as i32;

        let mut config = Config::new(TargetSelector::Pid(pid));
        // Long timer so only death can end the monitor.
        config.threshold_seconds = Some(3600);
        config.polling = Some(std::time::Duration::from_millis(50));
        let monitor = monitor_for(config, pid);
        let target = Arc::clone(monitor.target());

        let registry = Arc::new(TargetRegistry::new());
        registry.insert_if_absent(pid, Arc::clone(&target));
        let registry_for_monitor = Arc::clone(&registry);
        let handle = std::thread::spawn(move || monitor.run(registry_for_monitor));

        assert_eq!(
            target
                .start_monitoring
                .wait_quit_aware(&target.quit, Some(std::time::Duration::from_secs(5))),
            WaitOutcome::Signaled
        );

        child.kill().unwrap();
        child.wait().unwrap();

        handle.join().unwrap().unwrap();
        assert!(target.cleanup_complete.is_set());
        assert!(target.terminated.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[test]
    fn monitor_unwinds_on_quit() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id() as i32;

        let mut config = Config::new(TargetSelector::Pid(pid));
        config.threshold_seconds = Some(3600);
        config.polling = Some(std::time::Duration::from_millis(50));
        let monitor = monitor_for(config, pid);
        let target = Arc::clone(monitor.target());

        let registry = Arc::new(TargetRegistry::new());
        let handle = std::thread::spawn(move || monitor.run(registry));

        target
            .start_monitoring
            .wait_quit_aware(&target.quit, Some(std::time::Duration::from_secs(5)));
        target.quit.set();

        handle.join().unwrap().unwrap();
        assert!(target.cleanup_complete.is_set());

        let _ = child.kill();
        let _ = child.wait();
    }
}
