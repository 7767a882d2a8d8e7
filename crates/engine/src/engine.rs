//! Top-level wiring: environment gates, the engine-wide quit event and
//! signal thread, discovery, and the per-target monitors.

use crate::discovery::Discovery;
use crate::error::Error;
use crate::lifecycle;
use crate::monitor::TargetMonitor;
use crate::registry::TargetRegistry;
use crate::sync::QuitEvent;
use crate::triggers::managed::{ManagedDumper, NoopManagedDumper};
use config::Config;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, warn};

pub struct Engine {
    config: Config,
    managed: Arc<dyn ManagedDumper>,
}

impl Engine {
    pub fn new(mut config: Config) -> Self {
        config.apply_defaults();
        Self {
            config,
            managed: Arc::new(NoopManagedDumper),
        }
    }

    /// Swap in a diagnostics client for managed targets.
    pub fn with_managed_dumper(mut self, managed: Arc<dyn ManagedDumper>) -> Self {
        self.managed = managed;
        self
    }

    /// Monitor until every target completed or shutdown was requested.
    /// Returns once all monitors have unwound; errors indicate the engine
    /// could not operate at all (environment, unknown target) or that the
    /// dump pipeline failed fatally.
    pub fn run(&self) -> Result<(), Error> {
        lifecycle::check_kernel(config::MIN_KERNEL)?;
        if self.config.restrack {
            lifecycle::check_kernel(config::MIN_RESTRACK_KERNEL)?;
        }
        if nix::unistd::access(&self.config.dump_path, nix::unistd::AccessFlags::W_OK).is_err() {
            return Err(Error::DumpPathNotWritable(self.config.dump_path.clone()));
        }
        lifecycle::ensure_tmp_dir()?;

        // The mask must be in place before any thread exists so every
        // worker inherits it and only the signal thread takes SIGINT/SIGTERM.
        let signal_set = lifecycle::block_termination_signals()?;
        let quit = Arc::new(QuitEvent::new());
        let registry = Arc::new(TargetRegistry::new());
        let _signal_thread =
            lifecycle::spawn_signal_thread(signal_set, Arc::clone(&quit), Arc::clone(&registry))?;

        let interval = self.config.polling_interval();
        let (sender, receiver) = flume::bounded(16);
        // Tells discovery how many of its targets have finished monitoring;
        // the continuous modes need this to decide on quiescence.
        let retired = Arc::new(AtomicUsize::new(0));
        let discovery = Discovery::new(
            self.config.target.clone(),
            interval,
            Arc::clone(&quit),
            sender,
            Arc::clone(&retired),
        );
        let discovery_thread = std::thread::Builder::new()
            .name("discovery".into())
            .spawn(move || discovery.run())?;

        let mut monitors: Vec<(i32, JoinHandle<Result<(), Error>>)> = Vec::new();
        let mut failure: Option<Error> = None;
        let mut discovering = true;

        loop {
            reap_finished(&mut monitors, &mut failure, &retired);

            if quit.is_set() {
                break;
            }
            // Exit requires the discovery stream to be closed: while it is
            // open another target may still be delivered, even when every
            // current monitor has completed.
            if !discovering && monitors.is_empty() {
                break;
            }

            if discovering {
                match receiver.recv_timeout(interval) {
                    Ok(discovered) => {
                        let pid = discovered.pid;
                        if registry.get(pid).is_some() {
                            retired.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        debug!(pid, "new target");
                        let monitor = TargetMonitor::new(
                            &self.config,
                            discovered,
                            &quit,
                            Arc::clone(&self.managed),
                        );
                        if !registry.insert_if_absent(pid, Arc::clone(monitor.target())) {
                            retired.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        let registry_for_monitor = Arc::clone(&registry);
                        match std::thread::Builder::new()
                            .name(format!("monitor/{pid}"))
                            .spawn(move || monitor.run(registry_for_monitor))
                        {
                            Ok(handle) => monitors.push((pid, handle)),
                            Err(err) => {
                                registry.remove(pid);
                                retired.fetch_add(1, Ordering::SeqCst);
                                warn!(pid, %err, "failed to spawn monitor");
                            }
                        }
                    }
                    Err(flume::RecvTimeoutError::Timeout) => {}
                    Err(flume::RecvTimeoutError::Disconnected) => {
                        discovering = false;
                    }
                }
            } else if quit.wait_timeout(interval) {
                break;
            }
        }

        // Completion and shutdown converge here: make sure every monitor
        // and trigger thread unwinds, then join them.
        quit.set();
        for (_, handle) in monitors {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                }
                Err(_) => {
                    failure.get_or_insert(Error::ThreadPanicked("monitor"));
                }
            }
        }

        let discovery_result = discovery_thread
            .join()
            .map_err(|_| Error::ThreadPanicked("discovery"))?;
        discovery_result?;

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn reap_finished(
    monitors: &mut Vec<(i32, JoinHandle<Result<(), Error>>)>,
    failure: &mut Option<Error>,
    retired: &AtomicUsize,
) {
    let mut index = 0;
    while index < monitors.len() {
        if monitors[index].1.is_finished() {
            let (pid, handle) = monitors.swap_remove(index);
            retired.fetch_add(1, Ordering::SeqCst);
            match handle.join() {
                Ok(Ok(())) => debug!(pid, "monitor finished"),
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                }
                Err(_) => {
                    failure.get_or_insert(Error::ThreadPanicked("monitor"));
                }
            }
        } else {
            index += 1;
        }
    }
}
