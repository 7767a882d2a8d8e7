//! Per-target runtime state shared between the monitor, its trigger
//! threads, the dump writer, and the signal thread.

use crate::error::Error;
use crate::proc::NO_PID;
use crate::sync::{ManualResetEvent, QuitEvent, Semaphore, WaitOutcome, Wakeable};
use config::Config;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// One dump helper at a time per target.
const DUMP_SLOTS: u32 = 1;

pub struct TargetState {
    config: Config,
    pid: i32,
    name: String,

    /// Per-target shutdown; chained to the engine-wide quit event so a
    /// SIGINT unwinds every monitor, while a reached dump cap only stops
    /// this one.
    pub quit: Arc<QuitEvent>,
    pub start_monitoring: Arc<ManualResetEvent>,
    pub configuration_printed: Arc<ManualResetEvent>,
    pub cleanup_complete: Arc<ManualResetEvent>,
    /// Set once the ptrace thread is attached and watching.
    pub debug_thread_ready: Arc<ManualResetEvent>,

    dump_slots: Arc<Semaphore>,
    dumps_collected: AtomicU32,
    dumps_in_progress: AtomicU32,
    pub terminated: AtomicBool,
    /// Pid of the running helper child, [`NO_PID`] when idle. Read
    /// best-effort by the signal thread; a stale value at worst signals an
    /// already-reaped process group (ESRCH, ignored).
    helper_pid: AtomicI32,
    memory_threshold_index: AtomicUsize,
    /// First fatal dump-pipeline error, surfaced by the monitor on join.
    failure: Mutex<Option<Error>>,

    /// Serialises ptrace attach/detach for this target.
    pub ptrace_lock: Mutex<()>,
}

impl TargetState {
    /// Build the runtime state for one resolved target. `parent_quit` is
    /// the engine-wide quit event; `None` keeps the target standalone
    /// (tests).
    pub fn new(
        config: Config,
        pid: i32,
        name: String,
        parent_quit: Option<&Arc<QuitEvent>>,
    ) -> Arc<Self> {
        let quit = Arc::new(QuitEvent::new());
        let start_monitoring = Arc::new(ManualResetEvent::new());
        let configuration_printed = Arc::new(ManualResetEvent::new());
        let cleanup_complete = Arc::new(ManualResetEvent::new());
        let debug_thread_ready = Arc::new(ManualResetEvent::new());
        let dump_slots = Arc::new(Semaphore::new(DUMP_SLOTS));

        // Every primitive that participates in a quit-aware wait must be
        // woken by the quit transition.
        quit.subscribe(Arc::clone(&start_monitoring) as Arc<dyn Wakeable>);
        quit.subscribe(Arc::clone(&debug_thread_ready) as Arc<dyn Wakeable>);
        quit.subscribe(Arc::clone(&dump_slots) as Arc<dyn Wakeable>);
        if let Some(parent) = parent_quit {
            parent.subscribe(Arc::clone(&quit) as Arc<dyn Wakeable>);
        }

        Arc::new(Self {
            config,
            pid,
            name,
            quit,
            start_monitoring,
            configuration_printed,
            cleanup_complete,
            debug_thread_ready,
            dump_slots,
            dumps_collected: AtomicU32::new(0),
            dumps_in_progress: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            helper_pid: AtomicI32::new(NO_PID),
            memory_threshold_index: AtomicUsize::new(0),
            failure: Mutex::new(None),
            ptrace_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sleep for one tick, waking immediately on quit. Returns whether quit
    /// fired.
    pub fn wait_tick(&self, tick: Duration) -> bool {
        self.quit.wait_timeout(tick)
    }

    /// Enter the dump critical section. [`WaitOutcome::Abandoned`] means
    /// the dump limit has been reached and no further dumps may start.
    pub fn acquire_dump_slot(&self) -> WaitOutcome {
        if self.dumps_collected() >= self.config.dumps_to_collect() {
            return WaitOutcome::Abandoned;
        }
        match self.dump_slots.acquire_quit_aware(&self.quit, None) {
            WaitOutcome::Signaled => {
                // The previous slot holder may have collected the final dump
                // while we were blocked.
                if self.dumps_collected() >= self.config.dumps_to_collect() {
                    self.dump_slots.release();
                    WaitOutcome::Abandoned
                } else {
                    WaitOutcome::Signaled
                }
            }
            other => other,
        }
    }

    pub fn release_dump_slot(&self) {
        self.dump_slots.release();
    }

    pub fn dumps_collected(&self) -> u32 {
        self.dumps_collected.load(Ordering::SeqCst)
    }

    /// Count a produced dump. Sets the per-target quit once the cap is
    /// reached. Returns the pre-increment count (dumps are logged 0-based).
    pub fn record_dump(&self) -> u32 {
        let collected = self.dumps_collected.fetch_add(1, Ordering::SeqCst);
        if collected + 1 >= self.config.dumps_to_collect() {
            self.quit.set();
        }
        collected
    }

    pub fn begin_dump(&self) {
        self.dumps_in_progress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_dump(&self) {
        self.dumps_in_progress.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn dumps_in_progress(&self) -> u32 {
        self.dumps_in_progress.load(Ordering::SeqCst)
    }

    pub fn helper_pid(&self) -> i32 {
        self.helper_pid.load(Ordering::SeqCst)
    }

    pub fn set_helper_pid(&self, pid: i32) {
        self.helper_pid.store(pid, Ordering::SeqCst);
    }

    pub fn clear_helper_pid(&self) {
        self.helper_pid.store(NO_PID, Ordering::SeqCst);
    }

    /// Keep the first fatal error; later ones add nothing.
    pub fn record_failure(&self, err: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    pub fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    /// Index of the memory threshold the next commit dump uses.
    pub fn memory_threshold_index(&self) -> usize {
        self.memory_threshold_index.load(Ordering::SeqCst)
    }

    pub fn advance_memory_threshold(&self) {
        self.memory_threshold_index.fetch_add(1, Ordering::SeqCst);
    }
}
