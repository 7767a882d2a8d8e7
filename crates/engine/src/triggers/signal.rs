//! The signal trigger: attach to the target with ptrace, dump when one of
//! the listed signals is delivered, and re-inject every intercepted signal
//! so the target keeps its original semantics.

use crate::dump::{CoreDumpWriter, DumpKind};
use crate::target::TargetState;
use crate::triggers::managed::ManagedDumper;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bound on quit-observance while the tracee is running.
const WAIT_TICK: Duration = Duration::from_millis(100);

pub fn signal_monitor(target: Arc<TargetState>, managed: Arc<dyn ManagedDumper>) {
    let signals = target.config().signals.clone();
    if signals.is_empty() {
        return;
    }
    let pid = Pid::from_raw(target.pid());

    {
        let _ptrace = target.ptrace_lock.lock();
        if let Err(err) = ptrace::attach(pid) {
            error!(pid = target.pid(), %err, "ptrace attach failed");
            target.quit.set();
            target.debug_thread_ready.set();
            return;
        }
    }
    // Reap the attach stop before letting the target run again.
    if let Err(err) = waitpid(pid, None) {
        error!(pid = target.pid(), %err, "wait for attach stop failed");
        target.quit.set();
        target.debug_thread_ready.set();
        return;
    }
    target.debug_thread_ready.set();
    if let Err(err) = ptrace::cont(pid, None) {
        error!(pid = target.pid(), %err, "failed to resume traced target");
        detach(&target, pid);
        target.quit.set();
        return;
    }

    loop {
        if target.quit.is_set() {
            break;
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if target.wait_tick(WAIT_TICK) {
                    break;
                }
            }
            Ok(WaitStatus::Stopped(_, signal)) => {
                if signals.contains(&(signal as i32)) {
                    info!(%signal, pid = target.pid(), "signal trigger fired");
                    // The target stays stopped while the dump is taken.
                    if let Err(err) = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Signal)
                        .write(managed.as_ref())
                    {
                        error!(%err, "dump pipeline failed");
                        target.record_failure(err);
                        target.quit.set();
                    }
                }
                // Deliver the original signal on resume.
                match ptrace::cont(pid, signal) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => {
                        target_exited(&target);
                        return;
                    }
                    Err(err) => {
                        error!(%err, "ptrace continue failed");
                        break;
                    }
                }
            }
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                target_exited(&target);
                return;
            }
            Ok(_) => {
                let _ = ptrace::cont(pid, None);
            }
            Err(Errno::ECHILD | Errno::ESRCH) => {
                target_exited(&target);
                return;
            }
            Err(Errno::EINTR) => {}
            Err(err) => {
                warn!(%err, "ptrace wait failed");
                break;
            }
        }
    }

    detach(&target, pid);
}

fn target_exited(target: &TargetState) {
    target.terminated.store(true, Ordering::SeqCst);
    target.quit.set();
}

/// Best-effort detach: bring the target into a stop we can detach from,
/// then let it continue on its own.
fn detach(target: &TargetState, pid: Pid) {
    let _ptrace = target.ptrace_lock.lock();
    let _ = kill(pid, Signal::SIGSTOP);
    let _ = waitpid(pid, None);
    let _ = ptrace::detach(pid, None);
    let _ = kill(pid, Signal::SIGCONT);
}
