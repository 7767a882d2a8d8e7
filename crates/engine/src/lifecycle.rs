//! Process-wide startup and orderly-shutdown plumbing: the kernel version
//! gate, the SIGINT/SIGTERM mask with its dedicated handler thread, and the
//! runtime tmp directory.

use crate::error::Error;
use crate::proc::NO_PID;
use crate::registry::TargetRegistry;
use crate::sync::QuitEvent;
use nix::errno::Errno;
use nix::sys::signal::{Signal, SigSet, killpg};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

const OSRELEASE: &str = "/proc/sys/kernel/osrelease";

/// Fail unless the running kernel is at least `major.minor`.
pub fn check_kernel(required: (u32, u32)) -> Result<(), Error> {
    let release = std::fs::read_to_string(OSRELEASE)?;
    let release = release.trim();
    let (major, minor) =
        parse_release(release).ok_or_else(|| Error::UnsupportedKernelRelease(release.into()))?;
    if (major, minor) < required {
        return Err(Error::KernelTooOld {
            required_major: required.0,
            required_minor: required.1,
            found: release.into(),
        });
    }
    Ok(())
}

/// Pull `major.minor` out of a release string like `6.1.0-13-amd64`.
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: u32 = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Block SIGINT and SIGTERM for the calling thread. Must run before any
/// worker thread is spawned so the mask is inherited everywhere and the
/// dedicated signal thread is the only receiver.
pub fn block_termination_signals() -> Result<SigSet, Error> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()?;
    Ok(set)
}

/// Spawn the thread that services the blocked termination signals: it sets
/// the engine-wide quit event and forwards SIGTERM to the process group of
/// any helper child still running, so blocking helper waits unblock.
/// Repeated signals after quit are no-ops.
pub fn spawn_signal_thread(
    set: SigSet,
    quit: Arc<QuitEvent>,
    registry: Arc<TargetRegistry>,
) -> Result<JoinHandle<()>, Error> {
    let handle = std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            loop {
                match set.wait() {
                    Ok(signal) => {
                        info!(%signal, "termination signal received, shutting down");
                        quit.set();
                        for target in registry.snapshot() {
                            let helper = target.helper_pid();
                            if helper == NO_PID {
                                continue;
                            }
                            // The helper runs in its own process group; an
                            // already-exited child answers ESRCH, which is
                            // harmless.
                            match killpg(Pid::from_raw(helper), Signal::SIGTERM) {
                                Ok(()) | Err(Errno::ESRCH) => {}
                                Err(err) => {
                                    warn!(helper, %err, "failed to signal helper process group");
                                }
                            }
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        warn!(%err, "signal wait failed");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

/// Root for agent sockets and other runtime files: `$TMPDIR/procdump`,
/// falling back to `/tmp/procdump`.
pub fn tmp_root() -> PathBuf {
    let base = std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("procdump")
}

/// Create the runtime tmp directory, world-writable so in-target agents
/// running as other users can bind sockets there.
pub fn ensure_tmp_dir() -> Result<PathBuf, Error> {
    let dir = tmp_root();
    std::fs::create_dir_all(&dir)?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777))?;
    debug!(dir = %dir.display(), "runtime tmp directory ready");
    Ok(dir)
}
