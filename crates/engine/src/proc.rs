//! Per-pid views over `/proc`.
//!
//! Sampling tolerates a dying target: callers distinguish "the process is
//! gone" (monitoring ends) from transient read failures (skip the sample)
//! via [`is_gone`].

use crate::error::Error;
use procfs::ProcError;
use procfs::process::Process;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Marker for "no helper child is currently running".
pub const NO_PID: i32 = -1;

/// A live process identified by pid, read through `/proc/<pid>/...`.
#[derive(Debug, Clone, Copy)]
pub struct TargetProcess {
    pid: i32,
}

impl TargetProcess {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn process(&self) -> Result<Process, Error> {
        Ok(Process::new(self.pid)?)
    }

    /// The kernel's short name for the process (`/proc/<pid>/stat` comm).
    pub fn comm(&self) -> Result<String, Error> {
        Ok(self.process()?.stat()?.comm)
    }

    pub fn alive(&self) -> bool {
        Process::new(self.pid).is_ok()
    }

    pub fn process_group(&self) -> Result<i32, Error> {
        Ok(self.process()?.stat()?.pgrp)
    }

    /// Cumulative user + system time in clock ticks.
    pub fn cpu_ticks(&self) -> Result<u64, Error> {
        let stat = self.process()?.stat()?;
        Ok(stat.utime + stat.stime)
    }

    /// Resident set size in MB.
    pub fn rss_mb(&self) -> Result<u64, Error> {
        let status = self.process()?.status()?;
        Ok(status.vmrss.unwrap_or(0) / 1024)
    }

    /// Number of entries under `/proc/<pid>/task`.
    pub fn thread_count(&self) -> Result<u64, Error> {
        Ok(self.process()?.tasks()?.flatten().count() as u64)
    }

    /// Number of entries under `/proc/<pid>/fd`.
    pub fn fd_count(&self) -> Result<u64, Error> {
        Ok(self.process()?.fd_count()? as u64)
    }

    /// Read `/proc/<pid>/coredump_filter` (the kernel prints lowercase hex).
    pub fn coredump_filter(&self) -> Result<u64, Error> {
        let raw = std::fs::read_to_string(self.proc_path("coredump_filter"))?;
        u64::from_str_radix(raw.trim(), 16).map_err(|_| {
            Error::Io(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("unexpected coredump_filter contents {raw:?}"),
            ))
        })
    }

    /// Write the coredump filter. The value is written in decimal; the
    /// kernel parses the input with automatic base detection, so a bare
    /// decimal string round-trips with the hex read above.
    pub fn set_coredump_filter(&self, filter: u64) -> Result<(), Error> {
        std::fs::write(self.proc_path("coredump_filter"), format!("{filter}"))?;
        Ok(())
    }

    /// Look for the managed-runtime diagnostics socket in
    /// `/proc/<pid>/net/unix`. Present only for CoreCLR targets.
    pub fn diagnostics_socket(&self) -> Option<PathBuf> {
        let table = std::fs::read_to_string(self.proc_path("net/unix")).ok()?;
        let needle = format!("dotnet-diagnostic-{}", self.pid);
        for line in table.lines().skip(1) {
            // Path is the 8th column, absent for unbound sockets:
            // 0000000000000000: 00000003 00000000 00000000 0001 03 20287 /tmp/...
            let Some(path) = line.split_whitespace().nth(7) else {
                continue;
            };
            if path.contains(&needle) {
                return Some(PathBuf::from(path));
            }
        }
        None
    }

    fn proc_path(&self, tail: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{}/{}", self.pid, tail))
    }
}

/// Whether an error means the target has disappeared (as opposed to a
/// transient read failure worth retrying on the next sample).
pub fn is_gone(err: &Error) -> bool {
    match err {
        Error::Procfs(ProcError::NotFound(_)) => true,
        Error::Io(io_err) => io_err.kind() == ErrorKind::NotFound,
        Error::Sys(errno) => *errno == nix::errno::Errno::ESRCH,
        _ => false,
    }
}

/// Replace every non-alphanumeric byte of a process name with `_`, the form
/// used in dump file names.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Upper bound for CPU trigger thresholds: 100% per online core.
pub fn maximum_cpu() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|cores| cores.get())
        .unwrap_or(1);
    100 * cores as u32
}
