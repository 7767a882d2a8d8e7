//! Core dump production.
//!
//! All dump paths funnel through [`CoreDumpWriter::write`]: it serialises
//! helper invocations through the per-target dump slot, prepares the output
//! name, applies (and always restores) a custom coredump filter, drives the
//! external helper in its own process group, and decides between success,
//! failure, and quit-during-dump.

use crate::error::Error;
use crate::proc::{TargetProcess, sanitize};
use crate::sync::WaitOutcome;
use crate::target::TargetState;
use crate::triggers::managed::ManagedDumper;
use chrono::Local;
use nix::unistd::AccessFlags;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Most helper output lines retained for diagnostics.
const MAX_LINES: usize = 15;

/// The helper prints this when it could not produce a core, even when it
/// exits zero.
const HELPER_FAILED_MARKER: &str = "gcore: failed";

/// What tripped a dump; becomes the middle segment of the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Commit,
    Cpu,
    Thread,
    FileDesc,
    Signal,
    Time,
    Exception,
    Manual,
}

impl DumpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::Commit => "commit",
            DumpKind::Cpu => "cpu",
            DumpKind::Thread => "thread",
            DumpKind::FileDesc => "filedesc",
            DumpKind::Signal => "signal",
            DumpKind::Time => "time",
            DumpKind::Exception => "exception",
            DumpKind::Manual => "manual",
        }
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base output path for a dump: `<dir>/<sanitizedName>_<kind>_<yymmdd_HHMMSS>`,
/// or `<dir>/<customName>` when one is configured. The helper appends
/// `.<pid>`.
pub fn dump_prefix(target: &TargetState, kind: DumpKind) -> PathBuf {
    let config = target.config();
    let segment = match &config.dump_name {
        Some(name) => name.clone(),
        None => format!(
            "{}_{}_{}",
            sanitize(target.name()),
            kind,
            Local::now().format("%y%m%d_%H%M%S")
        ),
    };
    config.dump_path.join(segment)
}

/// Releases the dump slot (and the in-progress counter) on every exit path.
struct SlotGuard<'a> {
    target: &'a TargetState,
}

impl<'a> SlotGuard<'a> {
    fn new(target: &'a TargetState) -> Self {
        target.begin_dump();
        Self { target }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.target.end_dump();
        self.target.release_dump_slot();
    }
}

/// Applies a custom coredump filter and restores the previous value on
/// every exit path. When the previous value cannot be read there is
/// nothing trustworthy to restore; that is logged so operators notice.
struct FilterGuard {
    process: TargetProcess,
    saved: Option<u64>,
}

impl FilterGuard {
    fn apply(process: TargetProcess, mask: u64) -> Self {
        let saved = match process.coredump_filter() {
            Ok(current) => Some(current),
            Err(err) => {
                warn!(
                    pid = process.pid(),
                    %err,
                    "cannot read the current coredump filter; it will not be restored"
                );
                None
            }
        };
        if let Err(err) = process.set_coredump_filter(mask) {
            warn!(pid = process.pid(), mask, %err, "failed to apply coredump filter");
        }
        Self { process, saved }
    }
}

impl Drop for FilterGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved
            && let Err(err) = self.process.set_coredump_filter(saved)
        {
            warn!(pid = self.process.pid(), %err, "failed to restore coredump filter");
        }
    }
}

/// Clears the advertised helper pid on every exit path.
struct HelperGuard<'a> {
    target: &'a TargetState,
}

impl<'a> HelperGuard<'a> {
    fn new(target: &'a TargetState, helper_pid: i32) -> Self {
        target.set_helper_pid(helper_pid);
        Self { target }
    }
}

impl Drop for HelperGuard<'_> {
    fn drop(&mut self) {
        self.target.clear_helper_pid();
    }
}

pub struct CoreDumpWriter {
    target: Arc<TargetState>,
    kind: DumpKind,
}

impl CoreDumpWriter {
    pub fn new(target: Arc<TargetState>, kind: DumpKind) -> Self {
        Self { target, kind }
    }

    /// Produce one core dump. Returns the file path on success and `None`
    /// when no dump was produced (quit, limit reached, refusal, or a
    /// contained helper failure). Only environmental problems that make
    /// every future dump impossible surface as errors.
    pub fn write(&self, managed: &dyn ManagedDumper) -> Result<Option<PathBuf>, Error> {
        match self.target.acquire_dump_slot() {
            WaitOutcome::Quit | WaitOutcome::Abandoned => return Ok(None),
            _ => {}
        }
        let _slot = SlotGuard::new(&self.target);

        let process = TargetProcess::new(self.target.pid());
        let config = self.target.config();

        let prefix = dump_prefix(&self.target, self.kind);
        // On Linux the helper appends ".<pid>" to whatever -o names.
        let core_path = PathBuf::from(format!(
            "{}.{}",
            prefix.display(),
            self.target.pid()
        ));

        if core_path.exists() && !config.overwrite {
            info!(
                "Dump file {} already exists and was not overwritten (use -o to overwrite)",
                core_path.display()
            );
            return Ok(None);
        }

        if nix::unistd::access(&config.dump_path, AccessFlags::W_OK).is_err() {
            return Err(Error::DumpPathNotWritable(config.dump_path.clone()));
        }

        let _filter = config
            .core_dump_mask
            .map(|mask| FilterGuard::apply(process, mask));

        // A managed target is dumped through its in-process agent; the
        // external helper cannot see the managed heap.
        if let Some(socket) = process.diagnostics_socket() {
            return match managed.collect(&socket, &core_path) {
                Ok(()) => {
                    let collected = self.target.record_dump();
                    info!("Core dump {} generated: {}", collected, core_path.display());
                    Ok(Some(core_path))
                }
                Err(err) => {
                    error!(
                        %err,
                        "An error occurred while generating the core dump for the managed target"
                    );
                    Ok(None)
                }
            };
        }

        self.run_helper(&prefix, &core_path)
    }

    fn run_helper(&self, prefix: &Path, core_path: &Path) -> Result<Option<PathBuf>, Error> {
        let config = self.target.config();

        let (reader, writer) = std::io::pipe()?;
        let stderr_writer = writer.try_clone()?;

        let child = {
            let mut command = Command::new(&config.helper);
            command
                .arg("-o")
                .arg(prefix)
                .arg(self.target.pid().to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::from(writer))
                .stderr(Stdio::from(stderr_writer))
                // Own process group, so shutdown can terminate the helper
                // tree without touching us.
                .process_group(0);
            command.spawn()
            // Command drops here, closing our copies of the pipe write end.
        };

        let mut child = match child {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                error!(
                    "Failed to start helper {:?}. Check that gdb/gcore is installed and configured on your system.",
                    config.helper
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let _helper = HelperGuard::new(&self.target, child.id() as i32);

        // Drain the merged stdout/stderr, keeping the first MAX_LINES.
        let mut lines: Vec<String> = Vec::new();
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => {
                    if lines.len() < MAX_LINES {
                        lines.push(line);
                    }
                }
                Err(_) => break,
            }
        }

        let status = child.wait()?;
        drop(_helper);

        let failed_marker = lines
            .last()
            .is_some_and(|line| line.contains(HELPER_FAILED_MARKER));

        if status.code() != Some(0) || failed_marker {
            if self.target.quit.is_set() {
                // Shutdown killed the helper mid-dump; remove what it left.
                remove_partial(core_path);
                return Ok(None);
            }
            error!("An error occurred while generating the core dump:");
            match status.code() {
                Some(127) => {
                    error!("\tDump exit status = 127");
                    error!(
                        "\tFailed to start helper {:?} in $PATH. Check that gdb/gcore is installed and configured on your system.",
                        config.helper
                    );
                }
                Some(code) => error!("\tDump exit status = {code}"),
                None => error!("\tHelper terminated by signal"),
            }
            if failed_marker {
                error!("\t{HELPER_FAILED_MARKER}");
            }
            for line in &lines {
                error!("GCORE - {line}");
            }
            return Ok(None);
        }

        // WSL2 exhibits a delay between helper completion and the core
        // file becoming visible.
        if !config.helper_settle.is_zero() {
            std::thread::sleep(config.helper_settle);
        }

        if !core_path.exists() {
            warn!(
                "helper reported success but {} does not exist",
                core_path.display()
            );
            return Ok(None);
        }

        if self.target.quit.is_set() {
            remove_partial(core_path);
            return Ok(None);
        }

        let collected = self.target.record_dump();
        info!("Core dump {} generated: {}", collected, core_path.display());
        Ok(Some(core_path.to_path_buf()))
    }
}

fn remove_partial(core_path: &Path) {
    if let Err(err) = std::fs::remove_file(core_path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(
            "failed to remove partial core dump {}: {err}",
            core_path.display()
        );
    }
}
