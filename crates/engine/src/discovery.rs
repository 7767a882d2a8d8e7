//! Target discovery: resolve the user's target selector into a stream of
//! live pids. Discovery is authoritative for appearance only; the per-target
//! monitors notice disappearance themselves when `/proc` reads fail.
//!
//! Closing the event stream is the engine's signal that no further targets
//! can appear. The continuous modes (process group, name-with-wait) keep
//! rescanning until shutdown, or until the work is provably complete: at
//! least one target was discovered, every discovered target has been
//! retired by the engine, and repeated rescans find nothing new.

use crate::error::Error;
use crate::sync::QuitEvent;
use config::TargetSelector;
use procfs::process::{Process, all_processes};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Consecutive no-new-match rescans (with every discovered target retired)
/// before a continuous mode concludes that no more targets are coming.
const QUIESCENT_SCANS: u32 = 2;

/// A newly appeared process to monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTarget {
    pub pid: i32,
    pub name: String,
}

pub struct Discovery {
    selector: TargetSelector,
    interval: Duration,
    quit: Arc<QuitEvent>,
    sender: flume::Sender<DiscoveredTarget>,
    /// Count of discovered targets whose monitoring is over, maintained by
    /// the engine. Compared against how many pids this discovery emitted.
    retired: Arc<AtomicUsize>,
}

impl Discovery {
    pub fn new(
        selector: TargetSelector,
        interval: Duration,
        quit: Arc<QuitEvent>,
        sender: flume::Sender<DiscoveredTarget>,
        retired: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            selector,
            interval,
            quit,
            sender,
            retired,
        }
    }

    pub fn run(self) -> Result<(), Error> {
        match self.selector.clone() {
            TargetSelector::Pid(pid) => self.run_pid(pid),
            TargetSelector::ProcessGroup(pgid) => self.run_process_group(pgid),
            TargetSelector::Name { name, wait } => self.run_name(&name, wait),
        }
    }

    /// Explicit pid: emit once, terminate.
    fn run_pid(self, pid: i32) -> Result<(), Error> {
        let process = Process::new(pid).map_err(|_| Error::NoSuchProcess(pid))?;
        let name = process
            .stat()
            .map(|stat| stat.comm)
            .map_err(|_| Error::NoSuchProcess(pid))?;
        let _ = self.sender.send(DiscoveredTarget { pid, name });
        Ok(())
    }

    /// Process group: rescan on every polling interval, emitting pids that
    /// newly appear, until quit or quiescence.
    fn run_process_group(self, pgid: i32) -> Result<(), Error> {
        let mut seen = HashSet::new();
        let mut quiet_scans = 0u32;
        loop {
            match self.emit_new(scan(|stat| stat.pgrp == pgid), &mut seen) {
                Ok(0) => {
                    if self.quiescent(&seen, &mut quiet_scans) {
                        return Ok(());
                    }
                }
                Ok(_) => quiet_scans = 0,
                Err(()) => return Ok(()),
            }
            if self.quit.wait_timeout(self.interval) {
                return Ok(());
            }
        }
    }

    /// Process name: emit current matches; without `wait` a missing match
    /// is an error and a single scan suffices, with `wait` keep polling so
    /// late arrivals get monitors too.
    fn run_name(self, name: &str, wait: bool) -> Result<(), Error> {
        let mut seen = HashSet::new();
        let first_batch = match self.emit_new(scan_by_name(name), &mut seen) {
            Ok(count) => count,
            Err(()) => return Ok(()),
        };
        if !wait {
            if first_batch == 0 {
                return Err(Error::NoProcessMatching(name.to_string()));
            }
            return Ok(());
        }

        let mut quiet_scans = 0u32;
        loop {
            if self.quit.wait_timeout(self.interval) {
                return Ok(());
            }
            match self.emit_new(scan_by_name(name), &mut seen) {
                Ok(0) => {
                    if self.quiescent(&seen, &mut quiet_scans) {
                        return Ok(());
                    }
                }
                Ok(_) => quiet_scans = 0,
                Err(()) => return Ok(()),
            }
        }
    }

    /// Send targets that have not been seen before. `Err` means the engine
    /// side hung up.
    fn emit_new(
        &self,
        targets: Vec<DiscoveredTarget>,
        seen: &mut HashSet<i32>,
    ) -> Result<usize, ()> {
        let mut sent = 0usize;
        for target in targets {
            if seen.insert(target.pid) {
                debug!(pid = target.pid, "new target found");
                if self.sender.send(target).is_err() {
                    return Err(());
                }
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// A rescan found nothing new: quiescent once that has happened
    /// `QUIESCENT_SCANS` times in a row with every previously discovered
    /// target already retired.
    fn quiescent(&self, seen: &HashSet<i32>, quiet_scans: &mut u32) -> bool {
        if seen.is_empty() || self.retired.load(Ordering::SeqCst) < seen.len() {
            *quiet_scans = 0;
            return false;
        }
        *quiet_scans += 1;
        *quiet_scans >= QUIESCENT_SCANS
    }
}

/// Sweep `/proc` for processes whose stat satisfies the filter. Never our
/// own process; unreadable entries are skipped.
fn scan(mut filter: impl FnMut(&procfs::process::Stat) -> bool) -> Vec<DiscoveredTarget> {
    let own_pid = std::process::id() as i32;
    let mut found = Vec::new();
    let processes = match all_processes() {
        Ok(processes) => processes,
        Err(err) => {
            warn!(%err, "failed to enumerate /proc");
            return found;
        }
    };
    for process in processes.flatten() {
        let Ok(stat) = process.stat() else {
            continue;
        };
        if stat.pid == own_pid {
            continue;
        }
        if filter(&stat) {
            found.push(DiscoveredTarget {
                pid: stat.pid,
                name: stat.comm.clone(),
            });
        }
    }
    found
}

fn scan_by_name(name: &str) -> Vec<DiscoveredTarget> {
    let own_pid = std::process::id() as i32;
    let mut found = Vec::new();
    let processes = match all_processes() {
        Ok(processes) => processes,
        Err(err) => {
            warn!(%err, "failed to enumerate /proc");
            return found;
        }
    };
    for process in processes.flatten() {
        let Ok(stat) = process.stat() else {
            continue;
        };
        if stat.pid == own_pid {
            continue;
        }
        let cmdline_base = process
            .cmdline()
            .ok()
            .and_then(|args| args.into_iter().next())
            .as_deref()
            .and_then(argv0_base);
        if name_matches(&stat.comm, cmdline_base.as_deref(), name) {
            found.push(DiscoveredTarget {
                pid: stat.pid,
                name: stat.comm.clone(),
            });
        }
    }
    found
}

/// The kernel truncates comm at 15 bytes, so the basename of argv[0] is
/// consulted as well.
fn name_matches(comm: &str, cmdline_base: Option<&str>, wanted: &str) -> bool {
    comm == wanted || cmdline_base == Some(wanted)
}

fn argv0_base(argv0: &str) -> Option<String> {
    Path::new(argv0)
        .file_name()
        .and_then(|base| base.to_str())
        .map(str::to_string)
}
