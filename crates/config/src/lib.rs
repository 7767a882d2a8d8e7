#![forbid(unsafe_code)]

mod error;

pub use error::Error;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard cap on the number of dumps a single invocation may collect.
pub const MAX_DUMP_COUNT: u32 = 100;

/// Dumps collected when `-n` is not given.
pub const DEFAULT_NUMBER_OF_DUMPS: u32 = 1;

/// Consecutive seconds a polled predicate must hold before a dump is taken.
pub const DEFAULT_THRESHOLD_SECONDS: u64 = 10;

/// Smallest (and default) polling interval for the trigger threads.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(1000);

/// Default resource-tracking sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 1;

/// Oldest kernel the engine will run on.
pub const MIN_KERNEL: (u32, u32) = (3, 5);

/// Oldest kernel resource tracking will run on.
pub const MIN_RESTRACK_KERNEL: (u32, u32) = (4, 18);

/// How the user identified the process(es) to monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// A single live process.
    Pid(i32),
    /// Every process whose process group matches.
    ProcessGroup(i32),
    /// Every process whose name matches; with `wait` the engine keeps
    /// polling for (further) matches until shutdown.
    Name { name: String, wait: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTrigger {
    /// Percent of a single core; may exceed 100 on multi-core targets.
    pub percent: u32,
    /// Fire when usage drops *below* the threshold instead of above.
    pub below: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTrigger {
    /// Resident-set thresholds in MB. With more than one entry the i-th
    /// dump uses the i-th threshold, in the order supplied.
    pub thresholds_mb: Vec<u64>,
    pub below: bool,
}

/// Which managed heap a GC memory trigger watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcHeap {
    Generation(u8),
    LargeObjectHeap,
    PinnedObjectHeap,
    /// Total managed heap size across all generations.
    Cumulative,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcMemoryTrigger {
    pub heap: GcHeap,
    pub thresholds_mb: Vec<u64>,
}

/// Highest ordinary GC generation.
pub const MAX_GC_GENERATION: u8 = 2;

impl GcMemoryTrigger {
    /// Parse the `[generation:|loh:|poh:]mb[,mb...]` argument form.
    pub fn parse(arg: &str) -> Result<Self, Error> {
        let (heap, list) = match arg.split_once(':') {
            Some((heap, list)) => {
                let heap = match heap.to_ascii_lowercase().as_str() {
                    "loh" => GcHeap::LargeObjectHeap,
                    "poh" => GcHeap::PinnedObjectHeap,
                    generation => GcHeap::Generation(
                        generation
                            .parse::<u8>()
                            .map_err(|_| Error::InvalidGcGeneration)?,
                    ),
                };
                (heap, list)
            }
            None => (GcHeap::Cumulative, arg),
        };

        if let GcHeap::Generation(generation) = heap
            && generation > MAX_GC_GENERATION
        {
            return Err(Error::InvalidGcGeneration);
        }

        let thresholds_mb = list
            .split(',')
            .map(|part| part.trim().parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidMemoryThreshold)?;
        if thresholds_mb.is_empty() {
            return Err(Error::InvalidMemoryThreshold);
        }

        Ok(Self { heap, thresholds_mb })
    }
}

/// The validated per-invocation configuration record. The engine makes one
/// copy per monitored target once the pid is resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub target: TargetSelector,

    pub cpu: Option<CpuTrigger>,
    pub memory: Option<MemoryTrigger>,
    pub thread_count: Option<u64>,
    pub fd_count: Option<u64>,
    pub signals: Vec<i32>,
    pub exception: bool,
    pub exception_filter: Option<String>,
    pub gc_memory: Option<GcMemoryTrigger>,
    pub gc_generation: Option<u8>,
    pub restrack: bool,
    /// `false` when restrack runs in report-only (`nodump`) mode.
    pub restrack_dump: bool,
    pub exclude_filter: Option<String>,
    /// Implicit fallback trigger, derived during validation: set when no
    /// other trigger is configured.
    pub timer: bool,

    pub dumps: Option<u32>,
    pub threshold_seconds: Option<u64>,
    pub polling: Option<Duration>,
    pub sample_rate: Option<u32>,

    pub dump_path: PathBuf,
    pub dump_name: Option<String>,
    pub overwrite: bool,
    pub core_dump_mask: Option<u64>,

    /// External core-producing helper, resolved through `$PATH`.
    pub helper: PathBuf,
    /// Delay between helper completion and probing for the core file
    /// (core files appear late on WSL2).
    pub helper_settle: Duration,

    /// Trigger-then-snooze (default on): after a dump the trigger starts a
    /// fresh consecutive-hold window (the timer waits a full period again).
    /// Disabled, a predicate that stays true may fire again on the very
    /// next sample.
    pub snooze_cpu: bool,
    pub snooze_memory: bool,
    pub snooze_timer: bool,
}

impl Config {
    pub fn new(target: TargetSelector) -> Self {
        Self {
            target,
            cpu: None,
            memory: None,
            thread_count: None,
            fd_count: None,
            signals: Vec::new(),
            exception: false,
            exception_filter: None,
            gc_memory: None,
            gc_generation: None,
            restrack: false,
            restrack_dump: true,
            exclude_filter: None,
            timer: false,
            dumps: None,
            threshold_seconds: None,
            polling: None,
            sample_rate: None,
            dump_path: PathBuf::from("."),
            dump_name: None,
            overwrite: false,
            core_dump_mask: None,
            helper: PathBuf::from("gcore"),
            helper_settle: Duration::from_secs(1),
            snooze_cpu: true,
            snooze_memory: true,
            snooze_timer: true,
        }
    }

    /// Enforce the combination rules and derive the implicit timer trigger.
    /// Must run before [`Config::apply_defaults`].
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.dotnet_trigger_count() > 1 {
            return Err(Error::MultipleDotnetTriggers);
        }

        // The i-th dump uses the i-th memory threshold, so a threshold list
        // fixes the dump count.
        let threshold_lists = [
            self.memory.as_ref().map(|memory| memory.thresholds_mb.len()),
            self.gc_memory.as_ref().map(|gc| gc.thresholds_mb.len()),
        ];
        for len in threshold_lists.into_iter().flatten() {
            if len > 1 {
                if self.dumps.is_some() {
                    return Err(Error::MemoryThresholdsFixDumpCount);
                }
                self.dumps = Some(len as u32);
            }
        }

        if let Some(generation) = self.gc_generation {
            if generation > MAX_GC_GENERATION {
                return Err(Error::InvalidGcGeneration);
            }
            if self.dumps.is_some() {
                return Err(Error::GcGenerationFixesDumpCount);
            }
            // One dump when the collection starts and one when it finishes.
            self.dumps = Some(2);
        }

        if let Some(dumps) = self.dumps
            && dumps > MAX_DUMP_COUNT
        {
            return Err(Error::TooManyDumps(MAX_DUMP_COUNT));
        }

        if self.exception_filter.is_some() && !self.exception {
            return Err(Error::ExceptionFilterRequiresException);
        }
        if self.sample_rate.is_some() && !self.restrack {
            return Err(Error::SampleRateRequiresRestrack);
        }
        if self.exclude_filter.is_some() && !self.restrack {
            return Err(Error::ExcludeFilterRequiresRestrack);
        }

        if self.multi_process() && self.dump_name.is_some() {
            return Err(Error::DumpNameWithMultipleTargets);
        }

        self.timer = self.cpu.is_none()
            && self.memory.is_none()
            && self.thread_count.is_none()
            && self.fd_count.is_none()
            && self.gc_memory.is_none()
            && self.gc_generation.is_none()
            && self.signals.is_empty()
            && !self.exception;

        // Signal and exception triggers own the target via ptrace or the
        // agent; no other trigger may start a competing dump.
        if !self.signals.is_empty() || self.exception {
            if self.cpu.is_some()
                || self.memory.is_some()
                || self.thread_count.is_some()
                || self.fd_count.is_some()
            {
                return Err(Error::SignalTriggerExclusive);
            }
            if self.polling.is_some() {
                return Err(Error::PollingIntervalWithSignalTrigger);
            }
            self.timer = false;
        }

        Ok(())
    }

    /// Fill every unset quantity with its documented default.
    pub fn apply_defaults(&mut self) {
        self.dumps.get_or_insert(DEFAULT_NUMBER_OF_DUMPS);
        self.threshold_seconds
            .get_or_insert(DEFAULT_THRESHOLD_SECONDS);
        self.polling.get_or_insert(MIN_POLLING_INTERVAL);
        self.sample_rate.get_or_insert(DEFAULT_SAMPLE_RATE);
    }

    /// Fail unless the helper is reachable, when this configuration needs it.
    pub fn ensure_helper_available(&self) -> Result<(), Error> {
        if self.uses_helper() && !helper_on_path(&self.helper) {
            return Err(Error::HelperNotFound(self.helper.clone()));
        }
        Ok(())
    }

    pub fn dumps_to_collect(&self) -> u32 {
        self.dumps.unwrap_or(DEFAULT_NUMBER_OF_DUMPS)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_seconds.unwrap_or(DEFAULT_THRESHOLD_SECONDS))
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling.unwrap_or(MIN_POLLING_INTERVAL)
    }

    pub fn dotnet_trigger_count(&self) -> usize {
        usize::from(self.gc_memory.is_some())
            + usize::from(self.gc_generation.is_some())
            + usize::from(self.exception)
    }

    /// Whether any configured path produces dumps through the external
    /// helper. Managed triggers dump over the agent socket, and restrack in
    /// `nodump` mode produces reports only.
    pub fn uses_helper(&self) -> bool {
        self.dotnet_trigger_count() == 0 && !(self.restrack && !self.restrack_dump)
    }

    /// More than one target may be monitored at once.
    pub fn multi_process(&self) -> bool {
        matches!(
            self.target,
            TargetSelector::ProcessGroup(_) | TargetSelector::Name { .. }
        )
    }
}

/// Parse a coredump-filter mask in hex, with or without a `0x` prefix.
pub fn parse_mask(arg: &str) -> Result<u64, Error> {
    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .unwrap_or(arg);
    if digits.is_empty() {
        return Err(Error::InvalidCoreDumpMask(arg.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| Error::InvalidCoreDumpMask(arg.to_string()))
}

/// Check whether the helper can be found, either as an explicit path or in
/// any of the `$PATH` directories.
pub fn helper_on_path(helper: &Path) -> bool {
    helper_in(helper, std::env::var_os("PATH").as_deref())
}

fn helper_in(helper: &Path, path_var: Option<&OsStr>) -> bool {
    if helper.components().count() > 1 {
        return helper.is_file();
    }
    let Some(path_var) = path_var else {
        return false;
    };
    std::env::split_paths(path_var).any(|dir| dir.join(helper).is_file())
}
