use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid CPU threshold specified")]
    InvalidCpuThreshold,

    #[error("Invalid memory threshold specified")]
    InvalidMemoryThreshold,

    #[error("Invalid GC generation or heap specified")]
    InvalidGcGeneration,

    #[error("Invalid core dump mask specified: {0:?}")]
    InvalidCoreDumpMask(String),

    #[error("Only one .NET trigger can be specified")]
    MultipleDotnetTriggers,

    #[error(
        "When specifying more than one memory threshold the number of dumps option is invalid"
    )]
    MemoryThresholdsFixDumpCount,

    #[error(
        "The GC generation trigger always collects two dumps; the number of dumps option is invalid"
    )]
    GcGenerationFixesDumpCount,

    #[error("Max dump count must be less than {0}")]
    TooManyDumps(u32),

    #[error("An exception filter requires the exception trigger")]
    ExceptionFilterRequiresException,

    #[error("A sample rate requires resource tracking")]
    SampleRateRequiresRestrack,

    #[error("An exclude filter requires resource tracking")]
    ExcludeFilterRequiresRestrack,

    #[error("Signal/exception triggers must be the only trigger specified")]
    SignalTriggerExclusive,

    #[error("A polling interval has no meaning during signal/exception monitoring")]
    PollingIntervalWithSignalTrigger,

    #[error("The wait option requires the process be specified by name")]
    WaitRequiresName,

    #[error("Setting the core dump name is invalid when monitoring multiple processes")]
    DumpNameWithMultipleTargets,

    #[error("Invalid directory {0:?} provided for core dump output")]
    InvalidDumpDirectory(PathBuf),

    #[error(
        "failed to locate {0:?} in $PATH. Check that gdb/gcore is installed and configured on your system"
    )]
    HelperNotFound(PathBuf),

    #[error("Invalid target {0:?}: expected a PID or a process name")]
    InvalidTarget(String),
}
