use std::path::PathBuf;

/// Represents all possible errors that can occur in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error occurred while reading data from procfs.
    #[error("Failed to read procfs info: {0}")]
    Procfs(#[from] procfs::ProcError),

    /// Error occurred while performing an I/O operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A system call failed.
    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// The running kernel predates what the requested features need.
    #[error("kernel version {required_major}.{required_minor}+ is required, found {found:?}")]
    KernelTooOld {
        required_major: u32,
        required_minor: u32,
        found: String,
    },

    /// The kernel release string could not be parsed.
    #[error("unable to parse kernel release {0:?}")]
    UnsupportedKernelRelease(String),

    /// The requested pid does not exist.
    #[error("no process found with pid {0}")]
    NoSuchProcess(i32),

    /// No live process matched the requested name.
    #[error("no process found matching {0:?}")]
    NoProcessMatching(String),

    /// The dump directory is not writable by us.
    #[error("no write permission to dump directory {0:?}")]
    DumpPathNotWritable(PathBuf),

    /// The external dump helper could not be spawned.
    #[error("failed to start helper {0:?}. Check that gdb/gcore is installed and on $PATH")]
    HelperNotFound(PathBuf),

    /// No client is wired in for managed (in-target agent) dump requests.
    #[error("managed dump agent unavailable")]
    ManagedAgentUnavailable,

    /// A worker thread panicked.
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}
