#![forbid(unsafe_code)]

pub mod discovery;
pub mod dump;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod proc;
pub mod registry;
pub mod sync;
pub mod target;
pub mod triggers;

pub use discovery::{DiscoveredTarget, Discovery};
pub use dump::{CoreDumpWriter, DumpKind, dump_prefix};
pub use engine::Engine;
pub use error::Error;
pub use monitor::TargetMonitor;
pub use registry::TargetRegistry;
pub use sync::{ManualResetEvent, QuitEvent, Semaphore, WaitOutcome, Wakeable};
pub use target::TargetState;
pub use triggers::{AgentListener, ManagedDumper, NoopManagedDumper};

pub use proc::{NO_PID, TargetProcess, sanitize};
