//! Trigger threads: each active trigger runs its own thread against the
//! shared per-target state and funnels fires into the dump writer.

pub mod managed;
pub mod polled;
pub mod signal;

pub use managed::{AgentListener, ManagedDumper, NoopManagedDumper};
