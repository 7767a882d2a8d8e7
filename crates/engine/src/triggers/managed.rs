//! Hook points for managed-runtime (CoreCLR) targets.
//!
//! Managed targets are dumped by an agent inside the target, reached over
//! its diagnostics socket; the engine's side of that is the
//! [`ManagedDumper`] seam. In the other direction, an in-target agent
//! reports trigger events (exceptions, GC transitions) to a listener socket
//! owned by the engine; each notification is an immediate dump request,
//! subject to the shared dump slot.

use crate::dump::{CoreDumpWriter, DumpKind};
use crate::error::Error;
use crate::lifecycle::tmp_root;
use crate::target::TargetState;
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Produces a dump of a managed target over its diagnostics socket.
pub trait ManagedDumper: Send + Sync {
    fn collect(&self, socket: &Path, output: &Path) -> Result<(), Error>;
}

/// Stand-in used until a diagnostics client is wired in: managed dump
/// requests are reported as unavailable, logged, and abandoned.
#[derive(Debug, Default)]
pub struct NoopManagedDumper;

impl ManagedDumper for NoopManagedDumper {
    fn collect(&self, _socket: &Path, _output: &Path) -> Result<(), Error> {
        Err(Error::ManagedAgentUnavailable)
    }
}

/// Where the in-target agent reaches us for a given target.
pub fn agent_socket_path(our_pid: i32, target_pid: i32) -> PathBuf {
    tmp_root().join(format!("procdump{our_pid}-{target_pid}"))
}

const ACCEPT_TICK: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepts agent connections for one target and converts every reported
/// event into a dump request. Unlinks its socket on drop.
pub struct AgentListener {
    target: Arc<TargetState>,
    listener: UnixListener,
    path: PathBuf,
}

impl AgentListener {
    pub fn bind(target: Arc<TargetState>) -> Result<Self, Error> {
        let path = agent_socket_path(std::process::id() as i32, target.pid());
        // A previous instance may have died without cleanup.
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        debug!(socket = %path.display(), "agent listener bound");
        Ok(Self {
            target,
            listener,
            path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Serve until quit. Each line received from an agent names one event.
    pub fn run(self, managed: Arc<dyn ManagedDumper>) {
        loop {
            if self.target.quit.is_set() {
                break;
            }
            match self.listener.accept() {
                Ok((stream, _)) => self.serve_agent(stream, managed.as_ref()),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if self.target.wait_tick(ACCEPT_TICK) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "agent accept failed");
                    if self.target.wait_tick(ACCEPT_TICK) {
                        break;
                    }
                }
            }
        }
    }

    fn serve_agent(&self, stream: UnixStream, managed: &dyn ManagedDumper) {
        if let Err(err) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
            warn!(%err, "agent stream setup failed");
            return;
        }
        for line in BufReader::new(stream).lines() {
            let event = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let event = event.trim();
            if event.is_empty() {
                continue;
            }

            let config = self.target.config();
            if config.exception
                && !matches_filter(config.exception_filter.as_deref(), event)
            {
                debug!(%event, "agent event did not match the exception filter");
                continue;
            }

            info!(%event, "agent notification");
            let kind = if config.exception {
                DumpKind::Exception
            } else {
                DumpKind::Manual
            };
            match CoreDumpWriter::new(Arc::clone(&self.target), kind).write(managed) {
                Ok(_) => {}
                Err(err) => error!(%err, "agent-requested dump failed"),
            }
            if self.target.quit.is_set() {
                break;
            }
        }
    }
}

impl Drop for AgentListener {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(socket = %self.path.display(), %err, "failed to unlink agent socket");
        }
    }
}

/// Match an event name against a comma-separated list of patterns with `*`
/// wildcards. No filter accepts everything.
pub fn matches_filter(filter: Option<&str>, name: &str) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    filter
        .split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .any(|pattern| wildcard_match(pattern, name))
}

/// Case-insensitive glob with `*` as the only metacharacter.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    let text: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Let the last star swallow one more character.
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
