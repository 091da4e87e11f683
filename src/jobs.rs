//! Job channels: child processes spoken to over their stdin/stdout.
//!
//! A job is launched with stdin and stdout piped and stderr discarded. Its
//! pipes become an ordinary channel with its own receiver thread, so
//! messages a job writes reach the host through the same queue as socket
//! traffic.
//!
//! # Exit reporting
//!
//! Every job's exit is reported to the host exactly once, whether the
//! process quit on its own or was killed by shutdown. Whoever removes the
//! child from the [`ProcessTable`] owns the report; the table lock makes
//! that removal happen once.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rmpv::Value;
use tracing::{debug, info, warn};

use crate::broker::Shared;
use crate::channel::{ChannelId, ChannelKind, ProcessTransport, Transport};
use crate::control::ControlCommand;
use crate::error::BrokerError;
use crate::receiver;
use crate::wire::{encode_message, Message};

/// How long a receiver waits for a job that closed stdout to exit before
/// killing it.
pub(crate) const REAP_GRACE: Duration = Duration::from_millis(250);

const REAP_POLL: Duration = Duration::from_millis(10);

// ============================================================================
// Job command lines
// ============================================================================

/// A program plus arguments to run as a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl JobCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    /// Run `line` through the platform shell.
    pub fn shell(line: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd").arg("/C").arg(line)
        } else {
            Self::new("sh").arg("-c").arg(line)
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

// ============================================================================
// Live-process map
// ============================================================================

/// Children that have not been reaped yet, by channel.
#[derive(Default)]
pub(crate) struct ProcessTable {
    children: Mutex<HashMap<ChannelId, Child>>,
}

impl ProcessTable {
    fn children(&self) -> MutexGuard<'_, HashMap<ChannelId, Child>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, id: ChannelId, child: Child) {
        self.children().insert(id, child);
    }

    /// Remove the child for `id`. The caller that gets `Some` reports the exit.
    pub(crate) fn take(&self, id: ChannelId) -> Option<Child> {
        self.children().remove(&id)
    }

    pub(crate) fn contains(&self, id: ChannelId) -> bool {
        self.children().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.children().len()
    }

    /// Ask the child for `id` to terminate. Returns whether a signal was sent.
    ///
    /// Runs under the table lock so the pid cannot have been reaped (and
    /// reused) in between.
    #[cfg(unix)]
    pub(crate) fn terminate(&self, id: ChannelId) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let children = self.children();
        let Some(child) = children.get(&id) else {
            return false;
        };
        let pid = child.id();
        debug!("Sending SIGTERM to job {} (pid {})", id, pid);
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send SIGTERM to {}: {}", pid, e);
                false
            }
        }
    }

    /// No signals here; closing stdin is the only request to stop.
    #[cfg(not(unix))]
    pub(crate) fn terminate(&self, _id: ChannelId) -> bool {
        false
    }
}

/// Wait up to `grace` for `child` to exit, then kill it. Returns the exit
/// code, `None` if it died from a signal or could not be collected.
pub(crate) fn reap(mut child: Child, grace: Duration) -> Option<i32> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
            Ok(None) => break,
            Err(e) => {
                warn!("Error waiting for job {}: {}", child.id(), e);
                break;
            }
        }
    }

    warn!("Job {} still running, killing", child.id());
    if let Err(e) = child.kill() {
        debug!("Kill of job {} failed: {}", child.id(), e);
    }
    match child.wait() {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to collect job {}: {}", child.id(), e);
            None
        }
    }
}

/// Reap the child for `id` if nobody else has, and report its exit.
pub(crate) fn reap_and_report(shared: &Shared, id: ChannelId, grace: Duration) -> bool {
    let Some(child) = shared.processes.take(id) else {
        return false;
    };
    let status = reap(child, grace);
    info!("Job channel {} exited with status {:?}", id, status);
    shared.control.notify(ControlCommand::ChannelExited {
        channel: id,
        status,
    });
    true
}

// ============================================================================
// Job manager
// ============================================================================

/// Handle for starting jobs and sending them notifications.
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<Shared>,
}

impl JobManager {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Launch `command` as a new job channel and return its id.
    ///
    /// # Errors
    ///
    /// [`BrokerError::ShuttingDown`] once shutdown has begun,
    /// [`BrokerError::Spawn`] if the process cannot be started.
    pub fn spawn(&self, command: &JobCommand) -> Result<ChannelId, BrokerError> {
        let shared = &self.shared;
        let id = shared.registry.try_allocate()?;

        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| BrokerError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = reap(child, Duration::ZERO);
                return Err(BrokerError::Spawn {
                    command: command.to_string(),
                    source: std::io::Error::other("job pipes were not captured"),
                });
            }
        };
        let pid = child.id();
        let transport: Arc<dyn Transport> = Arc::new(ProcessTransport::new(stdin, stdout, pid));

        // In the table before the registry, so shutdown never lists a job
        // it cannot signal.
        shared.processes.insert(id, child);
        if let Err(e) = shared.registry.register(id, transport.clone()) {
            if let Some(child) = shared.processes.take(id) {
                let _ = reap(child, Duration::ZERO);
            }
            return Err(e);
        }

        if let Err(e) = receiver::spawn(self.shared.clone(), id, transport.clone()) {
            shared.registry.unregister(id);
            let _ = transport.shutdown();
            if let Some(child) = shared.processes.take(id) {
                let _ = reap(child, Duration::ZERO);
            }
            return Err(e.into());
        }

        info!("Job channel {} started: `{}` (pid {})", id, command, pid);
        Ok(id)
    }

    /// Send a notification to a job's stdin. Returns whether it was written.
    ///
    /// Unknown, closed and non-job channels are ignored.
    pub fn notify(&self, channel: ChannelId, event: &str, args: Vec<Value>) -> bool {
        let registry = &self.shared.registry;
        if registry.kind(channel) != Some(ChannelKind::Process) {
            debug!("Dropping notification `{}` for channel {}", event, channel);
            return false;
        }
        let Some(transport) = registry.get(channel) else {
            return false;
        };

        let frame = match encode_message(Message::notification(event, args)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode notification `{}`: {}", event, e);
                return false;
            }
        };
        match transport.write(&frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to notify channel {}: {}", channel, e);
                false
            }
        }
    }

    /// Whether the job on `channel` has not been reaped yet.
    pub fn is_running(&self, channel: ChannelId) -> bool {
        self.shared.processes.contains(channel)
    }

    /// Number of jobs not yet reaped.
    pub fn running(&self) -> usize {
        self.shared.processes.len()
    }
}
