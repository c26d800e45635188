//! Spawning and teardown of worker processes.
//!
//! `ProcessManager` is the only component that touches OS process handles.
//! What command line a worker gets is decided by a [`WorkerLauncher`], one
//! per manager flavor.

use super::proc::ProcessRecord;
use super::registry::SharedRegistry;
use crate::error::{PipeError, Result};
use crate::ipc::WorkerId;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Default bound on how long `forcefully_terminate` waits after SIGTERM.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A fully built worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `--name value`.
    pub fn opt(self, name: &str, value: impl ToString) -> Self {
        self.arg(name).arg(value.to_string())
    }

    /// The command line as one string, for diagnostics.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy())
            .chain(self.args.iter().map(|a| a.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The program that hosts a worker flavor, plus any leading arguments
/// (for example a subcommand selecting the worker mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProgram {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerProgram {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The currently running executable, re-invoked in worker mode.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Start a command line from this program.
    pub fn command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.program.clone(),
            args: self.args.clone(),
        }
    }
}

/// Builds the command line for one worker flavor.
pub trait WorkerLauncher {
    /// Descriptive name used in log messages.
    fn process_name(&self) -> &str;

    /// Command line that starts worker `worker_id`.
    fn command_line(&self, worker_id: WorkerId) -> WorkerCommand;
}

/// Counts reported by [`ProcessManager::forcefully_terminate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationSummary {
    /// Processes sent SIGTERM.
    pub terminated: usize,
    /// Processes that had to be sent SIGKILL.
    pub killed: usize,
}

/// Spawns workers and owns their process records.
pub struct ProcessManager<L> {
    launcher: L,
    registry: SharedRegistry,
    terminate_timeout: Duration,
}

impl<L: WorkerLauncher> ProcessManager<L> {
    pub fn new(launcher: L, terminate_timeout: Duration) -> Self {
        Self {
            launcher,
            registry: SharedRegistry::new(),
            terminate_timeout,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn process_name(&self) -> &str {
        self.launcher.process_name()
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Spawn worker `worker_id` and record it.
    pub fn try_add_worker(&self, worker_id: WorkerId) -> Result<Pid> {
        if self.registry.lock().contains(worker_id) {
            return Err(PipeError::Protocol(format!(
                "{} worker {} is already running",
                self.process_name(),
                worker_id
            )));
        }

        let command = self.launcher.command_line(worker_id);
        let child = spawn_child(&command).map_err(|source| PipeError::Spawn {
            command: command.display(),
            source,
        })?;

        let record = ProcessRecord::from_child(worker_id, child);
        let pid = record.pid();
        tracing::debug!(
            process = self.process_name(),
            worker_id = %worker_id,
            pid = %pid,
            command = %command.display(),
            "Started worker"
        );
        self.registry.lock().insert(record);
        Ok(pid)
    }

    /// Spawn worker `worker_id`, exiting the application if that fails.
    ///
    /// A worker that cannot be started means a broken installation, which
    /// no caller can recover from.
    pub fn add_worker(&self, worker_id: WorkerId) -> Pid {
        match self.try_add_worker(worker_id) {
            Ok(pid) => pid,
            Err(e) => {
                report_spawn_failure(&e);
                std::process::exit(1);
            }
        }
    }

    /// Whether the recorded process for `worker_id` is verifiably alive.
    pub fn process_alive(&self, worker_id: WorkerId) -> bool {
        self.registry.lock().process_alive(worker_id)
    }

    /// Snapshot of live worker ids, in the order they were added.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.registry.lock().workers().to_vec()
    }

    /// Wait, bounded, until none of `worker_ids` is running.
    ///
    /// Returns true if all of them exited in time.
    pub fn wait_for_exit(&self, worker_ids: &[WorkerId], timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            let any_alive = {
                let mut registry = self.registry.lock();
                worker_ids.iter().any(|id| registry.process_alive(*id))
            };
            if !any_alive {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Terminate every recorded process without relying on its cooperation.
    ///
    /// Sends SIGTERM to every live process, waits up to the terminate
    /// timeout, then SIGKILLs whatever is left. All records are removed.
    pub fn forcefully_terminate(&self) -> TerminationSummary {
        let records = self.registry.lock().drain();
        let mut summary = TerminationSummary::default();
        let mut pending = Vec::with_capacity(records.len());

        for mut record in records {
            if !record.is_running() {
                continue;
            }
            tracing::debug!(
                process = self.process_name(),
                worker_id = %record.worker_id(),
                pid = %record.pid(),
                "Terminating worker process"
            );
            if let Err(e) = record.terminate() {
                tracing::error!(pid = %record.pid(), error = %e, "Terminating process failed");
            }
            summary.terminated += 1;
            pending.push(record);
        }

        let deadline = Instant::now() + self.terminate_timeout;
        while !pending.is_empty() && Instant::now() < deadline {
            pending.retain_mut(|record| record.is_running());
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        for mut record in pending {
            if !record.is_running() {
                continue;
            }
            tracing::warn!(
                process = self.process_name(),
                worker_id = %record.worker_id(),
                pid = %record.pid(),
                "Killing worker that ignored SIGTERM"
            );
            if let Err(e) = record.kill() {
                tracing::error!(pid = %record.pid(), error = %e, "Failed to kill process");
            }
            summary.killed += 1;
        }
        summary
    }
}

/// Start a worker as a child of this process.
///
/// On Linux the child is asked to receive SIGTERM when its parent dies, so
/// a crashed application does not leave orphaned workers running.
fn spawn_child(command: &WorkerCommand) -> io::Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;
        // Safety: the closure only issues a prctl syscall, which is
        // async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)
                    .map_err(io::Error::from)
            });
        }
    }

    cmd.spawn()
}

fn report_spawn_failure(error: &PipeError) {
    tracing::error!("{}", error);
    if let PipeError::Spawn { command, source } = error
        && source.raw_os_error() == Some(Errno::ENOEXEC as i32)
    {
        tracing::error!(
            "Interpreter line of the worker program might be malformed or missing: {}",
            command
        );
    }
}
