//! Process handle for a spawned worker.
//!
//! Wraps the `std::process::Child` together with the kernel start time of
//! the process, so a liveness check can tell the original worker apart
//! from an unrelated process that was later given the same PID.

use super::signals::{TerminationReason, analyze_exit_status};
use crate::error::Result;
use crate::ipc::WorkerId;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Child;
use std::time::{Duration, Instant, SystemTime};

/// Polling interval while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a dropped record waits for a cooperative exit before signalling.
const DROP_GRACE: Duration = Duration::from_millis(200);

/// A worker process owned by exactly one manager.
pub struct ProcessRecord {
    worker_id: WorkerId,
    child: Child,
    pid: Pid,
    /// Kernel start time in clock ticks, when the platform exposes it.
    start_ticks: Option<u64>,
    spawned_at: SystemTime,
    /// Set once SIGTERM has been sent, so it is only ever sent once.
    termination_requested: bool,
    exit: Option<TerminationReason>,
}

impl ProcessRecord {
    /// Record a freshly spawned child.
    pub fn from_child(worker_id: WorkerId, child: Child) -> Self {
        let pid = Pid::from_raw(child.id() as i32);
        Self {
            worker_id,
            start_ticks: read_start_ticks(pid),
            child,
            pid,
            spawned_at: SystemTime::now(),
            termination_requested: false,
            exit: None,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn spawned_at(&self) -> SystemTime {
        self.spawned_at
    }

    /// Why the process ended, once it has been reaped.
    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.exit
    }

    /// True only if the recorded process is still running *and* the process
    /// currently holding its PID was started at the recorded time.
    pub fn is_running(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(analyze_exit_status(status));
                false
            }
            Ok(None) => self.identity_matches(),
            Err(e) => {
                tracing::debug!(worker_id = %self.worker_id, pid = %self.pid, error = %e, "try_wait failed");
                self.record_exit(TerminationReason::Unknown);
                false
            }
        }
    }

    fn identity_matches(&self) -> bool {
        match self.start_ticks {
            Some(expected) => read_start_ticks(self.pid) == Some(expected),
            None => true,
        }
    }

    fn record_exit(&mut self, reason: TerminationReason) {
        tracing::debug!(
            worker_id = %self.worker_id,
            pid = %self.pid,
            reason = %reason,
            "Worker process exited"
        );
        self.exit = Some(reason);
    }

    /// Send SIGTERM. Returns `false` if a termination request was already sent
    /// or the process is gone.
    pub fn terminate(&mut self) -> Result<bool> {
        if self.termination_requested || !self.is_running() {
            return Ok(false);
        }
        self.termination_requested = true;
        match signal::kill(self.pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Send SIGKILL and reap the process.
    pub fn kill(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        let status = self.child.wait()?;
        self.record_exit(analyze_exit_status(status));
        Ok(())
    }

    /// Wait up to `timeout` for the process to exit on its own.
    ///
    /// Returns true if it is no longer running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_running() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl Drop for ProcessRecord {
    fn drop(&mut self) {
        if self.wait_timeout(DROP_GRACE) {
            return;
        }
        let _ = self.terminate();
        if self.wait_timeout(Duration::from_millis(100)) {
            return;
        }
        let _ = self.kill();
    }
}

/// Read the start time (field 22 of `/proc/<pid>/stat`) of a process.
///
/// The command name in field 2 may itself contain spaces and parentheses,
/// so fields are counted from the last `)`.
#[cfg(target_os = "linux")]
pub fn read_start_ticks(pid: Pid) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_start_ticks(&contents)
}

#[cfg(not(target_os = "linux"))]
pub fn read_start_ticks(_pid: Pid) -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // Fields after the command name start at field 3 (state).
    after_comm.split_whitespace().nth(22 - 3)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sleep(seconds: &str) -> ProcessRecord {
        let child = Command::new("sleep")
            .arg(seconds)
            .stdin(Stdio::null())
            .spawn()
            .expect("Failed to spawn sleep");
        ProcessRecord::from_child(WorkerId::new(1), child)
    }

    #[test]
    fn test_parse_start_ticks() {
        let stat = "4242 (tricky) name) S 1 4242 4242 0 -1 4194560 100 0 0 0 \
                    1 2 0 0 20 0 1 0 987654 1000 10";
        assert_eq!(parse_start_ticks(stat), Some(987654));
        assert_eq!(parse_start_ticks("garbage"), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_read_own_start_ticks() {
        let pid = Pid::from_raw(std::process::id() as i32);
        assert!(read_start_ticks(pid).is_some());
    }

    #[test]
    fn test_running_then_terminated() {
        let mut record = spawn_sleep("60");
        assert!(record.is_running());

        assert!(record.terminate().unwrap());
        // A second request is not sent while the first is outstanding.
        assert!(!record.terminate().unwrap());

        assert!(record.wait_timeout(Duration::from_secs(2)));
        assert_eq!(
            record.exit_reason(),
            Some(TerminationReason::Signaled(Signal::SIGTERM))
        );
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_reused_pid_is_not_alive() {
        let mut record = spawn_sleep("60");
        assert!(record.is_running());

        // Pretend the PID now belongs to a process started at another time.
        record.start_ticks = record.start_ticks.map(|t| t + 1);
        assert!(!record.is_running());

        record.start_ticks = read_start_ticks(record.pid);
        record.kill().unwrap();
        assert!(!record.is_running());
    }

    #[test]
    fn test_exited_process_is_not_alive() {
        let child = Command::new("true").spawn().expect("Failed to spawn true");
        let mut record = ProcessRecord::from_child(WorkerId::new(2), child);
        assert!(record.wait_timeout(Duration::from_secs(2)));
        assert!(!record.is_running());
        assert_eq!(record.exit_reason(), Some(TerminationReason::Exited(0)));
    }
}
