//! Tunables for pipeline and load balancer managers.
//!
//! Every manager is built from one of these structs; nothing is kept in
//! module-level state. Defaults can be overridden from the environment:
//!
//! - `WORKERPIPE_TERMINATE_TIMEOUT_MS` - SIGTERM grace period before SIGKILL
//! - `WORKERPIPE_SYNC_TIMEOUT_MS` - how long a worker may take to synchronize

use crate::logging;
use crate::process::{DEFAULT_TERMINATE_TIMEOUT, WorkerCommand};
use std::time::Duration;

/// Default delay between START beacons.
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound on the startup synchronization of a pipeline worker.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the broker handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the broker waits for STOPPED acknowledgements.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the broker waits for acknowledged workers to exit.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Logging arguments forwarded to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLogging {
    /// Info port of the log collector, when log forwarding is enabled.
    pub log_port: Option<u16>,
    /// Numeric verbosity, 0 (error) to 4 (trace).
    pub verbosity: u8,
}

impl Default for WorkerLogging {
    fn default() -> Self {
        Self {
            log_port: None,
            verbosity: logging::DEFAULT_VERBOSITY,
        }
    }
}

impl WorkerLogging {
    /// Workers log at the level the current process was configured with.
    pub fn inherit(log_port: Option<u16>) -> Self {
        Self {
            log_port,
            verbosity: logging::current_verbosity(),
        }
    }

    /// Append `--log-level` and, if set, `--log-port`.
    pub fn append_to(&self, command: WorkerCommand) -> WorkerCommand {
        let command = command.opt("--log-level", self.verbosity);
        match self.log_port {
            Some(port) => command.opt("--log-port", port),
            None => command,
        }
    }
}

/// Configuration shared by the pull-pipeline managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout: Duration,
    /// Delay between START beacons while a worker synchronizes.
    pub beacon_interval: Duration,
    /// Bound on the startup synchronization of one worker.
    pub sync_timeout: Duration,
    pub logging: WorkerLogging,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            logging: WorkerLogging::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn with_beacon_interval(mut self, interval: Duration) -> Self {
        self.beacon_interval = interval;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_logging(mut self, logging: WorkerLogging) -> Self {
        self.logging = logging;
        self
    }

    /// Apply `WORKERPIPE_TERMINATE_TIMEOUT_MS` and `WORKERPIPE_SYNC_TIMEOUT_MS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(timeout) = env_millis("WORKERPIPE_TERMINATE_TIMEOUT_MS") {
            self.terminate_timeout = timeout;
        }
        if let Some(timeout) = env_millis("WORKERPIPE_SYNC_TIMEOUT_MS") {
            self.sync_timeout = timeout;
        }
        self
    }
}

/// Configuration of a load balanced worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerConfig {
    /// Number of workers the broker starts.
    pub worker_count: usize,
    /// Bound on the manager/broker handshake.
    pub handshake_timeout: Duration,
    /// Bound on collecting STOPPED acknowledgements.
    pub stop_timeout: Duration,
    /// Bound on waiting for acknowledged workers to exit.
    pub exit_grace: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout: Duration,
    pub logging: WorkerLogging,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            exit_grace: DEFAULT_EXIT_GRACE,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            logging: WorkerLogging::default(),
        }
    }
}

impl BalancerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_logging(mut self, logging: WorkerLogging) -> Self {
        self.logging = logging;
        self
    }

    /// Apply `WORKERPIPE_TERMINATE_TIMEOUT_MS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(timeout) = env_millis("WORKERPIPE_TERMINATE_TIMEOUT_MS") {
            self.terminate_timeout = timeout;
        }
        self
    }
}

/// Half the available CPUs, clamped to 1..=8.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cpus / 2).clamp(1, 8)
}

fn env_millis(name: &str) -> Option<Duration> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "Ignoring invalid millisecond value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.terminate_timeout, Duration::from_secs(2));
        assert_eq!(config.beacon_interval, Duration::from_millis(10));
        assert_eq!(config.logging.log_port, None);
    }

    #[test]
    fn test_pipeline_builder() {
        let config = PipelineConfig::new()
            .with_sync_timeout(Duration::from_secs(1))
            .with_beacon_interval(Duration::from_millis(5))
            .with_logging(WorkerLogging {
                log_port: Some(4000),
                verbosity: 3,
            });
        assert_eq!(config.sync_timeout, Duration::from_secs(1));
        assert_eq!(config.beacon_interval, Duration::from_millis(5));
        assert_eq!(config.logging.log_port, Some(4000));
    }

    #[test]
    fn test_default_worker_count_bounds() {
        let count = default_worker_count();
        assert!((1..=8).contains(&count));
        assert!((1..=8).contains(&BalancerConfig::default().worker_count));
    }

    #[test]
    fn test_worker_logging_arguments() {
        let command = WorkerLogging {
            log_port: Some(5555),
            verbosity: 2,
        }
        .append_to(WorkerCommand::new("worker"));
        assert_eq!(command.display(), "worker --log-level 2 --log-port 5555");

        let command = WorkerLogging {
            log_port: None,
            verbosity: 0,
        }
        .append_to(WorkerCommand::new("worker"));
        assert_eq!(command.display(), "worker --log-level 0");
    }
}
