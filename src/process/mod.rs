//! Worker process lifecycle.
//!
//! - `manager`: spawning, liveness checks and forced teardown
//! - `registry`: the live-worker set shared with a sink thread
//! - `proc`: a single child process with PID-reuse protection
//! - `signals`: exit status analysis

pub mod manager;
pub mod proc;
pub mod registry;
pub mod signals;

pub use manager::{
    DEFAULT_TERMINATE_TIMEOUT, ProcessManager, TerminationSummary, WorkerCommand, WorkerLauncher,
    WorkerProgram,
};
pub use proc::ProcessRecord;
pub use registry::{SharedRegistry, WorkerRegistry};
pub use signals::TerminationReason;
