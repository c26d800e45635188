//! Base of the managers whose workers report to a sink.

use super::sink::{SinkDecoder, SinkEndpoint, SinkEvent, SinkHandle, Terminating};
use crate::error::Result;
use crate::ipc::WorkerId;
use crate::process::{ProcessManager, TerminationSummary, WorkerLauncher};
use crossbeam_channel::Sender;
use std::time::Duration;

/// Worker processes plus the sink that collects their results.
pub struct PullPipelineManager<L: WorkerLauncher> {
    processes: ProcessManager<L>,
    sink: SinkHandle,
    terminating: Terminating,
}

impl<L: WorkerLauncher> PullPipelineManager<L> {
    /// Start the sink thread for `endpoint` and take ownership of the
    /// workers `launcher` will create.
    pub fn start<D: SinkDecoder>(
        endpoint: SinkEndpoint,
        launcher: L,
        terminate_timeout: Duration,
        decoder: D,
        events: Sender<SinkEvent<D::Output>>,
    ) -> Result<Self> {
        let processes = ProcessManager::new(launcher, terminate_timeout);
        let terminating = Terminating::default();
        let sink = endpoint.spawn(
            &sink_name(processes.process_name()),
            processes.registry().clone(),
            terminating.clone(),
            decoder,
            events,
        )?;
        Ok(Self {
            processes,
            sink,
            terminating,
        })
    }

    pub fn processes(&self) -> &ProcessManager<L> {
        &self.processes
    }

    pub fn receive_port(&self) -> u16 {
        self.sink.port()
    }

    /// Mark the manager as shutting down. The sink exits once the last
    /// worker signs off.
    pub fn set_terminating(&self) {
        self.terminating.set();
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.get()
    }

    /// Make the sink exit without waiting for any worker.
    pub fn terminate_sink(&mut self) -> Result<bool> {
        tracing::debug!(process = self.processes.process_name(), "Terminating sink");
        self.sink.terminate()
    }

    pub fn sink_finished(&self) -> bool {
        self.sink.is_finished()
    }

    /// Block until the sink thread exits.
    pub fn join_sink(&mut self) -> Result<()> {
        self.sink.join()
    }

    /// Forget workers whose process exited without signing off and return
    /// the ids of those still running.
    pub fn remove_exited_workers(&self) -> Vec<WorkerId> {
        let (exited, running) = {
            let mut registry = self.processes.registry().lock();
            let exited = registry.remove_exited();
            (exited, registry.workers().to_vec())
        };
        for record in &exited {
            tracing::warn!(
                process = self.processes.process_name(),
                worker_id = %record.worker_id(),
                reason = ?record.exit_reason(),
                "Worker exited without signing off"
            );
        }
        running
    }

    /// Live worker ids, in the order they were started.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.processes.workers()
    }

    /// Kill every worker and the sink.
    pub fn forcefully_terminate(&mut self) -> Result<TerminationSummary> {
        self.set_terminating();
        let summary = self.processes.forcefully_terminate();
        self.terminate_sink()?;
        Ok(summary)
    }
}

impl<L: WorkerLauncher> Drop for PullPipelineManager<L> {
    fn drop(&mut self) {
        if self.sink.is_finished() && self.processes.registry().lock().is_empty() {
            return;
        }
        match self.forcefully_terminate() {
            Ok(_) => {
                if let Err(e) = self.sink.join() {
                    tracing::debug!(error = %e, "Sink ended with error during drop");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to shut down pipeline"),
        }
    }
}

fn sink_name(process_name: &str) -> String {
    process_name
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_name() {
        assert_eq!(sink_name("Scan"), "scan");
        assert_eq!(sink_name("Thumbnail Extractor"), "thumbnail-extractor");
    }
}
