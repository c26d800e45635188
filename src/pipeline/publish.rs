//! A pool of workers fed over PUB/SUB, each filtering on its own id.
//!
//! A SUB socket that connects after a message was published never sees it.
//! Each new worker is therefore sent START beacons until it proves it is
//! listening by making a synchronization request; only then is its work
//! published.

use super::pull::PullPipelineManager;
use super::sink::{SinkDecoder, SinkEndpoint, SinkEvent};
use crate::config::{PipelineConfig, WorkerLogging};
use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, Content, WorkerId, encode_payload};
use crate::ipc::socket;
use crate::process::{TerminationSummary, WorkerCommand, WorkerLauncher, WorkerProgram};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Command line of a pipeline worker:
/// `--receive --send --controller --syncclient --filter`.
pub struct PipelineLauncher {
    name: String,
    program: WorkerProgram,
    receive_port: u16,
    send_port: u16,
    controller_port: u16,
    sync_port: u16,
    logging: WorkerLogging,
}

impl WorkerLauncher for PipelineLauncher {
    fn process_name(&self) -> &str {
        &self.name
    }

    fn command_line(&self, worker_id: WorkerId) -> WorkerCommand {
        let command = self
            .program
            .command()
            .opt("--receive", self.receive_port)
            .opt("--send", self.send_port)
            .opt("--controller", self.controller_port)
            .opt("--syncclient", self.sync_port)
            .opt("--filter", worker_id);
        self.logging.append_to(command)
    }
}

/// Manager of a pool of identical, individually addressed workers.
pub struct PublishPullPipelineManager {
    pipeline: PullPipelineManager<PipelineLauncher>,
    work: zmq::Socket,
    control: zmq::Socket,
    sync: zmq::Socket,
    beacon_interval: Duration,
    sync_timeout: Duration,
    _context: zmq::Context,
}

impl PublishPullPipelineManager {
    pub fn new<D: SinkDecoder>(
        name: &str,
        program: WorkerProgram,
        config: &PipelineConfig,
        decoder: D,
        events: Sender<SinkEvent<D::Output>>,
    ) -> Result<Self> {
        let context = zmq::Context::new();
        let endpoint = SinkEndpoint::bind(&context)?;
        let (work, receive_port) = socket::bind_socket(&context, zmq::PUB)?;
        let (control, controller_port) = socket::bind_socket(&context, zmq::PUB)?;
        let (sync, sync_port) = socket::bind_socket(&context, zmq::REP)?;
        let launcher = PipelineLauncher {
            name: name.to_string(),
            program,
            receive_port,
            send_port: endpoint.port(),
            controller_port,
            sync_port,
            logging: config.logging,
        };
        let pipeline = PullPipelineManager::start(
            endpoint,
            launcher,
            config.terminate_timeout,
            decoder,
            events,
        )?;
        Ok(Self {
            pipeline,
            work,
            control,
            sync,
            beacon_interval: config.beacon_interval,
            sync_timeout: config.sync_timeout,
            _context: context,
        })
    }

    /// Spawn worker `worker_id`, synchronize with it and publish its work.
    pub fn start_worker<T: Serialize + ?Sized>(
        &mut self,
        worker_id: WorkerId,
        arguments: &T,
    ) -> Result<()> {
        let payload = encode_payload(arguments)?;
        self.pipeline.processes().add_worker(worker_id);

        if let Err(e) = self.synchronize(worker_id) {
            // Whatever is left of the worker is reaped when the record drops.
            self.pipeline.processes().registry().lock().remove(worker_id);
            return Err(e);
        }

        self.work.send_multipart(
            protocol::addressed(worker_id, Content::Data(payload)),
            0,
        )?;
        tracing::debug!(
            process = self.pipeline.processes().process_name(),
            worker_id = %worker_id,
            "Work sent"
        );
        Ok(())
    }

    /// Beacon START until `worker_id` makes its synchronization request.
    fn synchronize(&self, worker_id: WorkerId) -> Result<()> {
        let start = Instant::now();
        let timeout_ms = self.beacon_interval.as_millis().max(1) as i64;
        loop {
            self.work.send_multipart(
                protocol::addressed(worker_id, Content::Command(Command::Start)),
                0,
            )?;

            if self.sync.poll(zmq::POLLIN, timeout_ms)? > 0 {
                let request = socket::recv_bytes(&self.sync)?;
                self.sync.send(&b""[..], 0)?;
                match WorkerId::from_filter(&request) {
                    Ok(id) if id == worker_id => {
                        tracing::debug!(worker_id = %worker_id, elapsed = ?start.elapsed(), "Worker synchronized");
                        return Ok(());
                    }
                    _ => {
                        tracing::warn!(
                            expected = %worker_id,
                            request = %String::from_utf8_lossy(&request),
                            "Ignoring synchronization request from another worker"
                        );
                    }
                }
            }

            if !self.pipeline.processes().process_alive(worker_id) {
                return Err(PipeError::WorkerDied(worker_id));
            }
            let waited = start.elapsed();
            if waited >= self.sync_timeout {
                return Err(PipeError::SyncTimeout { worker_id, waited });
            }
        }
    }

    /// Stop every worker. Workers that already died are dropped from the
    /// pool; if none is left running, the sink is stopped directly.
    pub fn stop(&mut self) -> Result<()> {
        self.pipeline.set_terminating();
        let alive = self.pipeline.remove_exited_workers();
        if alive.is_empty() {
            tracing::debug!(
                process = self.pipeline.processes().process_name(),
                "No workers running, terminating sink"
            );
            self.pipeline.terminate_sink()?;
            return Ok(());
        }
        for worker_id in alive {
            self.send_stop(worker_id)?;
        }
        Ok(())
    }

    /// Stop one worker. A worker that already died is dropped from the pool
    /// instead.
    pub fn stop_worker(&mut self, worker_id: WorkerId) -> Result<()> {
        if !self.contains(worker_id) {
            return Err(PipeError::UnknownWorker(worker_id));
        }
        let alive = self.pipeline.remove_exited_workers();
        if !alive.contains(&worker_id) {
            if alive.is_empty() && self.pipeline.is_terminating() {
                self.pipeline.terminate_sink()?;
            }
            return Ok(());
        }
        self.send_stop(worker_id)
    }

    /// Stop goes out on both channels: a worker still in its handshake only
    /// listens on the work channel.
    fn send_stop(&self, worker_id: WorkerId) -> Result<()> {
        tracing::debug!(worker_id = %worker_id, "Sending STOP");
        self.control
            .send_multipart(protocol::control(worker_id, Command::Stop), 0)?;
        self.work.send_multipart(
            protocol::addressed(worker_id, Content::Command(Command::Stop)),
            0,
        )?;
        Ok(())
    }

    /// Pause every worker.
    pub fn pause(&self) -> Result<()> {
        for worker_id in self.pipeline.workers() {
            self.control
                .send_multipart(protocol::control(worker_id, Command::Pause), 0)?;
        }
        Ok(())
    }

    /// Resume one worker, or every worker when `worker_id` is `None`.
    pub fn resume(&self, worker_id: Option<WorkerId>) -> Result<()> {
        let targets = match worker_id {
            Some(id) => vec![id],
            None => self.pipeline.workers(),
        };
        for worker_id in targets {
            self.control
                .send_multipart(protocol::control(worker_id, Command::Resume), 0)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pipeline.processes().registry().lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.pipeline.processes().registry().lock().contains(worker_id)
    }

    pub fn forcefully_terminate(&mut self) -> Result<TerminationSummary> {
        self.pipeline.forcefully_terminate()
    }

    pub fn pipeline(&self) -> &PullPipelineManager<PipelineLauncher> {
        &self.pipeline
    }

    /// Block until the sink thread exits.
    pub fn join_sink(&mut self) -> Result<()> {
        self.pipeline.join_sink()
    }
}
