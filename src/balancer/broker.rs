//! The load balancer broker, which runs in its own process.
//!
//! Requests arrive on a PULL frontend and are routed to the least recently
//! used idle worker through a ROUTER backend. Workers connect with REQ
//! sockets, so every request is answered by a READY that returns the worker
//! to the idle queue. Results bypass the broker and go straight to a sink.

use super::lru::{LruQueue, ReadyAction};
use crate::config::{DEFAULT_EXIT_GRACE, DEFAULT_STOP_TIMEOUT, WorkerLogging};
use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, WorkerId};
use crate::ipc::socket;
use crate::process::{
    DEFAULT_TERMINATE_TIMEOUT, ProcessManager, TerminationSummary, WorkerCommand, WorkerLauncher,
    WorkerProgram,
};
use std::time::{Duration, Instant};

const CMD: &[u8] = b"cmd";

/// Command line of a load balanced worker: `--request --send --identity`.
pub struct BalancedWorkerLauncher {
    worker_type: String,
    program: WorkerProgram,
    request_port: u16,
    send_port: u16,
    logging: WorkerLogging,
}

impl WorkerLauncher for BalancedWorkerLauncher {
    fn process_name(&self) -> &str {
        &self.worker_type
    }

    fn command_line(&self, worker_id: WorkerId) -> WorkerCommand {
        let command = self
            .program
            .command()
            .opt("--request", self.request_port)
            .opt("--send", self.send_port)
            .opt("--identity", worker_id);
        self.logging.append_to(command)
    }
}

/// What kind of worker the broker starts.
#[derive(Debug, Clone)]
pub struct BalancedWorkerSpec {
    /// Descriptive type, the prefix of every transport identity.
    pub worker_type: String,
    pub program: WorkerProgram,
    pub logging: WorkerLogging,
}

/// Ports handed to the broker on its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerPorts {
    /// The manager's requester, for the handshake.
    pub receive: u16,
    /// The sink workers report results to.
    pub send: u16,
    /// The manager's controller, for STOP.
    pub controller: u16,
}

/// Broker timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerTimeouts {
    /// Bound on collecting STOPPED acknowledgements.
    pub stop: Duration,
    /// Bound on waiting for acknowledged workers to exit.
    pub exit_grace: Duration,
    /// SIGTERM grace period when forcefully terminating.
    pub terminate: Duration,
}

impl Default for BrokerTimeouts {
    fn default() -> Self {
        Self {
            stop: DEFAULT_STOP_TIMEOUT,
            exit_grace: DEFAULT_EXIT_GRACE,
            terminate: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

/// The broker's pool of worker processes.
pub struct LoadBalancerWorkerManager {
    processes: ProcessManager<BalancedWorkerLauncher>,
}

impl LoadBalancerWorkerManager {
    pub fn new(launcher: BalancedWorkerLauncher, terminate_timeout: Duration) -> Self {
        Self {
            processes: ProcessManager::new(launcher, terminate_timeout),
        }
    }

    /// Start workers `1..=count`.
    pub fn start_workers(&self, count: usize) {
        for n in 1..=count {
            self.processes.add_worker(WorkerId::new(n as u32));
        }
    }

    pub fn wait_for_exit(&self, worker_ids: &[WorkerId], timeout: Duration) -> bool {
        self.processes.wait_for_exit(worker_ids, timeout)
    }

    pub fn forcefully_terminate(&self) -> TerminationSummary {
        self.processes.forcefully_terminate()
    }

    pub fn process_name(&self) -> &str {
        self.processes.process_name()
    }
}

/// The broker process state.
pub struct LoadBalancer {
    frontend: zmq::Socket,
    backend: zmq::Socket,
    reply: zmq::Socket,
    controller: zmq::Socket,
    frontend_port: u16,
    workers: LoadBalancerWorkerManager,
    timeouts: BrokerTimeouts,
    _context: zmq::Context,
}

impl LoadBalancer {
    /// Bind the frontend and backend and connect to the manager.
    pub fn connect(
        ports: BrokerPorts,
        worker: BalancedWorkerSpec,
        timeouts: BrokerTimeouts,
    ) -> Result<Self> {
        let context = zmq::Context::new();
        let (frontend, frontend_port) = socket::bind_socket(&context, zmq::PULL)?;
        let (backend, backend_port) = socket::bind_socket(&context, zmq::ROUTER)?;
        let reply = socket::connect_socket(&context, zmq::REP, ports.receive)?;
        let controller = socket::connect_socket(&context, zmq::PULL, ports.controller)?;

        let launcher = BalancedWorkerLauncher {
            worker_type: worker.worker_type,
            program: worker.program,
            request_port: backend_port,
            send_port: ports.send,
            logging: worker.logging,
        };
        Ok(Self {
            frontend,
            backend,
            reply,
            controller,
            frontend_port,
            workers: LoadBalancerWorkerManager::new(launcher, timeouts.terminate),
            timeouts,
            _context: context,
        })
    }

    pub fn frontend_port(&self) -> u16 {
        self.frontend_port
    }

    /// Handshake with the manager, start the workers and route requests
    /// until told to stop. Workers still running afterwards are killed.
    pub fn run(self) -> Result<()> {
        let count = self.handshake()?;
        tracing::info!(
            workers = count,
            worker_type = self.workers.process_name(),
            frontend_port = self.frontend_port,
            "Load balancer starting"
        );
        self.workers.start_workers(count);
        let result = self.route(count);
        let summary = self.workers.forcefully_terminate();
        if summary.terminated > 0 {
            tracing::debug!(
                terminated = summary.terminated,
                killed = summary.killed,
                "Terminated remaining workers"
            );
        }
        result
    }

    /// Receive the worker count and reply with the frontend port.
    fn handshake(&self) -> Result<usize> {
        let request = socket::recv_bytes(&self.reply)?;
        let count = std::str::from_utf8(&request)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| {
                PipeError::Handshake(format!(
                    "invalid worker count {:?}",
                    String::from_utf8_lossy(&request)
                ))
            })?;
        self.reply
            .send(self.frontend_port.to_string().as_bytes(), 0)?;
        Ok(count)
    }

    fn route(&self, worker_count: usize) -> Result<()> {
        let mut queue = LruQueue::new();
        let mut stop_deadline: Option<Instant> = None;

        loop {
            let poll_frontend = queue.has_idle();
            let timeout_ms = match stop_deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        tracing::warn!(
                            stopped = queue.stopped_len(),
                            workers = worker_count,
                            "Timed out waiting for workers to stop"
                        );
                        return Ok(());
                    }
                    remaining.as_millis() as i64
                }
                None => -1,
            };

            let (backend_ready, controller_ready, frontend_ready) = {
                let mut items = vec![
                    self.backend.as_poll_item(zmq::POLLIN),
                    self.controller.as_poll_item(zmq::POLLIN),
                ];
                if poll_frontend {
                    items.push(self.frontend.as_poll_item(zmq::POLLIN));
                }
                match zmq::poll(&mut items, timeout_ms) {
                    Ok(_) => {}
                    Err(zmq::Error::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
                (
                    items[0].is_readable(),
                    items[1].is_readable(),
                    items.get(2).is_some_and(|item| item.is_readable()),
                )
            };

            if backend_ready {
                let frames = socket::recv_multipart(&self.backend)?;
                let (identity, command) = parse_backend(frames)?;
                match command {
                    Command::Ready => {
                        if queue.worker_ready(identity.clone()) == ReadyAction::SendStop {
                            self.send_stop(identity)?;
                        }
                    }
                    Command::Stopped => {
                        tracing::debug!(identity = %String::from_utf8_lossy(&identity), "Worker stopped");
                        queue.worker_stopped(identity);
                        if queue.is_terminating() && queue.stopped_len() >= worker_count {
                            self.await_stopped_exit(&queue);
                            return Ok(());
                        }
                    }
                    other => {
                        return Err(PipeError::Protocol(format!(
                            "unexpected {} from {} at broker",
                            other,
                            String::from_utf8_lossy(&identity)
                        )));
                    }
                }
            }

            if controller_ready {
                let token = socket::recv_bytes(&self.controller)?;
                if Command::parse(&token) == Some(Command::Stop) && !queue.is_terminating() {
                    tracing::debug!("Load balancer stopping");
                    for identity in queue.begin_termination() {
                        self.send_stop(identity)?;
                    }
                    if queue.stopped_len() >= worker_count {
                        return Ok(());
                    }
                    stop_deadline = Some(Instant::now() + self.timeouts.stop);
                }
            }

            if frontend_ready && let Some(identity) = queue.assign() {
                let request = socket::recv_multipart(&self.frontend)?;
                let mut frames = vec![identity, Vec::new()];
                frames.extend(request);
                self.backend.send_multipart(frames, 0)?;
            }
        }
    }

    fn send_stop(&self, identity: Vec<u8>) -> Result<()> {
        let frames = vec![
            identity,
            Vec::new(),
            CMD.to_vec(),
            Command::Stop.as_bytes().to_vec(),
        ];
        self.backend.send_multipart(frames, 0)?;
        Ok(())
    }

    fn await_stopped_exit(&self, queue: &LruQueue) {
        let ids: Vec<WorkerId> = queue
            .stopped()
            .filter_map(|identity| protocol::worker_id_from_identity(identity).ok())
            .collect();
        if !self.workers.wait_for_exit(&ids, self.timeouts.exit_grace) {
            tracing::debug!("Some stopped workers are still exiting");
        }
    }
}

/// Parse `[identity, "", TOKEN]` from a REQ worker.
fn parse_backend(frames: Vec<Vec<u8>>) -> Result<(Vec<u8>, Command)> {
    let [identity, empty, token]: [Vec<u8>; 3] = frames.try_into().map_err(|f: Vec<Vec<u8>>| {
        PipeError::Protocol(format!("expected 3 backend frames, got {}", f.len()))
    })?;
    if !empty.is_empty() {
        return Err(PipeError::Protocol("missing envelope delimiter".into()));
    }
    let command = Command::parse(&token).ok_or_else(|| {
        PipeError::Protocol(format!(
            "unknown token {:?} from {}",
            String::from_utf8_lossy(&token),
            String::from_utf8_lossy(&identity)
        ))
    })?;
    Ok((identity, command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        let (identity, command) =
            parse_backend(vec![b"Probe-1".to_vec(), Vec::new(), b"READY".to_vec()]).unwrap();
        assert_eq!(identity, b"Probe-1".to_vec());
        assert_eq!(command, Command::Ready);

        assert!(parse_backend(vec![b"Probe-1".to_vec(), b"READY".to_vec()]).is_err());
        assert!(
            parse_backend(vec![b"Probe-1".to_vec(), b"x".to_vec(), b"READY".to_vec()]).is_err()
        );
        assert!(
            parse_backend(vec![b"Probe-1".to_vec(), Vec::new(), b"HELLO".to_vec()]).is_err()
        );
    }

    #[test]
    fn test_launcher_command_line() {
        let launcher = BalancedWorkerLauncher {
            worker_type: "Probe".into(),
            program: WorkerProgram::new("/bin/workerpipe").with_args(["internal", "probe-worker"]),
            request_port: 10,
            send_port: 11,
            logging: WorkerLogging {
                log_port: None,
                verbosity: 2,
            },
        };
        assert_eq!(
            launcher.command_line(WorkerId::new(3)).display(),
            "/bin/workerpipe internal probe-worker --request 10 --send 11 --identity 3 --log-level 2"
        );
    }
}
