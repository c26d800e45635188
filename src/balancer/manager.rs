//! Application-side control of a load balancer broker process.

use crate::config::{BalancerConfig, WorkerLogging};
use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, Content, WorkerId, encode_payload};
use crate::ipc::socket::{self, SendOutcome};
use crate::process::{
    ProcessManager, TerminationSummary, WorkerCommand, WorkerLauncher, WorkerProgram,
};
use serde::Serialize;
use std::time::Duration;

/// The broker is the only process this manager starts.
const BROKER_ID: WorkerId = WorkerId::new(0);

/// Command line of a broker: `--receive --send --controller`.
pub struct BrokerLauncher {
    name: String,
    program: WorkerProgram,
    receive_port: u16,
    send_port: u16,
    controller_port: u16,
    logging: WorkerLogging,
}

impl WorkerLauncher for BrokerLauncher {
    fn process_name(&self) -> &str {
        &self.name
    }

    fn command_line(&self, _worker_id: WorkerId) -> WorkerCommand {
        let command = self
            .program
            .command()
            .opt("--receive", self.receive_port)
            .opt("--send", self.send_port)
            .opt("--controller", self.controller_port);
        self.logging.append_to(command)
    }
}

/// Starts and stops a load balancer broker.
pub struct LoadBalancerManager {
    processes: ProcessManager<BrokerLauncher>,
    controller: zmq::Socket,
    requester: zmq::Socket,
    worker_count: usize,
    handshake_timeout: Duration,
    frontend_port: Option<u16>,
    context: zmq::Context,
}

impl LoadBalancerManager {
    /// Bind the controller and requester. Workers of the pool will report
    /// results to the sink listening on `sink_port`.
    pub fn new(
        name: &str,
        program: WorkerProgram,
        sink_port: u16,
        config: &BalancerConfig,
    ) -> Result<Self> {
        let context = zmq::Context::new();
        let (controller, controller_port) = socket::bind_socket(&context, zmq::PUSH)?;
        let (requester, receive_port) = socket::bind_socket(&context, zmq::REQ)?;
        let launcher = BrokerLauncher {
            name: name.to_string(),
            program,
            receive_port,
            send_port: sink_port,
            controller_port,
            logging: config.logging,
        };
        Ok(Self {
            processes: ProcessManager::new(launcher, config.terminate_timeout),
            controller,
            requester,
            worker_count: config.worker_count,
            handshake_timeout: config.handshake_timeout,
            frontend_port: None,
            context,
        })
    }

    /// Spawn the broker, tell it how many workers to run and learn the port
    /// requests must be sent to.
    pub fn start_load_balancer(&mut self) -> Result<u16> {
        if let Some(port) = self.frontend_port {
            return Ok(port);
        }
        self.processes.add_worker(BROKER_ID);

        let timeout_ms = self.handshake_timeout.as_millis() as i32;
        self.requester.set_sndtimeo(timeout_ms)?;
        self.requester.set_rcvtimeo(timeout_ms)?;
        let reply = self
            .requester
            .send(self.worker_count.to_string().as_bytes(), 0)
            .and_then(|()| self.requester.recv_bytes(0));
        let reply = match reply {
            Ok(reply) => reply,
            Err(zmq::Error::EAGAIN) => {
                return Err(PipeError::Handshake(format!(
                    "{} did not answer within {:?}",
                    self.processes.process_name(),
                    self.handshake_timeout
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let port = std::str::from_utf8(&reply)
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                PipeError::Handshake(format!(
                    "invalid frontend port {:?}",
                    String::from_utf8_lossy(&reply)
                ))
            })?;

        tracing::debug!(
            process = self.processes.process_name(),
            workers = self.worker_count,
            frontend_port = port,
            "Load balancer ready"
        );
        self.frontend_port = Some(port);
        Ok(port)
    }

    pub fn frontend_port(&self) -> Option<u16> {
        self.frontend_port
    }

    /// Connect a sender of requests to the broker's frontend.
    pub fn requests(&self) -> Result<RequestSender> {
        let port = self
            .frontend_port
            .ok_or_else(|| PipeError::Handshake("load balancer not started".into()))?;
        Ok(RequestSender {
            socket: socket::connect_socket(&self.context, zmq::PUSH, port)?,
        })
    }

    /// Tell the broker to stop its workers and exit.
    pub fn stop(&mut self) -> Result<()> {
        if !self.processes.process_alive(BROKER_ID) {
            tracing::debug!(
                process = self.processes.process_name(),
                "Load balancer is not running"
            );
            return Ok(());
        }
        if socket::try_send_multipart(&self.controller, vec![Command::Stop.as_bytes().to_vec()])?
            == SendOutcome::WouldBlock
        {
            tracing::warn!(
                process = self.processes.process_name(),
                "Load balancer unreachable, terminating it"
            );
            self.processes.forcefully_terminate();
        }
        Ok(())
    }

    /// Wait for the broker to exit after [`stop`](Self::stop).
    pub fn wait(&self, timeout: Duration) -> bool {
        self.processes.wait_for_exit(&[BROKER_ID], timeout)
    }

    pub fn is_running(&self) -> bool {
        self.processes.process_alive(BROKER_ID)
    }

    pub fn forcefully_terminate(&self) -> TerminationSummary {
        self.processes.forcefully_terminate()
    }
}

/// Pushes requests to a load balancer frontend.
pub struct RequestSender {
    socket: zmq::Socket,
}

impl RequestSender {
    pub fn send_request<T: Serialize + ?Sized>(&self, request: &T) -> Result<()> {
        let payload = encode_payload(request)?;
        self.socket
            .send_multipart(protocol::unaddressed(Content::Data(payload)), 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_command_line() {
        let launcher = BrokerLauncher {
            name: "Probe load balancer".into(),
            program: WorkerProgram::new("/bin/workerpipe")
                .with_args(["internal", "balancer", "--job", "probe"]),
            receive_port: 1,
            send_port: 2,
            controller_port: 3,
            logging: WorkerLogging {
                log_port: Some(4),
                verbosity: 2,
            },
        };
        assert_eq!(
            launcher.command_line(BROKER_ID).display(),
            "/bin/workerpipe internal balancer --job probe --receive 1 --send 2 --controller 3 \
             --log-level 2 --log-port 4"
        );
    }

    #[test]
    fn test_handshake_timeout() {
        let config = BalancerConfig::default()
            .with_worker_count(1)
            .with_handshake_timeout(Duration::from_millis(200));
        let mut manager = LoadBalancerManager::new(
            "Mute",
            WorkerProgram::new("sh").with_args(["-c", "sleep 30"]),
            1,
            &config,
        )
        .unwrap();
        assert!(matches!(
            manager.start_load_balancer(),
            Err(PipeError::Handshake(_))
        ));
        assert!(manager.requests().is_err());
        manager.forcefully_terminate();
        assert!(!manager.is_running());
    }
}
