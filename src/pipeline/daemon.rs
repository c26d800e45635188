//! A single long-lived worker fed over PUSH/PULL.

use super::pull::PullPipelineManager;
use super::sink::{SinkDecoder, SinkEndpoint, SinkEvent};
use crate::config::{PipelineConfig, WorkerLogging};
use crate::error::Result;
use crate::ipc::protocol::{self, Command, Content, DAEMON_WORKER_ID, WorkerId, encode_payload};
use crate::ipc::socket::{self, SendOutcome};
use crate::process::{WorkerCommand, WorkerLauncher, WorkerProgram};
use crossbeam_channel::Sender;
use serde::Serialize;

/// Command line of a daemon: `--receive <port> --send <port>`.
pub struct DaemonLauncher {
    name: String,
    program: WorkerProgram,
    receive_port: u16,
    send_port: u16,
    logging: WorkerLogging,
}

impl WorkerLauncher for DaemonLauncher {
    fn process_name(&self) -> &str {
        &self.name
    }

    fn command_line(&self, _worker_id: WorkerId) -> WorkerCommand {
        let command = self
            .program
            .command()
            .opt("--receive", self.receive_port)
            .opt("--send", self.send_port);
        self.logging.append_to(command)
    }
}

/// Manager of one persistent daemon worker.
pub struct PushPullDaemonManager {
    pipeline: PullPipelineManager<DaemonLauncher>,
    ventilator: zmq::Socket,
    started: bool,
    _context: zmq::Context,
}

impl PushPullDaemonManager {
    /// Bind the sockets and start the sink. The daemon itself is spawned by
    /// [`start`](Self::start).
    pub fn new<D: SinkDecoder>(
        name: &str,
        program: WorkerProgram,
        config: &PipelineConfig,
        decoder: D,
        events: Sender<SinkEvent<D::Output>>,
    ) -> Result<Self> {
        let context = zmq::Context::new();
        let endpoint = SinkEndpoint::bind(&context)?;
        let (ventilator, receive_port) = socket::bind_socket(&context, zmq::PUSH)?;
        let launcher = DaemonLauncher {
            name: name.to_string(),
            program,
            receive_port,
            send_port: endpoint.port(),
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
            ventilator,
            started: false,
            _context: context,
        })
    }

    /// Spawn the daemon. Only the first call has any effect.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.pipeline.processes().add_worker(DAEMON_WORKER_ID);
    }

    /// Tell the daemon to begin work.
    pub fn send_start(&self) -> Result<()> {
        self.ventilator
            .send_multipart(protocol::unaddressed(Content::Command(Command::Start)), 0)?;
        Ok(())
    }

    /// Push one unit of work to the daemon.
    pub fn send_message_to_worker<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let payload = encode_payload(data)?;
        self.ventilator
            .send_multipart(protocol::unaddressed(Content::Data(payload)), 0)?;
        Ok(())
    }

    /// Stop the daemon, or the sink directly if the daemon cannot be told.
    pub fn stop(&mut self) -> Result<()> {
        self.pipeline.set_terminating();
        if !self.pipeline.remove_exited_workers().contains(&DAEMON_WORKER_ID) {
            tracing::debug!(
                process = self.pipeline.processes().process_name(),
                "Daemon is not running, terminating sink"
            );
            self.pipeline.terminate_sink()?;
            return Ok(());
        }
        let frames = protocol::unaddressed(Content::Command(Command::Stop));
        if socket::try_send_multipart(&self.ventilator, frames)? == SendOutcome::WouldBlock {
            tracing::debug!(
                process = self.pipeline.processes().process_name(),
                "Daemon unreachable, terminating sink"
            );
            self.pipeline.terminate_sink()?;
        }
        Ok(())
    }

    pub fn pipeline(&self) -> &PullPipelineManager<DaemonLauncher> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut PullPipelineManager<DaemonLauncher> {
        &mut self.pipeline
    }

    /// Block until the sink thread exits.
    pub fn join_sink(&mut self) -> Result<()> {
        self.pipeline.join_sink()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::JsonDecoder;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn crashing_daemon() -> WorkerProgram {
        // The launcher's arguments land in the positional parameters of `sh -c`.
        WorkerProgram::new("sh").with_args(["-c", "exit 3"])
    }

    #[test]
    fn test_launcher_command_line() {
        let launcher = DaemonLauncher {
            name: "Stat".into(),
            program: WorkerProgram::new("/bin/workerpipe").with_args(["internal", "stat-daemon"]),
            receive_port: 4001,
            send_port: 4002,
            logging: WorkerLogging {
                log_port: None,
                verbosity: 1,
            },
        };
        assert_eq!(
            launcher.command_line(DAEMON_WORKER_ID).display(),
            "/bin/workerpipe internal stat-daemon --receive 4001 --send 4002 --log-level 1"
        );
    }

    #[test]
    fn test_stop_after_daemon_crashed() {
        let (tx, rx) = unbounded::<SinkEvent<String>>();
        let mut manager = PushPullDaemonManager::new(
            "Crash",
            crashing_daemon(),
            &PipelineConfig::default(),
            JsonDecoder::new(),
            tx,
        )
        .unwrap();
        manager.start();
        assert!(
            manager
                .pipeline()
                .processes()
                .wait_for_exit(&[DAEMON_WORKER_ID], Duration::from_secs(5))
        );

        manager.stop().unwrap();
        manager.join_sink().unwrap();
        assert!(rx.try_recv().is_err());

        // A second stop does not send another KILL.
        manager.stop().unwrap();
        assert!(!manager.pipeline_mut().terminate_sink().unwrap());
    }

    #[test]
    fn test_stop_without_start() {
        let (tx, _rx) = unbounded::<SinkEvent<String>>();
        let mut manager = PushPullDaemonManager::new(
            "Idle",
            crashing_daemon(),
            &PipelineConfig::default(),
            JsonDecoder::new(),
            tx,
        )
        .unwrap();
        manager.stop().unwrap();
        manager.join_sink().unwrap();
        assert!(manager.pipeline().sink_finished());
    }
}
