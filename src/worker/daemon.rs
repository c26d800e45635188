//! Runtime of a push/pull daemon worker.

use super::ResultSender;
use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, Content, DAEMON_WORKER_ID, decode_payload};
use crate::ipc::socket;
use serde::de::DeserializeOwned;

/// Ports a daemon receives on its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonPorts {
    pub receive: u16,
    pub send: u16,
}

/// Work done by a daemon for each message it is pushed.
pub trait DaemonJob {
    type Request: DeserializeOwned;

    fn handle(&mut self, results: &ResultSender, request: Self::Request) -> Result<()>;

    /// Release resources before the daemon exits.
    fn cleanup_pre_stop(&mut self) {}
}

/// Serve requests until STOP.
pub fn run_daemon_worker<J: DaemonJob>(ports: DaemonPorts, job: &mut J) -> Result<()> {
    let context = zmq::Context::new();
    let receiver = socket::connect_socket(&context, zmq::PULL, ports.receive)?;
    let results = ResultSender::connect(&context, ports.send, DAEMON_WORKER_ID)?;
    serve(&receiver, &results, job)
}

fn serve<J: DaemonJob>(receiver: &zmq::Socket, results: &ResultSender, job: &mut J) -> Result<()> {
    loop {
        let frames = socket::recv_multipart(receiver)?;
        match protocol::parse_unaddressed(frames)? {
            Content::Command(Command::Start) => {
                tracing::debug!("Daemon started");
            }
            Content::Command(Command::Stop) => {
                tracing::debug!("Daemon stopping");
                job.cleanup_pre_stop();
                return results.send_command(Command::Stopped);
            }
            Content::Data(payload) => match decode_payload::<J::Request>(&payload) {
                Ok(request) => {
                    if let Err(e) = job.handle(results, request) {
                        tracing::error!(error = %e, "Request failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Dropping undecodable request"),
            },
            Content::Command(other) => {
                return Err(PipeError::Protocol(format!(
                    "unexpected {} sent to daemon",
                    other
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{WorkerId, encode_payload};

    #[derive(Default)]
    struct Doubler {
        cleaned_up: bool,
    }

    impl DaemonJob for Doubler {
        type Request = u32;

        fn handle(&mut self, results: &ResultSender, request: u32) -> Result<()> {
            results.send_data(&(request * 2))
        }

        fn cleanup_pre_stop(&mut self) {
            self.cleaned_up = true;
        }
    }

    #[test]
    fn test_serve_until_stop() {
        let context = zmq::Context::new();
        let (ventilator, receive_port) = socket::bind_socket(&context, zmq::PUSH).unwrap();
        let (sink, sink_port) = socket::bind_socket(&context, zmq::PULL).unwrap();
        let receiver = socket::connect_socket(&context, zmq::PULL, receive_port).unwrap();
        let results = ResultSender::connect(&context, sink_port, DAEMON_WORKER_ID).unwrap();

        for content in [
            Content::Command(Command::Start),
            Content::Data(encode_payload(&21u32).unwrap()),
            Content::Data(b"not json".to_vec()),
            Content::Command(Command::Stop),
        ] {
            ventilator
                .send_multipart(protocol::unaddressed(content), 0)
                .unwrap();
        }

        let mut job = Doubler::default();
        serve(&receiver, &results, &mut job).unwrap();
        assert!(job.cleaned_up);

        let first = protocol::parse_addressed(socket::recv_multipart(&sink).unwrap()).unwrap();
        assert_eq!(first.worker_id, WorkerId::new(0));
        assert_eq!(first.content, Content::Data(b"42".to_vec()));
        let last = protocol::parse_addressed(socket::recv_multipart(&sink).unwrap()).unwrap();
        assert_eq!(last.content, Content::Command(Command::Stopped));
    }
}
