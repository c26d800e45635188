//! Runtime of a load balanced worker.

use super::ResultSender;
use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, Content, WorkerId, decode_payload};
use crate::ipc::socket;
use serde::de::DeserializeOwned;

/// Ports and identity a balanced worker receives on its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancedPorts {
    /// The broker's backend.
    pub request: u16,
    /// The sink results go to.
    pub send: u16,
    pub worker_id: WorkerId,
}

/// Work done for each request routed to this worker.
pub trait BalancedJob {
    /// Prefix of the worker's transport identity.
    const WORKER_TYPE: &'static str;

    type Request: DeserializeOwned;

    fn handle(&mut self, results: &ResultSender, request: Self::Request) -> Result<()>;

    /// Release resources before the worker exits.
    fn cleanup_pre_stop(&mut self) {}
}

/// Announce READY, then serve one request at a time until STOP.
pub fn run_balanced_worker<J: BalancedJob>(ports: BalancedPorts, job: &mut J) -> Result<()> {
    let context = zmq::Context::new();
    let requester = socket::new_socket(&context, zmq::REQ)?;
    requester.set_identity(&protocol::create_identity(J::WORKER_TYPE, ports.worker_id))?;
    requester.connect(&socket::endpoint(ports.request))?;
    let results = ResultSender::connect(&context, ports.send, ports.worker_id)?;
    serve(&requester, &results, job)
}

fn serve<J: BalancedJob>(
    requester: &zmq::Socket,
    results: &ResultSender,
    job: &mut J,
) -> Result<()> {
    requester.send(Command::Ready.as_bytes(), 0)?;
    loop {
        let frames = socket::recv_multipart(requester)?;
        match protocol::parse_unaddressed(frames)? {
            Content::Command(Command::Stop) => {
                tracing::debug!(worker_id = %results.worker_id(), "Worker stopping");
                job.cleanup_pre_stop();
                requester.send(Command::Stopped.as_bytes(), 0)?;
                return Ok(());
            }
            Content::Data(payload) => {
                match decode_payload::<J::Request>(&payload) {
                    Ok(request) => {
                        if let Err(e) = job.handle(results, request) {
                            tracing::error!(worker_id = %results.worker_id(), error = %e, "Request failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping undecodable request"),
                }
                requester.send(Command::Ready.as_bytes(), 0)?;
            }
            Content::Command(other) => {
                return Err(PipeError::Protocol(format!(
                    "unexpected {} sent to balanced worker",
                    other
                )));
            }
        }
    }
}
