//! Worker-side counterparts of the managers.
//!
//! Each flavor is a `run_*` function driving a job trait:
//!
//! - `daemon`: [`DaemonJob`] behind a PULL socket
//! - `pipeline`: [`PipelineJob`] behind a filtered SUB socket
//! - `balanced`: [`BalancedJob`] behind a REQ socket to a broker
//!
//! `handshake` holds the startup rendezvous of pipeline workers.

pub mod balanced;
pub mod daemon;
pub mod handshake;
pub mod pipeline;

pub use balanced::{BalancedJob, BalancedPorts, run_balanced_worker};
pub use daemon::{DaemonJob, DaemonPorts, run_daemon_worker};
pub use pipeline::{Directive, PipelineJob, PipelinePorts, PipelineWorker, run_pipeline_worker};

use crate::error::Result;
use crate::ipc::protocol::{self, Command, Content, WorkerId, encode_payload};
use crate::ipc::socket;
use serde::Serialize;

/// A worker's PUSH connection to its manager's sink.
pub struct ResultSender {
    worker_id: WorkerId,
    socket: zmq::Socket,
}

impl ResultSender {
    pub fn connect(context: &zmq::Context, port: u16, worker_id: WorkerId) -> Result<Self> {
        Ok(Self {
            worker_id,
            socket: socket::connect_socket(context, zmq::PUSH, port)?,
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Send one result to the sink.
    pub fn send_data<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let payload = encode_payload(data)?;
        self.socket
            .send_multipart(protocol::addressed(self.worker_id, Content::Data(payload)), 0)?;
        Ok(())
    }

    /// Send a control token, such as the final STOPPED or FINISHED.
    pub fn send_command(&self, command: Command) -> Result<()> {
        self.socket.send_multipart(
            protocol::addressed(self.worker_id, Content::Command(command)),
            0,
        )?;
        Ok(())
    }
}
