//! Managers whose workers stream results back to a sink.
//!
//! - `sink`: the PULL endpoint and its demultiplexing thread
//! - `pull`: worker processes bundled with a sink
//! - `daemon`: one persistent worker fed over PUSH/PULL
//! - `publish`: a pool of workers fed over PUB/SUB

pub mod daemon;
pub mod publish;
pub mod pull;
pub mod sink;

pub use daemon::PushPullDaemonManager;
pub use publish::PublishPullPipelineManager;
pub use pull::PullPipelineManager;
pub use sink::{JsonDecoder, SinkDecoder, SinkEndpoint, SinkEvent, SinkHandle, Terminating};
