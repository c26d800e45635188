//! Messaging primitives shared by managers and workers.

pub mod protocol;
pub mod socket;

pub use protocol::{Command, Content, DAEMON_WORKER_ID, Envelope, WorkerId};
pub use socket::SendOutcome;
