//! Forwarding of worker logs to the driving process.
//!
//! Workers publish their records; the driving process collects them and
//! re-emits them through its own subscriber. The collector's info socket
//! understands `CONNECT <port>`, `DISCONNECT <port>` and `STOP`.

pub mod collector;
pub mod publisher;

pub use collector::LogCollector;
pub use publisher::LogPublisher;

const CONNECT: &str = "CONNECT";
const DISCONNECT: &str = "DISCONNECT";
const STOP: &str = "STOP";
