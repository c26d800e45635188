//! Load balanced request/reply worker pools.
//!
//! - `manager`: starts the broker process and sends it STOP
//! - `broker`: the broker process and its worker pool
//! - `lru`: the idle/busy queue the broker routes with

pub mod broker;
pub mod lru;
pub mod manager;

pub use broker::{BalancedWorkerSpec, BrokerPorts, BrokerTimeouts, LoadBalancer};
pub use lru::LruQueue;
pub use manager::{LoadBalancerManager, RequestSender};
