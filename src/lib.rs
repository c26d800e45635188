//! workerpipe - supervised worker processes fed over ZeroMQ.
//!
//! Three work-distribution topologies share one process layer and one
//! wire protocol:
//!
//! - [`pipeline::PushPullDaemonManager`]: a single persistent daemon
//! - [`pipeline::PublishPullPipelineManager`]: a pool of addressed workers
//! - [`balancer::LoadBalancerManager`]: a request/reply pool behind a broker
//!
//! Results stream back to a sink and reach the caller as
//! [`pipeline::SinkEvent`]s on a crossbeam channel. The worker halves live
//! in [`worker`].

pub mod balancer;
pub mod config;
pub mod demo;
pub mod error;
pub mod ipc;
pub mod logfwd;
pub mod logging;
pub mod pipeline;
pub mod process;
pub mod worker;

pub use error::{PipeError, Result};
