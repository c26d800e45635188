//! Error types for workerpipe.

use crate::ipc::WorkerId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for workerpipe.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("Failed to start process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Worker {worker_id} did not synchronize within {waited:?}")]
    SyncTimeout { worker_id: WorkerId, waited: Duration },

    #[error("Worker {0} exited before it could be reached")]
    WorkerDied(WorkerId),

    #[error("Worker {0} is not managed here")]
    UnknownWorker(WorkerId),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Result type alias for workerpipe operations.
pub type Result<T> = std::result::Result<T, PipeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_protocol_error_message() {
        let err = PipeError::Protocol("unexpected token b\"BOGUS\"".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Protocol violation"));
        assert!(msg.contains("BOGUS"));
    }

    #[test]
    fn test_sync_timeout_message() {
        let err = PipeError::SyncTimeout {
            worker_id: WorkerId::new(7),
            waited: Duration::from_secs(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("Worker 7"));
        assert!(msg.contains("3s"));
    }

    #[test]
    fn test_unknown_worker_message() {
        let err = PipeError::UnknownWorker(WorkerId::new(12));
        assert_eq!(err.to_string(), "Worker 12 is not managed here");
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        use std::error::Error as _;

        let err = PipeError::Spawn {
            command: "/nonexistent/worker --receive 1".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().contains("/nonexistent/worker"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PipeError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: PipeError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_zmq_error_conversion() {
        let err: PipeError = zmq::Error::EAGAIN.into();
        assert!(err.to_string().contains("ZeroMQ"));
    }
}
