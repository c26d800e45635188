//! File metadata daemon run behind a push/pull daemon manager.

use crate::error::Result;
use crate::worker::{DaemonJob, ResultSender};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRequest {
    pub path: PathBuf,
}

/// Metadata of one path. `error` is set instead when it cannot be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatResult {
    pub path: PathBuf,
    pub size: Option<u64>,
    pub is_dir: bool,
    pub modified: Option<u64>,
    pub error: Option<String>,
}

impl StatResult {
    pub fn for_path(path: PathBuf) -> Self {
        match std::fs::metadata(&path) {
            Ok(metadata) => Self {
                size: Some(metadata.len()),
                is_dir: metadata.is_dir(),
                modified: metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs()),
                error: None,
                path,
            },
            Err(e) => Self {
                size: None,
                is_dir: false,
                modified: None,
                error: Some(e.to_string()),
                path,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct StatJob {
    handled: usize,
}

impl DaemonJob for StatJob {
    type Request = StatRequest;

    fn handle(&mut self, results: &ResultSender, request: StatRequest) -> Result<()> {
        self.handled += 1;
        results.send_data(&StatResult::for_path(request.path))
    }

    fn cleanup_pre_stop(&mut self) {
        tracing::debug!(handled = self.handled, "Stat daemon finished");
    }
}
