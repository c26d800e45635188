//! Directory scanner run as a publish/pull pipeline worker.

use crate::error::Result;
use crate::worker::{Directive, PipelineJob, PipelineWorker};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Files are reported in batches of this size.
const BATCH_SIZE: usize = 64;

/// Work arguments of one scan worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanArguments {
    pub roots: Vec<PathBuf>,
}

/// A batch of files found by a scan worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanBatch {
    pub files: Vec<PathBuf>,
    pub bytes: u64,
}

/// Walks directory trees, reporting regular files in batches.
#[derive(Debug, Default)]
pub struct ScanJob {
    pending: Vec<PathBuf>,
    pending_bytes: u64,
}

impl ScanJob {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self, worker: &PipelineWorker) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = ScanBatch {
            files: std::mem::take(&mut self.pending),
            bytes: std::mem::take(&mut self.pending_bytes),
        };
        worker.send_data(&batch)
    }

    /// Depth-first walk, checking for directives before every entry.
    /// Returns `Directive::Stop` if the worker was stopped.
    fn walk(&mut self, worker: &mut PipelineWorker, dir: &Path) -> Result<Directive> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Cannot read directory");
                return Ok(Directive::Continue);
            }
        };
        for entry in entries.flatten() {
            if worker.check_for_controller_directive()? == Directive::Stop {
                return Ok(Directive::Stop);
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                if self.walk(worker, &path)? == Directive::Stop {
                    return Ok(Directive::Stop);
                }
            } else if file_type.is_file() {
                self.pending_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                self.pending.push(path);
                if self.pending.len() >= BATCH_SIZE {
                    self.flush(worker)?;
                }
            }
        }
        Ok(Directive::Continue)
    }
}

impl PipelineJob for ScanJob {
    type Arguments = ScanArguments;

    fn do_work(&mut self, worker: &mut PipelineWorker, arguments: ScanArguments) -> Result<()> {
        for root in &arguments.roots {
            tracing::debug!(worker_id = %worker.worker_id(), root = %root.display(), "Scanning");
            if worker.check_for_controller_directive()? == Directive::Stop
                || self.walk(worker, root)? == Directive::Stop
            {
                return Ok(());
            }
        }
        self.flush(worker)
    }

    fn cleanup_pre_stop(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }
}

/// Split `roots` into at most `workers` non-empty groups, round robin.
pub fn partition(roots: &[PathBuf], workers: usize) -> Vec<ScanArguments> {
    let groups = workers.clamp(1, roots.len().max(1));
    let mut arguments = vec![ScanArguments { roots: Vec::new() }; groups];
    for (i, root) in roots.iter().enumerate() {
        arguments[i % groups].roots.push(root.clone());
    }
    arguments.retain(|a| !a.roots.is_empty());
    arguments
}
