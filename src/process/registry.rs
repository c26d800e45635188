//! Live-worker registry.
//!
//! Worker ids and their process records are kept behind one lock, so a
//! worker id and its record are always added and removed together.

use super::proc::ProcessRecord;
use crate::ipc::WorkerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Ordered set of live workers and their process records.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerId>,
    processes: HashMap<WorkerId, ProcessRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Returns false if the id is already live.
    pub fn insert(&mut self, record: ProcessRecord) -> bool {
        let worker_id = record.worker_id();
        if self.processes.contains_key(&worker_id) {
            return false;
        }
        self.workers.push(worker_id);
        self.processes.insert(worker_id, record);
        true
    }

    /// Remove a worker and its process record together.
    pub fn remove(&mut self, worker_id: WorkerId) -> Option<ProcessRecord> {
        let record = self.processes.remove(&worker_id)?;
        self.workers.retain(|id| *id != worker_id);
        Some(record)
    }

    /// Remove every worker, returning their records in insertion order.
    pub fn drain(&mut self) -> Vec<ProcessRecord> {
        let order = std::mem::take(&mut self.workers);
        order
            .into_iter()
            .filter_map(|id| self.processes.remove(&id))
            .collect()
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.processes.contains_key(&worker_id)
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// See [`ProcessRecord::is_running`]. Unknown ids are not alive.
    pub fn process_alive(&mut self, worker_id: WorkerId) -> bool {
        self.processes
            .get_mut(&worker_id)
            .is_some_and(|record| record.is_running())
    }

    /// Ids of registered workers whose process is verified alive.
    pub fn alive_workers(&mut self) -> Vec<WorkerId> {
        let ids = self.workers.clone();
        ids.into_iter()
            .filter(|id| self.process_alive(*id))
            .collect()
    }

    /// Remove every worker whose process is no longer running, returning
    /// their records in insertion order.
    pub fn remove_exited(&mut self) -> Vec<ProcessRecord> {
        let exited: Vec<WorkerId> = self
            .workers
            .clone()
            .into_iter()
            .filter(|id| !self.process_alive(*id))
            .collect();
        exited
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn get_mut(&mut self, worker_id: WorkerId) -> Option<&mut ProcessRecord> {
        self.processes.get_mut(&worker_id)
    }
}

/// Registry shared between a manager and its sink thread.
#[derive(Clone, Default)]
pub struct SharedRegistry(Arc<Mutex<WorkerRegistry>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry. A panic on another thread while it held the lock
    /// does not invalidate the registry, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, WorkerRegistry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
