//! Least-recently-used worker queue of the load balancer.
//!
//! A pure state machine over transport identities; the broker reactor feeds
//! it socket events and carries out the actions it returns.

use std::collections::{HashSet, VecDeque};

/// What the broker must do after a worker reported READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyAction {
    /// The worker is queued as idle.
    Queued,
    /// The pool is shutting down: send this worker STOP.
    SendStop,
}

/// Idle and busy workers of a load balanced pool.
#[derive(Debug, Default)]
pub struct LruQueue {
    idle: VecDeque<Vec<u8>>,
    busy: HashSet<Vec<u8>>,
    stop_sent: HashSet<Vec<u8>>,
    stopped: HashSet<Vec<u8>>,
    terminating: bool,
}

impl LruQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker announced it can take a request.
    pub fn worker_ready(&mut self, identity: Vec<u8>) -> ReadyAction {
        self.busy.remove(&identity);
        if self.terminating {
            self.stop_sent.insert(identity);
            return ReadyAction::SendStop;
        }
        if !self.idle.contains(&identity) {
            self.idle.push_back(identity);
        }
        ReadyAction::Queued
    }

    /// A worker acknowledged STOP.
    pub fn worker_stopped(&mut self, identity: Vec<u8>) {
        self.busy.remove(&identity);
        self.idle.retain(|id| *id != identity);
        self.stop_sent.remove(&identity);
        self.stopped.insert(identity);
    }

    /// Take the least recently used idle worker for a request.
    pub fn assign(&mut self) -> Option<Vec<u8>> {
        if self.terminating {
            return None;
        }
        let identity = self.idle.pop_front()?;
        self.busy.insert(identity.clone());
        Some(identity)
    }

    /// Whether a request can be accepted right now. The frontend is only
    /// polled while this holds.
    pub fn has_idle(&self) -> bool {
        !self.terminating && !self.idle.is_empty()
    }

    /// Begin shutdown, returning the idle workers that must be sent STOP.
    /// Busy workers are stopped when they next report READY.
    pub fn begin_termination(&mut self) -> Vec<Vec<u8>> {
        self.terminating = true;
        let idle: Vec<Vec<u8>> = self.idle.drain(..).collect();
        self.stop_sent.extend(idle.iter().cloned());
        idle
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn is_idle(&self, identity: &[u8]) -> bool {
        self.idle.iter().any(|id| id.as_slice() == identity)
    }

    pub fn is_busy(&self, identity: &[u8]) -> bool {
        self.busy.contains(identity)
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_len(&self) -> usize {
        self.busy.len()
    }

    /// Identities that have acknowledged STOP.
    pub fn stopped(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.stopped.iter()
    }

    pub fn stopped_len(&self) -> usize {
        self.stopped.len()
    }
}
