//! Worker pool registry
//!
//! The registry is an ordered table of live workers owned by the dispatcher.
//! Iteration order is insertion order, so "first free worker" means the
//! oldest free one; replacements go to the back.

use crate::lifecycle::WorkerHandle;
use std::fmt;
use tokio::net::UnixStream;

/// Identity of a worker, unique for the life of the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a worker may receive a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a dispatch signal
    Free,
    /// Signaled and not yet reported finished
    Busy,
}

/// Bookkeeping for one live worker
pub struct WorkerRecord {
    id: WorkerId,
    pid: Option<u32>,
    channel: UnixStream,
    handle: WorkerHandle,
    state: WorkerState,
    served: u64,
    ceiling: u64,
}

impl WorkerRecord {
    pub fn new(
        id: WorkerId,
        pid: Option<u32>,
        channel: UnixStream,
        handle: WorkerHandle,
        ceiling: u64,
    ) -> Self {
        Self {
            id,
            pid,
            channel,
            handle,
            state: WorkerState::Free,
            served: 0,
            ceiling,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == WorkerState::Free
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// True once the worker has taken as many requests as it may
    pub fn is_exhausted(&self) -> bool {
        self.served >= self.ceiling
    }

    pub fn channel(&self) -> &UnixStream {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut UnixStream {
        &mut self.channel
    }

    /// Record an acknowledged dispatch
    pub fn mark_dispatched(&mut self) {
        debug_assert!(self.is_free(), "dispatch to busy worker {}", self.id);
        self.state = WorkerState::Busy;
        self.served += 1;
    }

    /// Record a finished request; returns true if the worker must now retire
    pub fn mark_finished(&mut self) -> bool {
        self.state = WorkerState::Free;
        self.is_exhausted()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            pid: self.pid,
            state: self.state,
            served: self.served,
            ceiling: self.ceiling,
        }
    }

    /// Give up the channel and keep only what is needed to stop the worker
    pub fn into_handle(self) -> WorkerHandle {
        self.handle
    }
}

impl fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("served", &self.served)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub served: u64,
    pub ceiling: u64,
}

/// Ordered table of live workers
#[derive(Debug, Default)]
pub struct Registry {
    records: Vec<WorkerRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record. A record whose id is already present is rejected and dropped.
    pub fn insert(&mut self, record: WorkerRecord) -> Result<(), WorkerId> {
        if self.contains(record.id) {
            return Err(record.id);
        }
        self.records.push(record);
        Ok(())
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(index))
    }

    /// First free worker in insertion order
    pub fn first_free(&self) -> Option<WorkerId> {
        self.records.iter().find(|r| r.is_free()).map(|r| r.id)
    }

    pub fn has_free(&self) -> bool {
        self.records.iter().any(|r| r.is_free())
    }

    pub fn busy_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_free()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.iter()
    }

    /// Drain every record, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = WorkerRecord> + '_ {
        self.records.drain(..)
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.records.iter().map(WorkerRecord::status).collect()
    }
}
