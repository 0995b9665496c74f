//! Status module for clipwatch
//!
//! Serializable view of the scheduler plus per-job progress, shared between the
//! daemon loop, running jobs and the optional status server.

use crate::job::JobProgress;
use crate::scheduler::{ConversionScheduler, JobLauncher, SchedulerStats};
use crate::task::ConversionTask;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Point-in-time view of the daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub capacity: usize,
    /// Tasks with a live job, in admission order
    pub running: Vec<ConversionTask>,
    /// Waiting tasks, front first
    pub backlog: Vec<ConversionTask>,
    /// Last progress per running job, keyed by source path
    pub progress: BTreeMap<String, JobProgress>,
    pub stats: SchedulerStats,
}

impl StatusSnapshot {
    /// Copy the scheduler's queues and counters into the snapshot.
    ///
    /// Progress entries are owned by the jobs and left untouched.
    pub fn record_scheduler<L: JobLauncher>(&mut self, scheduler: &ConversionScheduler<L>) {
        self.timestamp_unix_ms = chrono::Utc::now().timestamp_millis();
        self.capacity = scheduler.capacity();
        self.running = scheduler.running().to_vec();
        self.backlog = scheduler.backlog().cloned().collect();
        self.stats = scheduler.stats().clone();
    }
}

/// Shared status state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus with an empty snapshot
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}
