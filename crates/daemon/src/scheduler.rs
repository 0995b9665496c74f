//! Bounded conversion scheduler
//!
//! Admits discovered files into a fixed-size running set and queues overflow
//! in a FIFO backlog. All transitions take `&mut self`, so the owner decides
//! how access is serialized (the daemon keeps it inside a single task).

use crate::job::JobOutcome;
use crate::status::StatusSnapshot;
use crate::task::{ConversionTask, SkipReason};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Starts a conversion job for an admitted task.
///
/// Implementations must not block; the job itself runs elsewhere and reports
/// back through [`ConversionScheduler::on_job_terminal`].
pub trait JobLauncher {
    fn launch(&mut self, task: ConversionTask);
}

/// Where a task ended up after `admit_or_queue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A job was started immediately
    Started,
    /// Appended to the backlog at this zero-based position
    Queued { position: usize },
}

/// Outcome counters kept for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub skipped: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
}

/// Admission and queueing state: the running set plus the backlog
pub struct ConversionScheduler<L> {
    capacity: usize,
    output_dir: PathBuf,
    running: Vec<ConversionTask>,
    backlog: VecDeque<ConversionTask>,
    stats: SchedulerStats,
    launcher: L,
}

impl<L: JobLauncher> ConversionScheduler<L> {
    /// Create a scheduler with a fixed capacity (at least 1)
    pub fn new(capacity: usize, output_dir: PathBuf, launcher: L) -> Self {
        Self {
            capacity: capacity.max(1),
            output_dir,
            running: Vec::new(),
            backlog: VecDeque::new(),
            stats: SchedulerStats::default(),
            launcher,
        }
    }

    /// Handle a discovered file.
    ///
    /// Rejections are logged and returned; they never change the running set
    /// or the backlog.
    pub fn submit(&mut self, path: &Path) -> Result<Admission, SkipReason> {
        self.stats.submitted += 1;

        let checked = if self.is_scheduled(path) {
            Err(SkipReason::AlreadyScheduled)
        } else {
            ConversionTask::from_discovered(path, &self.output_dir).and_then(|task| {
                // Sources with the same stem in different subdirectories share a destination.
                if self.is_destination_scheduled(&task.output_path) {
                    Err(SkipReason::DestinationScheduled(task.output_path))
                } else {
                    Ok(task)
                }
            })
        };

        match checked {
            Ok(task) => Ok(self.admit_or_queue(task)),
            Err(reason) => {
                self.stats.skipped += 1;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                info!("Skipping conversion: {} {}", name, reason);
                Err(reason)
            }
        }
    }

    /// Start the task if a slot is free, otherwise append it to the backlog
    pub fn admit_or_queue(&mut self, task: ConversionTask) -> Admission {
        if self.running.len() < self.capacity {
            debug!(
                "Admitting {} ({}/{} running)",
                task.display_name,
                self.running.len() + 1,
                self.capacity
            );
            self.running.push(task.clone());
            self.stats.started += 1;
            self.launcher.launch(task);
            Admission::Started
        } else {
            let position = self.backlog.len();
            info!(
                "Queued {} (position {}, {} running)",
                task.display_name,
                position + 1,
                self.running.len()
            );
            self.backlog.push_back(task);
            Admission::Queued { position }
        }
    }

    /// Record a job's terminal outcome and admit the next backlog task.
    ///
    /// Returns the task pulled from the backlog, if any. Unknown tasks are
    /// logged and leave the state untouched.
    pub fn on_job_terminal(
        &mut self,
        task: &ConversionTask,
        outcome: &JobOutcome,
    ) -> Option<ConversionTask> {
        let Some(index) = self
            .running
            .iter()
            .position(|t| t.source_path == task.source_path)
        else {
            warn!(
                "Ignoring terminal outcome for unknown task {}",
                task.source_path.display()
            );
            return None;
        };
        let finished = self.running.remove(index);

        match outcome {
            JobOutcome::Completed { output_bytes } => {
                self.stats.completed += 1;
                self.stats.total_bytes_in += finished.input_bytes;
                self.stats.total_bytes_out += output_bytes;
            }
            JobOutcome::Failed { reason } => {
                self.stats.failed += 1;
                debug!("{} dropped after failure: {}", finished.display_name, reason);
            }
        }

        let next = self.backlog.pop_front()?;
        self.admit_or_queue(next.clone());
        Some(next)
    }

    /// True if the source is currently running or waiting in the backlog
    pub fn is_scheduled(&self, path: &Path) -> bool {
        self.running.iter().any(|t| t.source_path == path)
            || self.backlog.iter().any(|t| t.source_path == path)
    }

    /// True if a running or queued task already writes to `output`
    pub fn is_destination_scheduled(&self, output: &Path) -> bool {
        self.running.iter().any(|t| t.output_path == output)
            || self.backlog.iter().any(|t| t.output_path == output)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> &[ConversionTask] {
        &self.running
    }

    pub fn backlog(&self) -> impl Iterator<Item = &ConversionTask> {
        self.backlog.iter()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Serializable view of the queues and counters
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();
        snapshot.record_scheduler(self);
        snapshot
    }
}
