//! Conversion job module for clipwatch
//!
//! A job drives one ffmpeg run from launch to its terminal outcome. Progress
//! is advisory: it feeds the status snapshot but never decides completion.

use crate::encode::{spawn_encoder, EncodeParams, EncoderEvent, EncoderProgress};
use crate::progress::ProgressReporter;
use crate::report;
use crate::status::SharedStatus;
use crate::task::ConversionTask;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Identity of a running job inside the progress registry
pub type JobId = u64;

/// Ceiling for the output-size estimate; the final size is unknown until the end
pub const SIZE_ESTIMATE_CAP: f32 = 95.0;

/// Terminal outcome of a job. Every job produces exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Encoder ended successfully
    Completed { output_bytes: u64 },
    /// Encoder reported an error; the task is dropped
    Failed { reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

/// Last known progress of a running job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percent complete, never decreasing, within [0, 100]
    pub percent: f32,
    /// Encoder output position
    pub timemark: Option<String>,
    /// Encoder output bitrate in kbit/s
    pub kbps: Option<f64>,
    #[serde(skip)]
    encoder_reports_percent: bool,
}

impl JobProgress {
    /// Apply a sample from the encoder
    pub fn observe(&mut self, sample: &EncoderProgress) {
        if let Some(percent) = sample.percent {
            self.encoder_reports_percent = true;
            self.raise(percent);
        }
        if sample.timemark.is_some() {
            self.timemark = sample.timemark.clone();
        }
        self.kbps = sample.kbps;
    }

    /// Fallback estimate from the growing output file.
    ///
    /// Ignored once the encoder reports real percentages. Returns true if the
    /// percent changed.
    pub fn observe_output_size(&mut self, output_bytes: u64, input_bytes: u64) -> bool {
        if self.encoder_reports_percent {
            return false;
        }
        let before = self.percent;
        self.raise(estimate_percent_from_size(output_bytes, input_bytes));
        self.percent > before
    }

    fn raise(&mut self, percent: f32) {
        if percent.is_nan() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.percent {
            self.percent = percent;
        }
    }
}

/// Rough percent from output size relative to input size, capped at 95
pub fn estimate_percent_from_size(output_bytes: u64, input_bytes: u64) -> f32 {
    if input_bytes == 0 {
        return 0.0;
    }
    let ratio = output_bytes as f64 / input_bytes as f64 * 100.0;
    (ratio as f32).min(SIZE_ESTIMATE_CAP)
}

/// Shared, per-daemon settings every job needs
pub struct JobContext {
    /// Resolved ffmpeg executable
    pub ffmpeg: PathBuf,
    /// Progress block shared by all jobs
    pub reporter: ProgressReporter,
    /// Status snapshot jobs publish their progress into
    pub status: SharedStatus,
    /// Period of the output-size fallback poll
    pub progress_poll: Duration,
}

/// One in-flight conversion
pub struct ConversionJob {
    id: JobId,
    task: ConversionTask,
    ctx: Arc<JobContext>,
}

impl ConversionJob {
    pub fn new(id: JobId, task: ConversionTask, ctx: Arc<JobContext>) -> Self {
        Self { id, task, ctx }
    }

    /// Run the encoder to its terminal state.
    ///
    /// Consumes the job, so the outcome can only be produced once. The
    /// progress registry entry and the polling timer are released before
    /// returning.
    pub async fn run(self) -> JobOutcome {
        let started_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        self.ctx
            .reporter
            .print(&report::conversion_started(&self.task, &started_at));
        self.ctx.reporter.register(self.id, &self.task.display_name);
        self.publish(&JobProgress::default()).await;

        let outcome = self.supervise().await;

        self.ctx.reporter.unregister(self.id);
        self.retract().await;

        match &outcome {
            JobOutcome::Completed { output_bytes } => {
                info!(
                    "Converted {} -> {}",
                    self.task.source_path.display(),
                    self.task.output_path.display()
                );
                self.ctx
                    .reporter
                    .print(&report::conversion_complete(&self.task, *output_bytes));
            }
            JobOutcome::Failed { reason } => {
                debug!("Error converting {}: {}", self.task.display_name, reason);
                self.ctx
                    .reporter
                    .print(&report::conversion_failed(&self.task, reason));
            }
        }

        outcome
    }

    async fn supervise(&self) -> JobOutcome {
        let params = EncodeParams::new(
            self.ctx.ffmpeg.clone(),
            self.task.source_path.clone(),
            self.task.output_path.clone(),
        );

        let mut events = match spawn_encoder(&params) {
            Ok(events) => events,
            Err(e) => {
                return JobOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let mut progress = JobProgress::default();
        let mut poll = tokio::time::interval(self.ctx.progress_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(EncoderEvent::Progress(sample)) => {
                        progress.observe(&sample);
                        self.publish(&progress).await;
                    }
                    Some(EncoderEvent::End) => break Ok(()),
                    Some(EncoderEvent::Error(e)) => break Err(e.to_string()),
                    None => break Err("encoder stopped without reporting a result".to_string()),
                },
                _ = poll.tick() => {
                    // The output may not exist yet or be briefly unreadable; retry next tick.
                    if let Ok(meta) = tokio::fs::metadata(&self.task.output_path).await {
                        if progress.observe_output_size(meta.len(), self.task.input_bytes) {
                            self.publish(&progress).await;
                        }
                    }
                }
            }
        };
        drop(poll);

        match result {
            Ok(()) => match tokio::fs::metadata(&self.task.output_path).await {
                Ok(meta) => JobOutcome::Completed {
                    output_bytes: meta.len(),
                },
                Err(e) => JobOutcome::Failed {
                    reason: format!("encoder finished but output is unreadable: {}", e),
                },
            },
            Err(reason) => {
                self.discard_partial_output().await;
                JobOutcome::Failed { reason }
            }
        }
    }

    /// Remove whatever the failed encoder left at the destination.
    ///
    /// Admission guarantees the destination did not exist before this job,
    /// so anything there now is a truncated file of ours.
    async fn discard_partial_output(&self) {
        match tokio::fs::remove_file(&self.task.output_path).await {
            Ok(()) => debug!(
                "Removed partial output {}",
                self.task.output_path.display()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove partial output {}: {}",
                self.task.output_path.display(),
                e
            ),
        }
    }

    fn status_key(&self) -> String {
        self.task.source_path.to_string_lossy().into_owned()
    }

    async fn publish(&self, progress: &JobProgress) {
        let mut status = self.ctx.status.write().await;
        status.progress.insert(self.status_key(), progress.clone());
    }

    async fn retract(&self) {
        let mut status = self.ctx.status.write().await;
        status.progress.remove(&self.status_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::new_shared_status;
    use proptest::prelude::*;

    fn sample(percent: Option<f32>) -> EncoderProgress {
        EncoderProgress {
            percent,
            timemark: Some("00:00:01.000000".to_string()),
            kbps: Some(900.0),
        }
    }

    #[test]
    fn test_estimate_is_capped() {
        assert_eq!(estimate_percent_from_size(0, 1000), 0.0);
        assert_eq!(estimate_percent_from_size(500, 1000), 50.0);
        assert_eq!(estimate_percent_from_size(990, 1000), 95.0);
        assert_eq!(estimate_percent_from_size(5000, 1000), 95.0);
        assert_eq!(estimate_percent_from_size(5000, 0), 0.0);
    }

    #[test]
    fn test_encoder_percent_disables_size_fallback() {
        let mut progress = JobProgress::default();
        assert!(progress.observe_output_size(300, 1000));
        assert_eq!(progress.percent, 30.0);

        progress.observe(&sample(Some(40.0)));
        assert_eq!(progress.percent, 40.0);

        assert!(!progress.observe_output_size(900, 1000));
        assert_eq!(progress.percent, 40.0);
    }

    #[test]
    fn test_sample_without_percent_keeps_timemark() {
        let mut progress = JobProgress::default();
        progress.observe(&sample(None));
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.timemark.as_deref(), Some("00:00:01.000000"));
        assert_eq!(progress.kbps, Some(900.0));
    }

    #[test]
    fn test_outcome_success_flag() {
        assert!(JobOutcome::Completed { output_bytes: 1 }.is_success());
        assert!(!JobOutcome::Failed { reason: "x".into() }.is_success());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_progress_is_monotonic_and_clamped(
            samples in proptest::collection::vec(-50.0f32..200.0, 1..40),
        ) {
            let mut progress = JobProgress::default();
            let mut last = 0.0f32;
            for value in samples {
                progress.observe(&sample(Some(value)));
                prop_assert!(progress.percent >= last);
                prop_assert!((0.0..=100.0).contains(&progress.percent));
                last = progress.percent;
            }
        }

        #[test]
        fn prop_size_estimate_never_exceeds_cap(
            output_bytes in any::<u64>(),
            input_bytes in any::<u64>(),
        ) {
            let estimate = estimate_percent_from_size(output_bytes, input_bytes);
            prop_assert!((0.0..=SIZE_ESTIMATE_CAP).contains(&estimate));
        }
    }

    #[cfg(unix)]
    mod lifecycle {
        use super::*;
        use std::io::{self, Write};
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        struct Discard;

        impl Write for Discard {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        fn fake_ffmpeg(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn context(ffmpeg: PathBuf) -> Arc<JobContext> {
            Arc::new(JobContext {
                ffmpeg,
                reporter: ProgressReporter::new(Box::new(Discard), Duration::from_millis(20)),
                status: new_shared_status(),
                progress_poll: Duration::from_millis(20),
            })
        }

        #[tokio::test]
        async fn test_successful_job_reports_output_size() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(
                &dir,
                "for last; do :; done\nprintf 'converted-bytes' > \"$last\"\nexit 0",
            );
            let ctx = context(ffmpeg);
            let task = ConversionTask::new(
                dir.path().join("movie.mp4"),
                dir.path().join("movie_converted.mp4"),
                100,
            );

            let outcome = ConversionJob::new(1, task, ctx.clone()).run().await;

            assert_eq!(outcome, JobOutcome::Completed { output_bytes: 15 });
            assert!(ctx.reporter.is_empty());
            assert!(!ctx.reporter.is_clock_running());
            assert_eq!(ctx.reporter.clock_starts(), 1);
            assert_eq!(ctx.reporter.clock_stops(), 1);
            assert!(ctx.status.read().await.progress.is_empty());
        }

        #[tokio::test]
        async fn test_failed_job_releases_resources() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "echo 'Conversion failed!' >&2\nexit 1");
            let ctx = context(ffmpeg);
            let task = ConversionTask::new(
                dir.path().join("broken.avi"),
                dir.path().join("broken_converted.mp4"),
                100,
            );

            let outcome = ConversionJob::new(2, task, ctx.clone()).run().await;

            match outcome {
                JobOutcome::Failed { reason } => assert!(reason.contains("Conversion failed!")),
                other => panic!("expected failure, got {:?}", other),
            }
            assert!(ctx.reporter.is_empty());
            assert!(!ctx.reporter.is_clock_running());
            assert!(ctx.status.read().await.progress.is_empty());
        }

        #[tokio::test]
        async fn test_failed_job_removes_partial_output() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(
                &dir,
                "for last; do :; done\nprintf 'trunc' > \"$last\"\necho 'Invalid data found' >&2\nexit 1",
            );
            let ctx = context(ffmpeg);
            let output = dir.path().join("cut_converted.mp4");
            let task = ConversionTask::new(dir.path().join("cut.mov"), output.clone(), 100);

            let outcome = ConversionJob::new(4, task, ctx).run().await;

            assert!(!outcome.is_success());
            assert!(!output.exists(), "partial output must be removed");
        }

        #[tokio::test]
        async fn test_success_without_output_is_failure() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "exit 0");
            let ctx = context(ffmpeg);
            let task = ConversionTask::new(
                dir.path().join("ghost.mkv"),
                dir.path().join("ghost_converted.mp4"),
                100,
            );

            let outcome = ConversionJob::new(3, task, ctx).run().await;
            assert!(!outcome.is_success());
        }

        #[tokio::test]
        async fn test_missing_encoder_is_failure() {
            let dir = TempDir::new().unwrap();
            let ctx = context(dir.path().join("no-such-ffmpeg"));
            let task = ConversionTask::new(
                dir.path().join("a.mkv"),
                dir.path().join("a_converted.mp4"),
                100,
            );

            let outcome = ConversionJob::new(4, task, ctx.clone()).run().await;
            assert!(!outcome.is_success());
            assert!(ctx.reporter.is_empty());
        }
    }
}
