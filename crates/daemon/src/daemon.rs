//! Daemon startup and main loop for clipwatch
//!
//! The daemon owns the scheduler inside a single task that selects over newly
//! discovered files and finished jobs. Every scheduler transition happens in
//! that loop, so admission decisions never race.

use crate::config::{Config, ConfigError};
use crate::job::{ConversionJob, JobContext, JobId, JobOutcome};
use crate::progress::ProgressReporter;
use crate::scheduler::{ConversionScheduler, JobLauncher, SchedulerStats};
use crate::startup::{run_startup_checks, ResolvedSettings, StartupError};
use crate::status::{new_shared_status, SharedStatus};
use crate::status_server::{parse_bind_address, run_status_server, ServerError};
use crate::task::ConversionTask;
use crate::watch::{start_watcher, WatchError, WatchOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Directory watcher could not be started
    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),

    /// Status server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// A finished job reported back to the control loop
type Terminal = (ConversionTask, JobOutcome);

/// Spawns one tokio task per admitted conversion
struct TokioLauncher {
    ctx: Arc<JobContext>,
    next_id: JobId,
    done_tx: mpsc::UnboundedSender<Terminal>,
}

impl TokioLauncher {
    fn new(ctx: Arc<JobContext>, done_tx: mpsc::UnboundedSender<Terminal>) -> Self {
        Self {
            ctx,
            next_id: 1,
            done_tx,
        }
    }
}

impl JobLauncher for TokioLauncher {
    fn launch(&mut self, task: ConversionTask) {
        let id = self.next_id;
        self.next_id += 1;

        let ctx = self.ctx.clone();
        let done_tx = self.done_tx.clone();
        let job = ConversionJob::new(id, task.clone(), ctx.clone());

        tokio::spawn(async move {
            let outcome = match tokio::spawn(job.run()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The job never reached its own cleanup.
                    ctx.reporter.unregister(id);
                    let key = task.source_path.to_string_lossy().into_owned();
                    ctx.status.write().await.progress.remove(&key);
                    JobOutcome::Failed {
                        reason: format!("job panicked: {}", e),
                    }
                }
            };
            // Closed channel means the daemon loop is gone.
            let _ = done_tx.send((task, outcome));
        });
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file, environment and flags
    pub config: Config,
    /// Directories and encoder validated at startup
    pub settings: ResolvedSettings,
    status: SharedStatus,
    reporter: ProgressReporter,
}

impl Daemon {
    /// Validate the configuration and run startup checks
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let settings = run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config, settings))
    }

    /// Build a daemon from settings that were resolved elsewhere
    pub fn new_without_checks(config: Config, settings: ResolvedSettings) -> Self {
        Self {
            config,
            settings,
            status: new_shared_status(),
            reporter: ProgressReporter::stdout(),
        }
    }

    /// Replace the terminal progress reporter
    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Get the shared status
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Start the status HTTP server as a background task
    pub fn start_status_server(&self) -> Result<JoinHandle<()>, DaemonError> {
        let addr = parse_bind_address(&self.config.status.bind)?;
        let status = self.status.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = run_status_server(status, addr).await {
                error!("Status server error: {}", e);
            }
        }))
    }

    /// Watch for files and convert them until cancelled
    pub async fn run(&self) -> Result<SchedulerStats, DaemonError> {
        let opts = WatchOptions {
            watch_dir: self.settings.watch_dir.clone(),
            output_dir: self.settings.output_dir.clone(),
            stability_threshold: Duration::from_millis(self.config.watch.stability_threshold_ms),
            poll_interval: Duration::from_millis(self.config.watch.poll_interval_ms),
        };
        let (_watcher, discovered) = start_watcher(opts)?;

        let server = if self.config.status.enabled {
            Some(self.start_status_server()?)
        } else {
            None
        };

        info!(
            "Converting files from {} into {} ({} at a time)",
            self.settings.watch_dir.display(),
            self.settings.output_dir.display(),
            self.config.scheduler.max_concurrent
        );

        let result = self.run_loop(discovered).await;

        if let Some(server) = server {
            server.abort();
        }
        result
    }

    /// Drive the scheduler from a stream of discovered paths.
    ///
    /// Returns once discovery has closed and every running job has finished.
    pub async fn run_loop(
        &self,
        mut discovered: mpsc::UnboundedReceiver<PathBuf>,
    ) -> Result<SchedulerStats, DaemonError> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Terminal>();
        let ctx = Arc::new(JobContext {
            ffmpeg: self.settings.ffmpeg.clone(),
            reporter: self.reporter.clone(),
            status: self.status.clone(),
            progress_poll: Duration::from_millis(self.config.encoder.progress_poll_ms),
        });
        let mut scheduler = ConversionScheduler::new(
            self.config.scheduler.max_concurrent as usize,
            self.settings.output_dir.clone(),
            TokioLauncher::new(ctx, done_tx),
        );
        self.publish(&scheduler).await;

        let mut discovery_open = true;
        loop {
            if !discovery_open && scheduler.running().is_empty() {
                break;
            }

            tokio::select! {
                path = discovered.recv(), if discovery_open => match path {
                    Some(path) => {
                        // Rejections are logged by the scheduler.
                        let _ = scheduler.submit(&path);
                        self.publish(&scheduler).await;
                    }
                    None => discovery_open = false,
                },
                Some((task, outcome)) = done_rx.recv() => {
                    scheduler.on_job_terminal(&task, &outcome);
                    self.publish(&scheduler).await;
                    info!("Watching for more files...");
                }
            }
        }

        Ok(scheduler.stats().clone())
    }

    async fn publish<L: JobLauncher>(&self, scheduler: &ConversionScheduler<L>) {
        self.status.write().await.record_scheduler(scheduler);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{self, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
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

    /// Fails for inputs whose name contains "bad", otherwise writes a small output
    const FAKE_FFMPEG: &str = r#"#!/bin/sh
input="$4"
for last; do :; done
case "$input" in
  *bad*) echo "Invalid data found when processing input" >&2; exit 1 ;;
esac
sleep 0.1
printf 'converted' > "$last"
exit 0
"#;

    struct Fixture {
        _dir: TempDir,
        watch: PathBuf,
        out: PathBuf,
        daemon: Daemon,
    }

    fn fixture(max_concurrent: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let watch = dir.path().join("watch");
        let out = dir.path().join("out");
        fs::create_dir_all(&watch).unwrap();
        fs::create_dir_all(&out).unwrap();

        let ffmpeg = dir.path().join("ffmpeg");
        fs::write(&ffmpeg, FAKE_FFMPEG).unwrap();
        fs::set_permissions(&ffmpeg, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.scheduler.max_concurrent = max_concurrent;
        config.encoder.progress_poll_ms = 20;

        let settings = ResolvedSettings {
            watch_dir: watch.clone(),
            output_dir: out.clone(),
            ffmpeg,
            ffmpeg_major: None,
        };
        let reporter = ProgressReporter::new(Box::new(Discard), Duration::from_millis(20));
        let daemon = Daemon::new_without_checks(config, settings).with_reporter(reporter);

        Fixture {
            _dir: dir,
            watch,
            out,
            daemon,
        }
    }

    fn source(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; 1000]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_backlog_drains_through_limited_slots() {
        let fx = fixture(2);
        let (tx, rx) = mpsc::unbounded_channel();
        for name in ["a.mov", "b.mkv", "c.avi"] {
            tx.send(source(&fx.watch, name)).unwrap();
        }
        drop(tx);

        let stats = fx.daemon.run_loop(rx).await.unwrap();

        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.started, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total_bytes_in, 3000);
        assert_eq!(stats.total_bytes_out, 3 * "converted".len() as u64);
        for name in ["a_converted.mp4", "b_converted.mp4", "c_converted.mp4"] {
            assert!(fx.out.join(name).exists(), "{} missing", name);
        }

        let status = fx.daemon.status();
        let snapshot = status.read().await;
        assert_eq!(snapshot.capacity, 2);
        assert!(snapshot.running.is_empty());
        assert!(snapshot.backlog.is_empty());
        assert!(snapshot.progress.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_frees_its_slot() {
        let fx = fixture(1);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(source(&fx.watch, "bad.mov")).unwrap();
        tx.send(source(&fx.watch, "good.mov")).unwrap();
        drop(tx);

        let stats = fx.daemon.run_loop(rx).await.unwrap();

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert!(fx.out.join("good_converted.mp4").exists());
        assert!(!fx.out.join("bad_converted.mp4").exists());
    }

    #[tokio::test]
    async fn test_rejected_files_never_start() {
        let fx = fixture(5);
        fs::write(fx.out.join("done_converted.mp4"), b"x").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(source(&fx.watch, "notes.txt")).unwrap();
        tx.send(source(&fx.watch, "done.mov")).unwrap();
        let fresh = source(&fx.watch, "fresh.webm");
        tx.send(fresh.clone()).unwrap();
        tx.send(fresh).unwrap();
        drop(tx);

        let stats = fx.daemon.run_loop(rx).await.unwrap();

        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.started, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_missing_encoder_fails_every_task() {
        let mut fx = fixture(2);
        fx.daemon.settings.ffmpeg = fx.watch.join("no-such-ffmpeg");

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(source(&fx.watch, "a.mov")).unwrap();
        tx.send(source(&fx.watch, "b.mov")).unwrap();
        tx.send(source(&fx.watch, "c.mov")).unwrap();
        drop(tx);

        let stats = fx.daemon.run_loop(rx).await.unwrap();
        assert_eq!(stats.started, 3);
        assert_eq!(stats.failed, 3);
    }
}
