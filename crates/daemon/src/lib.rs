//! clipwatch
//!
//! Watches a directory for new video files and converts each one to H.264/AAC
//! MP4 with ffmpeg, running a bounded number of conversions at once and
//! queueing the rest.

pub mod daemon;
pub mod encode;
pub mod filter;
pub mod job;
pub mod progress;
pub mod report;
pub mod scheduler;
pub mod stability;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod task;
pub mod watch;

pub use clipwatch_config as config;
pub use clipwatch_config::Config;
pub use daemon::{Daemon, DaemonError};
pub use encode::{
    build_ffmpeg_command, spawn_encoder, EncodeError, EncodeParams, EncoderEvent, EncoderProgress,
};
pub use job::{estimate_percent_from_size, ConversionJob, JobContext, JobId, JobOutcome, JobProgress};
pub use progress::{LogWriter, ProgressReporter};
pub use scheduler::{Admission, ConversionScheduler, JobLauncher, SchedulerStats};
pub use stability::{compare_sizes, StabilityResult, StabilityTracker};
pub use startup::{
    check_directory, check_ffmpeg_runs, parse_ffmpeg_version, resolve_ffmpeg,
    run_startup_checks, ResolvedSettings, StartupError,
};
pub use status::{new_shared_status, SharedStatus, StatusSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use task::{ConversionTask, SkipReason};
pub use watch::{start_watcher, DirectoryWatcher, WatchError, WatchOptions};
