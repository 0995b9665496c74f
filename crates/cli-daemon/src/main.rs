//! CLI entry point for clipwatch
//!
//! Loads `.env`, the optional config file and flag overrides, runs the startup
//! checks and then watches until interrupted.

use clap::Parser;
use clipwatch::{Config, Daemon, ProgressReporter};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// clipwatch - convert new videos in a folder to H.264 MP4
#[derive(Parser, Debug)]
#[command(name = "clipwatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to watch for new videos (overrides WATCH_DIR)
    #[arg(long)]
    watch_dir: Option<PathBuf>,

    /// Directory converted files are written to (overrides OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// ffmpeg executable (overrides FFMPEG_PATH)
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Maximum number of conversions running at once
    #[arg(long)]
    max_concurrent: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Flags win over the config file and environment
    fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.watch_dir {
            config.watch.watch_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.output_dir {
            config.watch.output_dir = Some(dir.clone());
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.encoder.ffmpeg_path = Some(ffmpeg.clone());
        }
        if let Some(max) = self.max_concurrent {
            config.scheduler.max_concurrent = max;
        }
    }
}

/// Log to stderr through the progress block so records never tear it
fn init_logging(verbose: bool, reporter: &ProgressReporter) {
    // RUST_LOG wins when set
    let default = if verbose { "clipwatch=debug" } else { "clipwatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let reporter = reporter.clone();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || reporter.log_writer())
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let reporter = ProgressReporter::stdout();
    init_logging(args.verbose, &reporter);

    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    args.apply_to(&mut config);

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon.with_reporter(reporter),
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = daemon.run() => match result {
            Ok(stats) => {
                info!("Stopped: {} converted, {} failed", stats.completed, stats.failed);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Daemon error: {}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            ExitCode::SUCCESS
        }
    }
}
