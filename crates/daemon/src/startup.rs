//! Startup checks module for clipwatch
//!
//! Provides preflight checks run before anything is watched:
//! - watch and output directories are configured and exist
//! - the ffmpeg executable can be resolved and runs

use crate::config::Config;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Executable looked up on PATH when no explicit ffmpeg path is configured
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("{name} is not a directory: {}", path.display())]
    NotADirectory { name: &'static str, path: PathBuf },

    #[error("ffmpeg not found ({0}); install it or set FFMPEG_PATH")]
    EncoderNotFound(String),

    #[error("ffmpeg at {} is not usable: {reason}", path.display())]
    EncoderUnusable { path: PathBuf, reason: String },
}

/// Everything the daemon needs that was checked at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub ffmpeg: PathBuf,
    /// Major version reported by `ffmpeg -version`, if it could be parsed
    pub ffmpeg_major: Option<u32>,
}

/// Require a configured path that points at an existing directory
pub fn check_directory(name: &'static str, path: Option<&Path>) -> Result<PathBuf, StartupError> {
    let path = path.ok_or(StartupError::MissingSetting(name))?;
    if !path.is_dir() {
        return Err(StartupError::NotADirectory {
            name,
            path: path.to_path_buf(),
        });
    }
    Ok(path.to_path_buf())
}

/// Resolve the encoder executable.
///
/// An explicit path (or bare program name) wins; otherwise `ffmpeg` is looked
/// up on PATH.
pub fn resolve_ffmpeg(explicit: Option<&Path>) -> Result<PathBuf, StartupError> {
    let wanted = explicit.unwrap_or_else(|| Path::new(DEFAULT_FFMPEG));
    which::which(wanted)
        .map_err(|e| StartupError::EncoderNotFound(format!("{}: {}", wanted.display(), e)))
}

/// Run `<ffmpeg> -version` and return the parsed major version
pub fn check_ffmpeg_runs(ffmpeg: &Path) -> Result<Option<u32>, StartupError> {
    let output = Command::new(ffmpeg)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::EncoderUnusable {
            path: ffmpeg.to_path_buf(),
            reason: format!("failed to run -version: {}", e),
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnusable {
            path: ffmpeg.to_path_buf(),
            reason: format!("-version exited with {}", output.status),
        });
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ffmpeg_version(&version_output))
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    // Major version sits before the first '.' or '-'
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Run all startup checks in order
///
/// 1. Watch directory
/// 2. Output directory
/// 3. ffmpeg resolution
/// 4. ffmpeg runs
pub fn run_startup_checks(cfg: &Config) -> Result<ResolvedSettings, StartupError> {
    let watch_dir = check_directory("watch_dir", cfg.watch.watch_dir.as_deref())?;
    let output_dir = check_directory("output_dir", cfg.watch.output_dir.as_deref())?;
    let ffmpeg = resolve_ffmpeg(cfg.encoder.ffmpeg_path.as_deref())?;
    let ffmpeg_major = check_ffmpeg_runs(&ffmpeg)?;

    match ffmpeg_major {
        Some(major) => info!("Using ffmpeg {} at {}", major, ffmpeg.display()),
        None => info!("Using ffmpeg at {} (unknown version)", ffmpeg.display()),
    }

    Ok(ResolvedSettings {
        watch_dir,
        output_dir,
        ffmpeg,
        ffmpeg_major,
    })
}
