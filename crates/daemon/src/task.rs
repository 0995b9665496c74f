//! Conversion task descriptors and the admission checks that produce them.

use crate::filter::{destination_path, is_video_file};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Immutable description of one file to convert, created at discovery time.
///
/// Identity is the source path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionTask {
    /// Path of the discovered source file
    pub source_path: PathBuf,
    /// File name shown to the operator
    pub display_name: String,
    /// Where the encoder writes the converted file
    pub output_path: PathBuf,
    /// Source size in bytes at discovery time
    pub input_bytes: u64,
}

/// Why a discovered file was not turned into a task.
///
/// These are filtering decisions, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Extension is not in the accepted video set
    UnsupportedExtension,
    /// A converted file already exists in the output directory
    DestinationExists(PathBuf),
    /// The same source is already running or queued
    AlreadyScheduled,
    /// Another running or queued source converts to the same destination
    DestinationScheduled(PathBuf),
    /// Path is not a regular file
    NotAFile,
    /// Source metadata could not be read
    Unreadable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedExtension => write!(f, "not a valid video file"),
            SkipReason::DestinationExists(path) => {
                write!(f, "already exists in output directory ({})", path.display())
            }
            SkipReason::AlreadyScheduled => write!(f, "already queued or converting"),
            SkipReason::DestinationScheduled(path) => {
                write!(f, "another file is already converting to {}", path.display())
            }
            SkipReason::NotAFile => write!(f, "not a regular file"),
            SkipReason::Unreadable(e) => write!(f, "cannot read file metadata: {}", e),
        }
    }
}

impl ConversionTask {
    /// Build a task without touching the filesystem.
    pub fn new(source_path: PathBuf, output_path: PathBuf, input_bytes: u64) -> Self {
        let display_name = display_name(&source_path);
        Self {
            source_path,
            display_name,
            output_path,
            input_bytes,
        }
    }

    /// Validate a discovered path and describe it as a task.
    ///
    /// Checks, in order: accepted extension, destination not present,
    /// source is a readable regular file.
    pub fn from_discovered(source: &Path, output_dir: &Path) -> Result<Self, SkipReason> {
        if !is_video_file(source) {
            return Err(SkipReason::UnsupportedExtension);
        }

        let output_path = destination_path(source, output_dir);
        if output_path.exists() {
            return Err(SkipReason::DestinationExists(output_path));
        }

        let metadata =
            std::fs::metadata(source).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
        if !metadata.is_file() {
            return Err(SkipReason::NotAFile);
        }

        Ok(Self::new(source.to_path_buf(), output_path, metadata.len()))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
