//! Filtering policy for discovered files.
//!
//! Decides which files are video sources worth converting and where their
//! converted output lands.

use std::path::{Component, Path, PathBuf};

/// Video file extensions accepted as conversion sources (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mov", ".avi", ".mkv", ".wmv", ".flv", ".webm", ".mp4"];

/// Suffix appended to the source file stem for the converted file.
pub const OUTPUT_SUFFIX: &str = "_converted";

/// Extension of every converted file.
pub const OUTPUT_EXTENSION: &str = "mp4";

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Returns true if any component of `path` below `root` starts with `.`.
///
/// The root itself may be hidden; only entries inside it are considered.
pub fn is_hidden(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => name.to_str().map_or(false, |n| n.starts_with('.')),
        _ => false,
    })
}

/// Constructs the destination path for a source file.
///
/// For example: `/in/movie.mov` with output dir `/out` -> `/out/movie_converted.mp4`
pub fn destination_path(source: &Path, output_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output_dir.join(format!("{}{}.{}", stem, OUTPUT_SUFFIX, OUTPUT_EXTENSION))
}
