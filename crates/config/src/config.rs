//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value is outside its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Directory watching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Directory to watch for new video files
    pub watch_dir: Option<PathBuf>,
    /// Directory converted files are written to
    pub output_dir: Option<PathBuf>,
    /// How long a file's size must stay unchanged before it is picked up
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,
    /// How often pending files are re-checked for stability
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_stability_threshold_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watch_dir: None,
            output_dir: None,
            stability_threshold_ms: default_stability_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Encoder-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Explicit ffmpeg executable (looked up on PATH if None)
    pub ffmpeg_path: Option<PathBuf>,
    /// Interval for the output-size progress fallback
    #[serde(default = "default_progress_poll_ms")]
    pub progress_poll_ms: u64,
}

fn default_progress_poll_ms() -> u64 {
    500
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            progress_poll_ms: default_progress_poll_ms(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of conversions running at once (default 5)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_max_concurrent() -> u32 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    /// Serve the JSON status endpoint (default false)
    #[serde(default)]
    pub enabled: bool,
    /// Listen address for the status endpoint
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - WATCH_DIR -> watch.watch_dir
    /// - OUTPUT_DIR -> watch.output_dir
    /// - STABILITY_THRESHOLD_MS -> watch.stability_threshold_ms
    /// - POLL_INTERVAL_MS -> watch.poll_interval_ms
    /// - FFMPEG_PATH -> encoder.ffmpeg_path
    /// - MAX_CONCURRENT_JOBS -> scheduler.max_concurrent
    /// - STATUS_ENABLED -> status.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_var("WATCH_DIR") {
            self.watch.watch_dir = Some(PathBuf::from(dir));
        }

        if let Some(dir) = non_empty_var("OUTPUT_DIR") {
            self.watch.output_dir = Some(PathBuf::from(dir));
        }

        if let Ok(val) = env::var("STABILITY_THRESHOLD_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.watch.stability_threshold_ms = ms;
            }
        }

        if let Ok(val) = env::var("POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.watch.poll_interval_ms = ms;
            }
        }

        if let Some(path) = non_empty_var("FFMPEG_PATH") {
            self.encoder.ffmpeg_path = Some(PathBuf::from(path));
        }

        if let Ok(val) = env::var("MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.scheduler.max_concurrent = jobs;
            }
        }

        if let Ok(val) = env::var("STATUS_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.status.enabled = true,
                "false" | "0" | "no" => self.status.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.encoder.progress_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "encoder.progress_poll_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but starts from defaults when no file is given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
