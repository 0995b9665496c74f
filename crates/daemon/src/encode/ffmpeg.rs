//! FFmpeg encoder module for clipwatch
//!
//! Builds the ffmpeg command line with fixed H.264/AAC settings, runs it as a
//! child process and turns its output into a typed event stream: any number of
//! progress events followed by exactly one `End` or `Error`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// Video codec for every conversion
pub const VIDEO_CODEC: &str = "libx264";
/// Audio codec for every conversion
pub const AUDIO_CODEC: &str = "aac";
/// Pixel format, compatible with most players
pub const PIXEL_FORMAT: &str = "yuv420p";
/// Constant rate factor, standard quality/size balance
pub const CRF: &str = "23";

/// Number of stderr lines kept for failure messages
const STDERR_TAIL_LINES: usize = 4;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg could not be started
    #[error("Failed to start ffmpeg: {0}")]
    Spawn(std::io::Error),

    /// ffmpeg exited with non-zero status
    #[error("ffmpeg exited with code {code}: {message}")]
    Failed { code: i32, message: String },

    /// ffmpeg was terminated by a signal
    #[error("ffmpeg was terminated by signal: {message}")]
    Terminated { message: String },

    /// IO error while supervising the process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one ffmpeg invocation
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Resolved ffmpeg executable
    pub ffmpeg: PathBuf,
    /// Path to the source video
    pub input_path: PathBuf,
    /// Path for the converted output
    pub output_path: PathBuf,
}

impl EncodeParams {
    pub fn new(ffmpeg: PathBuf, input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            ffmpeg,
            input_path,
            output_path,
        }
    }
}

/// Advisory progress sample reported by the encoder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderProgress {
    /// Percent complete, when the source duration is known
    pub percent: Option<f32>,
    /// Output position, e.g. `00:01:02.500000`
    pub timemark: Option<String>,
    /// Current output bitrate in kbit/s
    pub kbps: Option<f64>,
}

/// Signals observed from a running encoder
#[derive(Debug)]
pub enum EncoderEvent {
    Progress(EncoderProgress),
    End,
    Error(EncodeError),
}

/// Build an ffmpeg command with all conversion flags
///
/// `-progress pipe:1` makes ffmpeg write machine-readable key=value blocks to
/// stdout; human-readable logs (including the source duration) stay on stderr.
pub fn build_ffmpeg_command(params: &EncodeParams) -> Command {
    let mut cmd = Command::new(&params.ffmpeg);

    cmd.arg("-hide_banner");
    cmd.arg("-y");
    cmd.arg("-i").arg(&params.input_path);

    cmd.arg("-c:v").arg(VIDEO_CODEC);
    cmd.arg("-c:a").arg(AUDIO_CODEC);
    cmd.arg("-pix_fmt").arg(PIXEL_FORMAT);
    cmd.arg("-crf").arg(CRF);

    cmd.arg("-progress").arg("pipe:1");
    cmd.arg("-nostats");

    cmd.arg(&params.output_path);

    cmd
}

/// Start ffmpeg and return the receiving end of its event stream.
///
/// Must be called from within a tokio runtime. The stream always ends with
/// exactly one [`EncoderEvent::End`] or [`EncoderEvent::Error`].
pub fn spawn_encoder(params: &EncodeParams) -> Result<mpsc::Receiver<EncoderEvent>, EncodeError> {
    let mut cmd = tokio::process::Command::from(build_ffmpeg_command(params));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running {:?}", cmd.as_std());
    let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EncodeError::Spawn(pipe_missing("stdout")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EncodeError::Spawn(pipe_missing("stderr")))?;

    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut progress_lines = BufReader::new(stdout).lines();
        let mut log_lines = BufReader::new(stderr).lines();
        let mut parser = ProgressParser::default();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut progress_open = true;
        let mut log_open = true;

        while progress_open || log_open {
            tokio::select! {
                line = progress_lines.next_line(), if progress_open => match line {
                    Ok(Some(line)) => {
                        if let Some(sample) = parser.feed_progress_line(&line) {
                            // Receiver gone means nobody is listening; keep draining.
                            let _ = tx.send(EncoderEvent::Progress(sample)).await;
                        }
                    }
                    _ => progress_open = false,
                },
                line = log_lines.next_line(), if log_open => match line {
                    Ok(Some(line)) => {
                        parser.feed_log_line(&line);
                        if !line.trim().is_empty() {
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.trim().to_string());
                        }
                    }
                    _ => log_open = false,
                },
            }
        }

        let message = if tail.is_empty() {
            "no output".to_string()
        } else {
            tail.into_iter().collect::<Vec<_>>().join(" | ")
        };

        let terminal = match child.wait().await {
            Ok(status) if status.success() => EncoderEvent::End,
            Ok(status) => match status.code() {
                Some(code) => EncoderEvent::Error(EncodeError::Failed { code, message }),
                None => EncoderEvent::Error(EncodeError::Terminated { message }),
            },
            Err(e) => EncoderEvent::Error(EncodeError::Io(e)),
        };
        let _ = tx.send(terminal).await;
    });

    Ok(rx)
}

fn pipe_missing(name: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("{} was not captured", name),
    )
}

/// Incremental parser for ffmpeg's stderr log and `-progress` output
#[derive(Debug, Default)]
pub struct ProgressParser {
    total_secs: Option<f64>,
    current: EncoderProgress,
    out_secs: Option<f64>,
}

impl ProgressParser {
    /// Source duration, once ffmpeg has logged it
    pub fn total_secs(&self) -> Option<f64> {
        self.total_secs
    }

    /// Look for the `Duration: HH:MM:SS.xx` line of the input description
    pub fn feed_log_line(&mut self, line: &str) {
        if self.total_secs.is_some() {
            return;
        }
        let Some(rest) = line.trim_start().strip_prefix("Duration:") else {
            return;
        };
        let stamp = rest.trim().split(',').next().unwrap_or("").trim();
        self.total_secs = parse_timestamp(stamp).filter(|secs| *secs > 0.0);
    }

    /// Feed one `key=value` line; returns a sample at the end of each block
    pub fn feed_progress_line(&mut self, line: &str) -> Option<EncoderProgress> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // Both keys carry microseconds.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_secs = Some(us.max(0) as f64 / 1_000_000.0);
                }
            }
            "out_time" => {
                if value != "N/A" {
                    self.current.timemark = Some(value.to_string());
                }
            }
            "bitrate" => {
                self.current.kbps = value
                    .strip_suffix("kbits/s")
                    .and_then(|v| v.trim().parse::<f64>().ok());
            }
            "progress" => {
                self.current.percent = match (self.out_secs, self.total_secs) {
                    (Some(out), Some(total)) => {
                        Some(((out / total) * 100.0).clamp(0.0, 100.0) as f32)
                    }
                    _ => None,
                };
                return Some(self.current.clone());
            }
            _ => {}
        }
        None
    }
}

/// Parse `HH:MM:SS(.fraction)` into seconds
pub fn parse_timestamp(stamp: &str) -> Option<f64> {
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.trim().parse().ok()?;
    let minutes: f64 = parts.next()?.trim().parse().ok()?;
    let seconds: f64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
