//! Directory watcher for clipwatch
//!
//! Combines a recursive notify watch with an initial walk of the watch
//! directory, runs candidates through a [`StabilityTracker`] and emits each
//! write-stable file once on a channel.

use crate::filter::{is_hidden, OUTPUT_SUFFIX};
use crate::stability::StabilityTracker;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Error type for watcher setup
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// What to watch and how long files must be quiet before they are emitted
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub stability_threshold: Duration,
    pub poll_interval: Duration,
}

impl WatchOptions {
    /// True for paths the watcher never reports.
    ///
    /// Hidden entries are skipped. So are converted files: anything under the
    /// output directory, or, when output and watch directory are the same,
    /// files carrying the conversion suffix.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if is_hidden(path, &self.watch_dir) {
            return true;
        }
        if self.output_dir == self.watch_dir {
            return path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map_or(false, |stem| stem.ends_with(OUTPUT_SUFFIX));
        }
        path.starts_with(&self.output_dir)
    }
}

/// How often reported paths that vanished without a remove event are forgotten
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

enum RawEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

/// Running watcher; dropping it stops notifications and the tracker task
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching and return the stream of stable files.
///
/// Files present before the call are reported as well. Must be called from
/// within a tokio runtime.
pub fn start_watcher(
    opts: WatchOptions,
) -> Result<(DirectoryWatcher, mpsc::UnboundedReceiver<PathBuf>), WatchError> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawEvent>();
    let (discovered_tx, discovered_rx) = mpsc::unbounded_channel::<PathBuf>();

    let filter = opts.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!("Watch error: {}", e);
                return;
            }
        };
        let removed = event.kind.is_remove();
        if !(removed || event.kind.is_create() || event.kind.is_modify()) {
            return;
        }
        for path in event.paths {
            if filter.is_ignored(&path) {
                continue;
            }
            let raw = if removed {
                RawEvent::Removed(path)
            } else {
                RawEvent::Changed(path)
            };
            // Closed channel means the tracker task is gone.
            let _ = raw_tx.send(raw);
        }
    })
    .map_err(|source| WatchError::Notify {
        path: opts.watch_dir.clone(),
        source,
    })?;

    watcher
        .watch(&opts.watch_dir, RecursiveMode::Recursive)
        .map_err(|source| WatchError::Notify {
            path: opts.watch_dir.clone(),
            source,
        })?;
    info!("Watching directory: {}", opts.watch_dir.display());

    let task = tokio::spawn(track(opts, raw_rx, discovered_tx));

    Ok((
        DirectoryWatcher {
            _watcher: watcher,
            task,
        },
        discovered_rx,
    ))
}

async fn track(
    opts: WatchOptions,
    mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    discovered_tx: mpsc::UnboundedSender<PathBuf>,
) {
    let mut tracker = StabilityTracker::new(opts.stability_threshold);

    let scan_opts = opts.clone();
    match tokio::task::spawn_blocking(move || scan_existing(&scan_opts)).await {
        Ok(existing) => {
            debug!("Initial scan found {} files", existing.len());
            for path in existing {
                tracker.observe(path);
            }
        }
        Err(e) => warn!("Initial scan of {} failed: {}", opts.watch_dir.display(), e),
    }

    let mut poll = tokio::time::interval(opts.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut prune =
        tokio::time::interval_at(tokio::time::Instant::now() + PRUNE_INTERVAL, PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(RawEvent::Changed(path)) => tracker.observe(path),
                Some(RawEvent::Removed(path)) => tracker.forget(&path),
                None => break,
            },
            _ = poll.tick() => {
                for path in tracker.poll() {
                    debug!("File settled: {}", path.display());
                    if discovered_tx.send(path).is_err() {
                        return;
                    }
                }
            }
            _ = prune.tick() => {
                let dropped = tracker.prune_missing();
                if dropped > 0 {
                    debug!("Forgot {} vanished files", dropped);
                }
            }
        }
    }
}

/// Regular files already inside the watch directory, in walk order
pub fn scan_existing(opts: &WatchOptions) -> Vec<PathBuf> {
    WalkDir::new(&opts.watch_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !opts.is_ignored(entry.path()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}
