//! Stability tracking for files that may still be written to.
//!
//! A discovered file is only handed to the scheduler once its size has stayed
//! unchanged for a configurable threshold. Sizes are re-read on every poll.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Result of comparing two size readings of the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size unchanged between readings.
    Stable,
    /// File size changed between readings.
    Unstable {
        /// Previous reading.
        initial_size: u64,
        /// Latest reading.
        current_size: u64,
    },
}

/// Compare two file sizes and return the appropriate StabilityResult.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    /// Last size reading, `None` until the first poll
    size: Option<u64>,
    /// When `size` was last seen to change
    since: Instant,
}

/// Tracks candidate files until they stop growing.
///
/// Each path is reported at most once until it is forgotten.
#[derive(Debug)]
pub struct StabilityTracker {
    threshold: Duration,
    pending: HashMap<PathBuf, Pending>,
    emitted: HashSet<PathBuf>,
}

impl StabilityTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            pending: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    /// Start tracking a path reported by the watcher
    pub fn observe(&mut self, path: PathBuf) {
        self.observe_at(path, Instant::now());
    }

    pub fn observe_at(&mut self, path: PathBuf, now: Instant) {
        if self.emitted.contains(&path) {
            return;
        }
        self.pending.entry(path).or_insert(Pending {
            size: None,
            since: now,
        });
    }

    /// Drop a path, e.g. after it was removed; it may be reported again later
    pub fn forget(&mut self, path: &Path) {
        self.pending.remove(path);
        self.emitted.remove(path);
    }

    /// Re-read sizes from disk and return the paths that just became stable
    pub fn poll(&mut self) -> Vec<PathBuf> {
        self.poll_at(Instant::now(), |path| {
            std::fs::metadata(path)
                .ok()
                .filter(|m| m.is_file())
                .map(|m| m.len())
        })
    }

    /// Like [`poll`](Self::poll) with an explicit clock and size source.
    ///
    /// A path whose size cannot be read (or that is not a regular file) is
    /// dropped. Results are sorted.
    pub fn poll_at<F>(&mut self, now: Instant, mut size_of: F) -> Vec<PathBuf>
    where
        F: FnMut(&Path) -> Option<u64>,
    {
        let mut settled = Vec::new();
        let mut vanished = Vec::new();

        for (path, pending) in self.pending.iter_mut() {
            let Some(current) = size_of(path) else {
                vanished.push(path.clone());
                continue;
            };

            match pending.size.map(|previous| compare_sizes(previous, current)) {
                Some(StabilityResult::Stable) => {
                    if now.saturating_duration_since(pending.since) >= self.threshold {
                        settled.push(path.clone());
                    }
                }
                Some(StabilityResult::Unstable { .. }) | None => {
                    pending.size = Some(current);
                    pending.since = now;
                }
            }
        }

        for path in vanished {
            self.pending.remove(&path);
        }
        for path in &settled {
            self.pending.remove(path);
            self.emitted.insert(path.clone());
        }

        settled.sort();
        settled
    }

    /// Forget reported paths that no longer exist on disk.
    ///
    /// Covers removals the watcher never delivered; returns how many were
    /// dropped.
    pub fn prune_missing(&mut self) -> usize {
        self.prune_emitted(|path| path.exists())
    }

    /// Like [`prune_missing`](Self::prune_missing) with an explicit existence check
    pub fn prune_emitted<F>(&mut self, mut exists: F) -> usize
    where
        F: FnMut(&Path) -> bool,
    {
        let before = self.emitted.len();
        self.emitted.retain(|path| exists(path));
        before - self.emitted.len()
    }

    /// Number of paths still waiting to settle
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of reported paths remembered for deduplication
    pub fn emitted_len(&self) -> usize {
        self.emitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);

            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                prop_assert_eq!(
                    result,
                    StabilityResult::Unstable { initial_size, current_size }
                );
            }
        }
    }

    const THRESHOLD: Duration = Duration::from_millis(2000);

    fn ms(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    #[test]
    fn test_file_settles_after_threshold() {
        let start = Instant::now();
        let mut tracker = StabilityTracker::new(THRESHOLD);
        tracker.observe_at(PathBuf::from("/w/a.mov"), start);

        assert!(tracker.poll_at(start, |_| Some(100)).is_empty());
        assert!(tracker.poll_at(ms(start, 1900), |_| Some(100)).is_empty());
        assert_eq!(
            tracker.poll_at(ms(start, 2000), |_| Some(100)),
            vec![PathBuf::from("/w/a.mov")]
        );
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn test_growth_resets_the_window() {
        let start = Instant::now();
        let mut tracker = StabilityTracker::new(THRESHOLD);
        tracker.observe_at(PathBuf::from("/w/a.mov"), start);

        tracker.poll_at(start, |_| Some(100));
        tracker.poll_at(ms(start, 1500), |_| Some(200));
        assert!(tracker.poll_at(ms(start, 3000), |_| Some(200)).is_empty());
        assert_eq!(tracker.poll_at(ms(start, 3500), |_| Some(200)).len(), 1);
    }

    #[test]
    fn test_each_path_emitted_once_until_forgotten() {
        let start = Instant::now();
        let path = PathBuf::from("/w/a.mov");
        let mut tracker = StabilityTracker::new(THRESHOLD);

        tracker.observe_at(path.clone(), start);
        tracker.poll_at(start, |_| Some(1));
        assert_eq!(tracker.poll_at(ms(start, 2000), |_| Some(1)).len(), 1);

        tracker.observe_at(path.clone(), ms(start, 2100));
        assert_eq!(tracker.pending_len(), 0);

        tracker.forget(&path);
        tracker.observe_at(path.clone(), ms(start, 3000));
        assert_eq!(tracker.pending_len(), 1);
    }

    #[test]
    fn test_prune_drops_only_vanished_paths() {
        let start = Instant::now();
        let kept = PathBuf::from("/w/kept.mov");
        let moved = PathBuf::from("/w/moved.mov");
        let mut tracker = StabilityTracker::new(Duration::ZERO);
        tracker.observe_at(kept.clone(), start);
        tracker.observe_at(moved.clone(), start);
        tracker.poll_at(start, |_| Some(1));
        assert_eq!(tracker.poll_at(start, |_| Some(1)).len(), 2);
        assert_eq!(tracker.emitted_len(), 2);

        assert_eq!(tracker.prune_emitted(|path| path == kept.as_path()), 1);
        assert_eq!(tracker.emitted_len(), 1);

        // A new file under the pruned name is tracked again; the kept one is not.
        tracker.observe_at(moved, start);
        tracker.observe_at(kept, start);
        assert_eq!(tracker.pending_len(), 1);
    }

    #[test]
    fn test_prune_missing_checks_the_filesystem() {
        let dir = tempfile::TempDir::new().unwrap();
        let present = dir.path().join("present.mp4");
        let deleted = dir.path().join("deleted.mp4");
        std::fs::write(&present, b"p").unwrap();
        std::fs::write(&deleted, b"d").unwrap();

        let mut tracker = StabilityTracker::new(Duration::ZERO);
        tracker.observe(present.clone());
        tracker.observe(deleted.clone());
        tracker.poll();
        assert_eq!(tracker.poll().len(), 2);

        std::fs::remove_file(&deleted).unwrap();
        assert_eq!(tracker.prune_missing(), 1);
        assert_eq!(tracker.emitted_len(), 1);
        assert_eq!(tracker.prune_missing(), 0);
    }

    #[test]
    fn test_unreadable_path_is_dropped() {
        let start = Instant::now();
        let mut tracker = StabilityTracker::new(THRESHOLD);
        tracker.observe_at(PathBuf::from("/w/gone.mov"), start);

        assert!(tracker.poll_at(start, |_| None).is_empty());
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn test_settled_paths_are_sorted() {
        let start = Instant::now();
        let mut tracker = StabilityTracker::new(Duration::ZERO);
        for name in ["c.mkv", "a.mkv", "b.mkv"] {
            tracker.observe_at(PathBuf::from(format!("/w/{}", name)), start);
        }

        tracker.poll_at(start, |_| Some(5));
        let settled = tracker.poll_at(start, |_| Some(5));
        assert_eq!(
            settled,
            vec![
                PathBuf::from("/w/a.mkv"),
                PathBuf::from("/w/b.mkv"),
                PathBuf::from("/w/c.mkv"),
            ]
        );
    }

    #[test]
    fn test_poll_reads_real_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clip.webm");
        std::fs::write(&path, b"abc").unwrap();

        let mut tracker = StabilityTracker::new(Duration::ZERO);
        tracker.observe(path.clone());
        assert!(tracker.poll().is_empty());
        assert_eq!(tracker.poll(), vec![path]);
    }
}
