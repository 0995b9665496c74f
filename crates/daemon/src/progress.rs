//! Live progress block for running conversions
//!
//! Every active job gets one `  <name>: Converting...` line. A single shared
//! clock task advances the dot animation and redraws the block in place. The
//! clock is started when the first job registers and stopped when the last one
//! leaves, so it never runs with an empty registry.
//!
//! The animation is cosmetic only and carries no job state.
//!
//! Log output must pass through [`ProgressReporter::log_writer`] so each
//! record is written with the block erased and redrawn below it.

use crate::job::JobId;
use crossterm::cursor::{MoveToColumn, MoveUp};
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Redraw period of the shared animation clock
pub const ANIMATION_PERIOD: Duration = Duration::from_millis(500);

/// Number of animation phases (0 to 3 dots)
const PHASES: u8 = 4;

struct Entry {
    name: String,
    phase: u8,
}

struct ReporterState {
    entries: BTreeMap<JobId, Entry>,
    clock: Option<JoinHandle<()>>,
    out: Box<dyn Write + Send>,
    log_out: Box<dyn Write + Send>,
    rendered_lines: u16,
    clock_starts: u64,
    clock_stops: u64,
}

/// Registry of active jobs plus the shared animation clock
#[derive(Clone)]
pub struct ProgressReporter {
    state: Arc<Mutex<ReporterState>>,
    period: Duration,
}

impl ProgressReporter {
    /// Reporter drawing to stdout at the default period
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()), ANIMATION_PERIOD)
    }

    /// Reporter drawing to `out`; log records go to stderr
    pub fn new(out: Box<dyn Write + Send>, period: Duration) -> Self {
        Self::with_log_output(out, Box::new(io::stderr()), period)
    }

    /// Reporter drawing to `out` and writing log records to `log_out`
    pub fn with_log_output(
        out: Box<dyn Write + Send>,
        log_out: Box<dyn Write + Send>,
        period: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReporterState {
                entries: BTreeMap::new(),
                clock: None,
                out,
                log_out,
                rendered_lines: 0,
                clock_starts: 0,
                clock_stops: 0,
            })),
            period,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        lock_state(&self.state)
    }

    /// Add a job line; starts the clock on the first registration
    pub fn register(&self, id: JobId, name: &str) {
        let clock_started = {
            let mut state = self.lock();
            state.entries.insert(
                id,
                Entry {
                    name: name.to_string(),
                    phase: 0,
                },
            );
            redraw(&mut state);

            if state.clock.is_some() {
                true
            } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let weak = Arc::downgrade(&self.state);
                state.clock = Some(handle.spawn(run_clock(weak, self.period)));
                state.clock_starts += 1;
                true
            } else {
                false
            }
        };

        // Logged after unlocking: the log writer takes the same lock.
        if !clock_started {
            warn!("No async runtime; progress animation disabled");
        }
    }

    /// Remove a job line; stops the clock when the registry empties
    pub fn unregister(&self, id: JobId) {
        let mut state = self.lock();
        if state.entries.remove(&id).is_none() {
            return;
        }

        if state.entries.is_empty() {
            if let Some(clock) = state.clock.take() {
                clock.abort();
                state.clock_stops += 1;
            }
        }
        redraw(&mut state);
    }

    /// Advance every entry's animation phase and redraw
    pub fn tick(&self) {
        tick_locked(&mut self.lock());
    }

    /// Print a message above the progress block without tearing it
    pub fn print(&self, message: &str) {
        let mut state = self.lock();
        let _ = clear_block(&mut state);
        let _ = writeln!(state.out, "{}", message);
        redraw(&mut state);
    }

    /// Writer for one log record; the record is emitted on flush or drop.
    ///
    /// Suitable as a `tracing_subscriber` writer factory:
    /// `.with_writer(move || reporter.log_writer())`.
    pub fn log_writer(&self) -> LogWriter {
        LogWriter {
            reporter: self.clone(),
            pending: Vec::new(),
        }
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_clock_running(&self) -> bool {
        self.lock().clock.is_some()
    }

    /// How many times the clock has been started
    pub fn clock_starts(&self) -> u64 {
        self.lock().clock_starts
    }

    /// How many times the clock has been stopped
    pub fn clock_stops(&self) -> u64 {
        self.lock().clock_stops
    }

    #[cfg(test)]
    fn phase_of(&self, id: JobId) -> Option<u8> {
        self.lock().entries.get(&id).map(|e| e.phase)
    }
}

/// Buffered log record that is written above the progress block
pub struct LogWriter {
    reporter: ProgressReporter,
    pending: Vec<u8>,
}

impl LogWriter {
    fn emit(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut state = self.reporter.lock();
        let cleared = clear_block(&mut state).and_then(|_| state.out.flush());
        let written = state
            .log_out
            .write_all(&self.pending)
            .and_then(|_| state.log_out.flush());
        self.pending.clear();
        redraw(&mut state);
        cleared.and(written)
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.emit();
    }
}

fn lock_state(state: &Mutex<ReporterState>) -> MutexGuard<'_, ReporterState> {
    // Rendering state stays usable even if a writer panicked mid-frame.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_clock(state: Weak<Mutex<ReporterState>>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        tick_locked(&mut lock_state(&state));
    }
}

fn tick_locked(state: &mut ReporterState) {
    if state.entries.is_empty() {
        return;
    }
    for entry in state.entries.values_mut() {
        entry.phase = (entry.phase + 1) % PHASES;
    }
    redraw(state);
}

fn redraw(state: &mut ReporterState) {
    // Output errors (closed terminal, broken pipe) only affect cosmetics.
    let _ = render(state);
}

/// Move back to the top of the previous block and erase it
fn clear_block(state: &mut ReporterState) -> io::Result<()> {
    let lines = state.rendered_lines;
    if lines > 0 {
        queue!(
            state.out,
            MoveUp(lines),
            MoveToColumn(0),
            Clear(ClearType::FromCursorDown)
        )?;
        state.rendered_lines = 0;
    }
    Ok(())
}

fn render(state: &mut ReporterState) -> io::Result<()> {
    clear_block(state)?;

    let ReporterState {
        entries,
        out,
        rendered_lines,
        ..
    } = state;

    for entry in entries.values() {
        let dots = ".".repeat(entry.phase as usize);
        queue!(
            out,
            Print(format!("  {}: Converting{}", entry.name, dots)),
            Print("\n")
        )?;
    }
    *rendered_lines = u16::try_from(entries.len()).unwrap_or(u16::MAX);
    out.flush()
}
