//! Live progress for a sweep.
//!
//! [`ProgressDisplay`] prints a line per finished trial and keeps shared
//! counters; [`ProgressMonitor`] logs a periodic summary of those counters so
//! long sweeps can be followed without reading per-trial logs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::result::{TrialResult, TrialState};

/// Snapshot of sweep counters at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub passed: usize,
    pub failed: usize,
    /// Trials that ended in the error state (also counted as failed).
    pub errored: usize,
    /// Trials between setup and done.
    pub running: usize,
    pub elapsed: Duration,
}

/// Shared atomic counters, cloned into every trial task.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub total: Arc<AtomicUsize>,
    pub completed: Arc<AtomicUsize>,
    pub passed: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub errored: Arc<AtomicUsize>,
    pub running: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ProgressCounters {
    pub fn new(total: usize) -> Self {
        Self {
            total: Arc::new(AtomicUsize::new(total)),
            completed: Arc::new(AtomicUsize::new(0)),
            passed: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            errored: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// Renders trial state changes and completions.
#[derive(Debug, Clone)]
pub struct ProgressDisplay {
    counters: ProgressCounters,
    start: Instant,
    /// Print to stderr; counters are kept either way.
    show: bool,
}

impl ProgressDisplay {
    pub fn new(total: usize, show: bool) -> Self {
        Self {
            counters: ProgressCounters::new(total),
            start: Instant::now(),
            show,
        }
    }

    /// A display that only counts.
    pub fn hidden() -> Self {
        Self::new(0, false)
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.counters.snapshot(self.start)
    }

    /// Records a state change of one trial.
    pub fn state_changed(&self, task_id: &str, trial: u32, from: TrialState, to: TrialState) {
        if from == TrialState::Pending && !to.is_terminal() {
            self.counters.running.fetch_add(1, Ordering::Relaxed);
        } else if from != TrialState::Pending && to.is_terminal() {
            let _ = self.counters.running.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        }
        tracing::debug!(task_id = %task_id, trial, from = %from, to = %to, "Trial state changed");
    }

    /// Records a finished trial and prints its line.
    pub fn trial_finished(&self, result: &TrialResult) {
        let completed = self.counters.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if result.passed {
            self.counters.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if result.state == TrialState::Error {
            self.counters.errored.fetch_add(1, Ordering::Relaxed);
        }

        if self.show {
            eprintln!("{}", format_line(result, completed, self.counters.total.load(Ordering::Relaxed)));
        }
    }
}

fn format_line(result: &TrialResult, completed: usize, total: usize) -> String {
    let verdict = match (result.passed, result.state) {
        (true, _) => "PASS ",
        (false, TrialState::Error) => "ERROR",
        (false, _) => "FAIL ",
    };
    let mut line = format!(
        "[{}/{}] {} {} #{} score {:.2} ({:.1}s)",
        completed,
        total,
        verdict,
        result.task_id,
        result.trial,
        result.mean_score(),
        result.duration_ms as f64 / 1000.0
    );
    if let Some(error) = &result.error {
        line.push_str(&format!(": {}", crate::utils::truncate(error, 120)));
    }
    line
}

/// Background task that periodically logs sweep progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn start(display: ProgressDisplay, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = display.snapshot();
                let pct = if snap.total > 0 {
                    (snap.completed as f64 / snap.total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let pass_rate = if snap.completed > 0 {
                    snap.passed as f64 / snap.completed as f64 * 100.0
                } else {
                    0.0
                };

                tracing::info!(
                    completed = snap.completed,
                    total = snap.total,
                    running = snap.running,
                    passed = snap.passed,
                    failed = snap.failed,
                    errored = snap.errored,
                    progress_pct = format!("{:.1}%", pct),
                    pass_rate = format!("{:.1}%", pass_rate),
                    elapsed_secs = snap.elapsed.as_secs(),
                    "Sweep progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(passed: bool, state: TrialState) -> TrialResult {
        let mut r = TrialResult::errored("t", "t", "general", 1, "boom");
        r.passed = passed;
        r.state = state;
        r.duration_ms = 5;
        if state != TrialState::Error {
            r.error = None;
        }
        r
    }

    #[test]
    fn test_counters() {
        let display = ProgressDisplay::new(3, false);
        display.state_changed("t", 1, TrialState::Pending, TrialState::Setup);
        display.state_changed("t", 1, TrialState::Setup, TrialState::Conversation);
        assert_eq!(display.snapshot().running, 1);
        display.state_changed("t", 1, TrialState::Conversation, TrialState::Done);
        assert_eq!(display.snapshot().running, 0);

        display.trial_finished(&finished(true, TrialState::Done));
        display.trial_finished(&finished(false, TrialState::Error));
        let snap = display.snapshot();
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.passed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.errored, 1);
        assert_eq!(snap.running, 0);
    }

    #[test]
    fn test_format_line() {
        let line = format_line(&finished(false, TrialState::Error), 2, 5);
        assert!(line.starts_with("[2/5] ERROR t #1"));
        assert!(line.ends_with(": boom"));
    }

    #[tokio::test]
    async fn test_monitor_stops() {
        let monitor = ProgressMonitor::start(ProgressDisplay::hidden(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop().await;
    }
}
