//! Cooperative progress reporting and cancellation.
//!
//! Every long-running operation takes a [`Progress`] handle and polls
//! [`Progress::cancel_requested`] between rows or outer-loop iterations.
//! Cancellation is cooperative: the operation returns
//! [`CoreError::Cancelled`](crate::CoreError::Cancelled) without leaking
//! resources, and caches only ever publish fully built entries.
//!
//! The handle also guards stdout interleaving: reporters that draw progress
//! bars call [`Progress::pause_stdout`] around their own prints so log lines
//! from worker threads do not tear the display.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared, thread-safe progress handle. Cloning is cheap; all clones report
/// into the same state.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    step: AtomicUsize,
    total: AtomicUsize,
    task: Mutex<String>,
    stdout_paused: AtomicBool,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a named task with a known number of steps. Resets the counter.
    pub fn set_task(&self, name: &str, total_steps: usize) {
        *self.inner.task.lock().unwrap() = name.to_string();
        self.inner.total.store(total_steps, Ordering::Relaxed);
        self.inner.step.store(0, Ordering::Relaxed);
        tracing::debug!(task = name, total_steps, "task started");
    }

    pub fn inc_progress(&self) {
        self.inner.step.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_progress(&self, step: usize) {
        self.inner.step.store(step, Ordering::Relaxed);
    }

    /// `(task, step, total)` snapshot for UIs.
    pub fn status(&self) -> (String, usize, usize) {
        (
            self.inner.task.lock().unwrap().clone(),
            self.inner.step.load(Ordering::Relaxed),
            self.inner.total.load(Ordering::Relaxed),
        )
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn cancel_requested(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Stop drawing to stdout until [`resume_stdout`](Self::resume_stdout).
    pub fn pause_stdout(&self) {
        self.inner.stdout_paused.store(true, Ordering::Relaxed);
    }

    pub fn resume_stdout(&self) {
        self.inner.stdout_paused.store(false, Ordering::Relaxed);
    }

    pub fn stdout_paused(&self) -> bool {
        self.inner.stdout_paused.load(Ordering::Relaxed)
    }

    /// Convenience used at loop heads: maps a pending cancellation to the
    /// library error so callers can `check_cancel(p)?`.
    pub fn check(&self) -> crate::CoreResult<()> {
        if self.cancel_requested() {
            Err(crate::CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Either a real handle or a no-op, so internal code does not need
/// `Option<&Progress>` plumbing at every call site.
pub fn check_cancel(progress: Option<&Progress>) -> crate::CoreResult<()> {
    match progress {
        Some(p) => p.check(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_propagates_to_clones() {
        let p = Progress::new();
        let q = p.clone();
        assert!(!q.cancel_requested());
        p.cancel();
        assert!(q.cancel_requested());
        assert!(q.check().is_err());
    }

    #[test]
    fn task_state_tracks_steps() {
        let p = Progress::new();
        p.set_task("analyzing", 10);
        p.inc_progress();
        p.inc_progress();
        let (task, step, total) = p.status();
        assert_eq!(task, "analyzing");
        assert_eq!(step, 2);
        assert_eq!(total, 10);
    }
}
