//! Cooperative worker runtime.
//!
//! Each pipeline stage runs as a long-lived worker: a dedicated thread that
//! repeatedly invokes a step function. The step reports what happened and
//! the scheduler reacts:
//!
//! - [`StepOutcome::Ok`]: work was done, re-invoke immediately.
//! - [`StepOutcome::Idle`]: nothing productive, sleep ~1 ms before the
//!   next attempt.
//! - [`StepOutcome::Error`]: fatal condition; the worker latches its
//!   failure flag and exits.
//!
//! Steps must only use non-blocking queue operations so a worker can always
//! be stopped between invocations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Sleep applied after an idle step.
pub const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Result of one worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Work was done; call again immediately.
    Ok,
    /// Nothing to do right now; back off briefly.
    Idle,
    /// Fatal condition; stop the worker.
    Error,
}

/// A worker thread driving a step function until stopped or failed.
pub struct WorkerThread {
    name: String,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn a named worker running `step` in its own thread.
    pub fn spawn<F>(name: &str, mut step: F) -> Self
    where
        F: FnMut() -> StepOutcome + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_failed = Arc::clone(&failed);
        let thread_name = name.to_owned();

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                debug!(worker = %thread_name, "worker started");
                while !thread_stop.load(Ordering::Acquire) {
                    match step() {
                        StepOutcome::Ok => {}
                        StepOutcome::Idle => thread::sleep(IDLE_SLEEP),
                        StepOutcome::Error => {
                            error!(worker = %thread_name, "worker step failed, stopping");
                            thread_failed.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
                debug!(worker = %thread_name, "worker exited");
            })
            .expect("failed to spawn worker thread");

        Self {
            name: name.to_owned(),
            stop,
            failed,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to exit after its current step.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Block until the worker thread is dead. Idempotent.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
                self.failed.store(true, Ordering::Release);
            }
        }
    }

    /// True once the worker stopped because a step returned `Error` (or
    /// panicked).
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_runs_until_stopped() {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let mut w = WorkerThread::spawn("counter", move || {
            c.fetch_add(1, Ordering::Relaxed);
            StepOutcome::Ok
        });
        while count.load(Ordering::Relaxed) < 100 {
            thread::yield_now();
        }
        w.stop();
        w.join();
        assert!(!w.has_failed());
        assert!(count.load(Ordering::Relaxed) >= 100);
    }

    #[test]
    fn test_error_latches_failure() {
        let mut w = WorkerThread::spawn("failing", || StepOutcome::Error);
        w.join();
        assert!(w.has_failed());
    }

    #[test]
    fn test_idle_worker_stops_promptly() {
        let mut w = WorkerThread::spawn("idle", || StepOutcome::Idle);
        thread::sleep(Duration::from_millis(5));
        w.stop();
        w.join();
        assert!(!w.has_failed());
    }
}
