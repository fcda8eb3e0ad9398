//! Collaborator-owning worker threads with bounded calls.
//!
//! Collaborator calls may block for arbitrarily long (a wedged model, a display
//! server that stopped answering). Each collaborator therefore lives on its own
//! thread and the loop talks to it through a `StageWorker`: every call carries a
//! timeout, and a call that overruns is abandoned, not awaited. While an abandoned
//! call is still running the worker reports `Busy` instead of queueing more work.

use anyhow::{Context, Result};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::shutdown::ShutdownSignal;

/// Granularity at which a waiting call re-checks cancellation.
const POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageError {
    /// The call did not finish within its timeout.
    TimedOut(Duration),
    /// An earlier call that timed out is still running.
    Busy,
    /// The worker thread is gone.
    Disconnected,
    /// Shutdown was requested and the grace period ran out.
    Cancelled,
    /// The collaborator panicked.
    Panicked(String),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::TimedOut(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
            StageError::Busy => f.write_str("still busy with a timed-out call"),
            StageError::Disconnected => f.write_str("worker thread stopped"),
            StageError::Cancelled => f.write_str("cancelled by shutdown"),
            StageError::Panicked(msg) => write!(f, "collaborator panicked: {}", msg),
        }
    }
}

impl std::error::Error for StageError {}

type Job<C> = Box<dyn FnOnce(&mut C) + Send>;

pub struct StageWorker<C: Send + 'static> {
    name: &'static str,
    jobs: Option<Sender<Job<C>>>,
    busy: Arc<AtomicBool>,
    cancel: ShutdownSignal,
    grace: Duration,
    join: Option<JoinHandle<()>>,
}

impl<C: Send + 'static> StageWorker<C> {
    /// Move `collaborator` onto a new worker thread.
    ///
    /// Once `cancel` is requested, pending calls get at most `grace` more before
    /// they return `Cancelled`.
    pub fn spawn(
        name: &'static str,
        collaborator: C,
        cancel: ShutdownSignal,
        grace: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job<C>>();
        let join = std::thread::Builder::new()
            .name(format!("vigil-{}", name))
            .spawn(move || {
                let mut collaborator = collaborator;
                while let Ok(job) = rx.recv() {
                    job(&mut collaborator);
                }
                log::debug!("{} worker exiting", name);
            })
            .with_context(|| format!("spawn {} worker", name))?;
        Ok(Self {
            name,
            jobs: Some(tx),
            busy: Arc::new(AtomicBool::new(false)),
            cancel,
            grace,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True while a call (possibly an abandoned one) is executing.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run `f` against the collaborator, waiting at most `timeout`.
    pub fn call<R, F>(&self, timeout: Duration, f: F) -> Result<R, StageError>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> R + Send + 'static,
    {
        self.call_inner(timeout, true, f)
    }

    /// Like `call` but ignores the shutdown signal. Used for release calls during
    /// teardown, which run after shutdown was requested.
    pub fn call_uncancelled<R, F>(&self, timeout: Duration, f: F) -> Result<R, StageError>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> R + Send + 'static,
    {
        self.call_inner(timeout, false, f)
    }

    fn call_inner<R, F>(&self, timeout: Duration, cancellable: bool, f: F) -> Result<R, StageError>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> R + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(StageError::Disconnected)?;
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(StageError::Busy);
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let busy = self.busy.clone();
        let job: Job<C> = Box::new(move |collaborator: &mut C| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(collaborator)));
            busy.store(false, Ordering::SeqCst);
            let _ = reply_tx.send(outcome.map_err(panic_message));
        });
        if jobs.send(job).is_err() {
            self.busy.store(false, Ordering::SeqCst);
            return Err(StageError::Disconnected);
        }

        let mut deadline = Instant::now() + timeout;
        let mut cancelled = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(if cancelled {
                    StageError::Cancelled
                } else {
                    StageError::TimedOut(timeout)
                });
            }
            match reply_rx.recv_timeout((deadline - now).min(POLL_SLICE)) {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(msg)) => return Err(StageError::Panicked(msg)),
                Err(RecvTimeoutError::Timeout) => {
                    if cancellable && !cancelled && self.cancel.is_requested() {
                        cancelled = true;
                        deadline = deadline.min(Instant::now() + self.grace);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.busy.store(false, Ordering::SeqCst);
                    return Err(StageError::Disconnected);
                }
            }
        }
    }

    /// Close the job queue and wait up to `grace` for the thread to exit.
    ///
    /// A thread still stuck in a collaborator call is detached. Returns true when
    /// the thread was joined.
    pub fn stop(mut self, grace: Duration) -> bool {
        self.stop_inner(grace)
    }

    fn stop_inner(&mut self, grace: Duration) -> bool {
        self.jobs = None;
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + grace;
        while !join.is_finished() && Instant::now() < deadline {
            std::thread::sleep(POLL_SLICE);
        }
        if join.is_finished() {
            if join.join().is_err() {
                log::warn!("{} worker thread panicked", self.name);
            }
            true
        } else {
            log::warn!(
                "{} worker did not stop within {}ms; detaching",
                self.name,
                grace.as_millis()
            );
            false
        }
    }
}

impl<C: Send + 'static> Drop for StageWorker<C> {
    fn drop(&mut self) {
        // Never block on drop; a wedged collaborator keeps its thread.
        self.jobs = None;
        self.join = None;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        calls: u32,
    }

    fn worker(cancel: ShutdownSignal) -> StageWorker<Counter> {
        StageWorker::spawn("test", Counter { calls: 0 }, cancel, Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn call_runs_against_owned_collaborator() {
        let worker = worker(ShutdownSignal::new());
        for expected in 1..=3 {
            let calls = worker
                .call(Duration::from_secs(1), |c| {
                    c.calls += 1;
                    c.calls
                })
                .unwrap();
            assert_eq!(calls, expected);
        }
        assert!(worker.stop(Duration::from_secs(1)));
    }

    #[test]
    fn slow_call_times_out_then_reports_busy() {
        let worker = worker(ShutdownSignal::new());
        let err = worker
            .call(Duration::from_millis(20), |_| {
                std::thread::sleep(Duration::from_millis(300))
            })
            .unwrap_err();
        assert_eq!(err, StageError::TimedOut(Duration::from_millis(20)));
        assert_eq!(
            worker.call(Duration::from_millis(20), |_| ()).unwrap_err(),
            StageError::Busy
        );
        std::thread::sleep(Duration::from_millis(400));
        assert!(worker.call(Duration::from_secs(1), |_| ()).is_ok());
    }

    #[test]
    fn panic_is_reported_and_worker_survives() {
        let worker = worker(ShutdownSignal::new());
        let err = worker
            .call(Duration::from_secs(1), |_| -> u32 { panic!("model blew up") })
            .unwrap_err();
        assert_eq!(err, StageError::Panicked("model blew up".to_string()));
        assert!(worker.call(Duration::from_secs(1), |c| c.calls).is_ok());
    }

    #[test]
    fn shutdown_cuts_wait_to_grace_period() {
        let cancel = ShutdownSignal::new();
        let worker = worker(cancel.clone());
        cancel.request();
        let started = Instant::now();
        let err = worker
            .call(Duration::from_secs(10), |_| {
                std::thread::sleep(Duration::from_millis(500))
            })
            .unwrap_err();
        assert_eq!(err, StageError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!worker.stop(Duration::from_millis(10)));
    }

    #[test]
    fn uncancelled_call_ignores_shutdown() {
        let cancel = ShutdownSignal::new();
        let worker = worker(cancel.clone());
        cancel.request();
        let out = worker.call_uncancelled(Duration::from_secs(1), |_| {
            std::thread::sleep(Duration::from_millis(80));
            7
        });
        assert_eq!(out, Ok(7));
    }
}
