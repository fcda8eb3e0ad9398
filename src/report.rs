//! Rate-limited failure reporting.
//!
//! Every failure the loop observes goes through `RateLimitedReporter` before any
//! operator-visible output. Per (kind, level) it remembers when it last emitted and
//! how long to wait before the next emission; events inside that interval are only
//! counted, and the count rides along with the next emission.
//!
//! Reporting never fails the caller: sink errors and sink panics are swallowed.

use anyhow::Result;
use log::Level;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::failure::{FailureEvent, FailureKind};

/// Logging collaborator.
pub trait ReportSink: Send {
    fn emit(&mut self, level: Level, message: &str, suppressed: u64) -> Result<()>;

    fn flush(&mut self) {}
}

/// Sink that forwards to the `log` facade.
#[derive(Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&mut self, level: Level, message: &str, suppressed: u64) -> Result<()> {
        if suppressed > 0 {
            log::log!(level, "{} ({} similar errors suppressed)", message, suppressed);
        } else {
            log::log!(level, "{}", message);
        }
        Ok(())
    }

    fn flush(&mut self) {
        log::logger().flush();
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReportPolicy {
    /// First interval after an emission.
    pub base: Duration,
    /// Upper bound for the doubled interval.
    pub cap: Duration,
    /// Silence after which a kind starts over at `base`.
    pub quiet_period: Duration,
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            quiet_period: Duration::from_secs(10),
        }
    }
}

struct Backoff {
    last_emit: Option<Instant>,
    last_event: Option<Instant>,
    interval: Duration,
    suppressed: u64,
    last_message: String,
}

struct ReporterState {
    sink: Box<dyn ReportSink>,
    keys: BTreeMap<(FailureKind, Level), Backoff>,
    emitted: u64,
}

pub struct RateLimitedReporter {
    policy: ReportPolicy,
    state: Mutex<ReporterState>,
}

impl RateLimitedReporter {
    pub fn new(policy: ReportPolicy, sink: Box<dyn ReportSink>) -> Self {
        Self {
            policy,
            state: Mutex::new(ReporterState {
                sink,
                keys: BTreeMap::new(),
                emitted: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report at the default level for the event's kind.
    pub fn report(&self, event: &FailureEvent) {
        let level = match event.kind {
            FailureKind::Capture => Level::Error,
            _ => Level::Warn,
        };
        self.report_at(event, level);
    }

    /// Report `event` at `level`. The event's own timestamp is the clock.
    pub fn report_at(&self, event: &FailureEvent, level: Level) {
        let now = event.timestamp;
        let policy = self.policy;
        let mut state = self.lock();
        let entry = state
            .keys
            .entry((event.kind, level))
            .or_insert_with(|| Backoff {
                last_emit: None,
                last_event: None,
                interval: policy.base,
                suppressed: 0,
                last_message: String::new(),
            });

        if let Some(previous) = entry.last_event {
            if now.saturating_duration_since(previous) >= policy.quiet_period {
                entry.interval = policy.base;
                entry.last_emit = None;
            }
        }
        entry.last_event = Some(now);
        entry.last_message.clone_from(&event.message);

        let due = match entry.last_emit {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= entry.interval,
        };
        if !due {
            entry.suppressed += 1;
            return;
        }

        let suppressed = std::mem::take(&mut entry.suppressed);
        if suppressed > 0 {
            entry.interval = (entry.interval * 2).min(policy.cap);
        }
        entry.last_emit = Some(now);

        let mut message = format!("{}: {}", event.kind, event.message);
        if level <= Level::Warn {
            message.push_str("; hint: ");
            message.push_str(event.kind.troubleshooting());
        }
        emit_quietly(&mut state, level, &message, suppressed);
    }

    /// Emit pending suppressed counts so nothing is lost at teardown.
    pub fn flush(&self) {
        let mut state = self.lock();
        let pending: Vec<(FailureKind, Level, String, u64)> = state
            .keys
            .iter_mut()
            .filter(|(_, b)| b.suppressed > 0)
            .map(|((kind, level), b)| {
                (
                    *kind,
                    *level,
                    b.last_message.clone(),
                    std::mem::take(&mut b.suppressed),
                )
            })
            .collect();
        for (kind, level, message, suppressed) in pending {
            let message = format!("{}: {}", kind, message);
            emit_quietly(&mut state, level, &message, suppressed);
        }
        let _ = panic::catch_unwind(AssertUnwindSafe(|| state.sink.flush()));
    }

    /// Events currently held back for (kind, level).
    pub fn suppressed(&self, kind: FailureKind, level: Level) -> u64 {
        self.lock()
            .keys
            .get(&(kind, level))
            .map(|b| b.suppressed)
            .unwrap_or(0)
    }

    /// Emissions forwarded to the sink so far.
    pub fn emitted(&self) -> u64 {
        self.lock().emitted
    }
}

fn emit_quietly(state: &mut ReporterState, level: Level, message: &str, suppressed: u64) {
    state.emitted += 1;
    let sink = &mut state.sink;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.emit(level, message, suppressed)));
    if !matches!(outcome, Ok(Ok(()))) {
        log::trace!("report sink dropped a message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Arc;

    type Emitted = Arc<Mutex<Vec<(Level, String, u64)>>>;

    struct RecordingSink(Emitted);

    impl ReportSink for RecordingSink {
        fn emit(&mut self, level: Level, message: &str, suppressed: u64) -> Result<()> {
            self.0.lock().unwrap().push((level, message.to_string(), suppressed));
            Ok(())
        }
    }

    struct FailingSink;

    impl ReportSink for FailingSink {
        fn emit(&mut self, _level: Level, _message: &str, _suppressed: u64) -> Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    struct PanickingSink;

    impl ReportSink for PanickingSink {
        fn emit(&mut self, _level: Level, _message: &str, _suppressed: u64) -> Result<()> {
            panic!("sink exploded")
        }
    }

    fn policy() -> ReportPolicy {
        ReportPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(800),
            quiet_period: Duration::from_secs(5),
        }
    }

    fn recording() -> (RateLimitedReporter, Emitted) {
        let emitted: Emitted = Arc::default();
        let reporter = RateLimitedReporter::new(policy(), Box::new(RecordingSink(emitted.clone())));
        (reporter, emitted)
    }

    #[test]
    fn storm_is_limited_to_one_emission_per_window() {
        let (reporter, emitted) = recording();
        let base = Instant::now();
        // One event every 10ms for 3 seconds.
        for i in 0..300u64 {
            let event = FailureEvent::at(
                FailureKind::Inference,
                "timed out",
                base + Duration::from_millis(i * 10),
            );
            reporter.report_at(&event, Level::Warn);
        }
        let emitted = emitted.lock().unwrap();
        // Windows: 0, 100, 300, 700, 1500, 2300 (capped at 800ms).
        assert_eq!(emitted.len(), 6);
        let counts: Vec<u64> = emitted.iter().map(|(_, _, n)| *n).collect();
        assert_eq!(counts[0], 0);
        assert!(counts.windows(2).all(|w| w[0] <= w[1]), "counts = {counts:?}");
        assert!(emitted[0].1.contains("hint:"));
    }

    #[test]
    fn quiet_period_resets_backoff() {
        let (reporter, emitted) = recording();
        let base = Instant::now();
        let at = |ms: u64| FailureEvent::at(FailureKind::Render, "gone", base + Duration::from_millis(ms));
        reporter.report_at(&at(0), Level::Info);
        reporter.report_at(&at(10), Level::Info);
        assert_eq!(reporter.suppressed(FailureKind::Render, Level::Info), 1);
        reporter.report_at(&at(6_000), Level::Info);
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].2, 1);
    }

    #[test]
    fn levels_are_limited_independently() {
        let (reporter, emitted) = recording();
        let now = Instant::now();
        let event = FailureEvent::at(FailureKind::Inference, "slow", now);
        reporter.report_at(&event, Level::Info);
        reporter.report_at(&event, Level::Warn);
        reporter.report_at(&event, Level::Info);
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].0, Level::Warn);
    }

    #[test]
    fn flush_emits_pending_counts() {
        let (reporter, emitted) = recording();
        let now = Instant::now();
        for _ in 0..4 {
            reporter.report(&FailureEvent::at(FailureKind::Capture, "no frame", now));
        }
        reporter.flush();
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1], (Level::Error, "capture: no frame".to_string(), 3));
        assert_eq!(reporter.suppressed(FailureKind::Capture, Level::Error), 0);
    }

    #[test]
    fn sink_failures_are_swallowed() {
        let event = FailureEvent::new(FailureKind::Resource, "oom");
        let failing = RateLimitedReporter::new(policy(), Box::new(FailingSink));
        failing.report(&event);
        let panicking = RateLimitedReporter::new(policy(), Box::new(PanickingSink));
        panicking.report(&event);
        panicking.flush();
        assert_eq!(panicking.emitted(), 1);
    }
}
