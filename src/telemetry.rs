//! Rolling performance telemetry.
//!
//! `TelemetryWindow` keeps the last N `CycleRecord`s in a ring buffer (oldest
//! evicted first) plus a short memory history. All methods take `&self`; state sits
//! behind one mutex so a reader never observes a half-applied write.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Memory samples kept for the peak/latest figures.
const MAX_MEMORY_SAMPLES: usize = 100;
/// Records allocated up front; larger windows grow on demand.
const PREALLOCATED_RECORDS: usize = 1024;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Timings of one capture -> (detect) -> present cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleRecord {
    pub capture: Duration,
    /// `None` when detection did not run this cycle.
    pub detect: Option<Duration>,
    /// `None` when nothing was presented.
    pub present: Option<Duration>,
    /// The cycle presented no frame.
    pub skipped: bool,
    pub timestamp: Instant,
}

impl CycleRecord {
    pub fn presented(
        capture: Duration,
        detect: Option<Duration>,
        present: Duration,
        timestamp: Instant,
    ) -> Self {
        Self {
            capture,
            detect,
            present: Some(present),
            skipped: false,
            timestamp,
        }
    }

    pub fn skipped(capture: Duration, timestamp: Instant) -> Self {
        Self {
            capture,
            detect: None,
            present: None,
            skipped: true,
            timestamp,
        }
    }
}

/// Mean duration per stage over the records where that stage ran.
/// Zero when the stage never ran inside the window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageAverages {
    pub capture: Duration,
    pub detect: Duration,
    pub present: Duration,
}

#[derive(Default)]
struct Totals {
    cycles: u64,
    presented: u64,
    skipped: u64,
    detected: u64,
}

struct WindowState {
    records: VecDeque<CycleRecord>,
    memory_mb: VecDeque<f64>,
    memory_peak_mb: f64,
    totals: Totals,
}

pub struct TelemetryWindow {
    capacity: usize,
    inner: Mutex<WindowState>,
}

impl TelemetryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(WindowState {
                records: VecDeque::with_capacity(capacity.min(PREALLOCATED_RECORDS)),
                memory_mb: VecDeque::with_capacity(MAX_MEMORY_SAMPLES),
                memory_peak_mb: 0.0,
                totals: Totals::default(),
            }),
        }
    }

    /// Window sized for `seconds` of history at `target_fps`.
    pub fn for_rate(target_fps: f64, seconds: f64) -> Self {
        Self::new((target_fps * seconds).ceil().max(1.0) as usize)
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Append a record, evicting the oldest beyond capacity.
    pub fn record(&self, record: CycleRecord) {
        let mut state = self.lock();
        state.totals.cycles += 1;
        if record.skipped {
            state.totals.skipped += 1;
        } else {
            state.totals.presented += 1;
        }
        if record.detect.is_some() {
            state.totals.detected += 1;
        }
        while state.records.len() >= self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(record);
    }

    /// Copy of the retained records, oldest first.
    pub fn records(&self) -> Vec<CycleRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn current_fps(&self) -> f64 {
        self.current_fps_at(Instant::now())
    }

    /// Presented frames per second over the trailing one-second window ending at `now`.
    ///
    /// When the retained history is shorter than a second the rate is taken over the
    /// span it does cover. Returns 0.0 for an empty or single-frame history.
    pub fn current_fps_at(&self, now: Instant) -> f64 {
        let state = self.lock();
        let Some(oldest) = state.records.front().map(|r| r.timestamp) else {
            return 0.0;
        };

        if let Some(window_start) = now.checked_sub(FPS_WINDOW) {
            if oldest <= window_start {
                let count = state
                    .records
                    .iter()
                    .filter(|r| !r.skipped && r.timestamp > window_start && r.timestamp <= now)
                    .count();
                return count as f64 / FPS_WINDOW.as_secs_f64();
            }
        }

        let mut presented = state
            .records
            .iter()
            .filter(|r| !r.skipped && r.timestamp <= now)
            .map(|r| r.timestamp);
        let Some(first) = presented.next() else {
            return 0.0;
        };
        let (count, last) = presented.fold((1usize, first), |(n, _), ts| (n + 1, ts));
        let span = last.saturating_duration_since(first).as_secs_f64();
        if count < 2 || span <= 0.0 {
            return 0.0;
        }
        (count - 1) as f64 / span
    }

    pub fn is_below_target(&self, target_fps: f64) -> bool {
        self.current_fps() < target_fps
    }

    pub fn average_stage_durations(&self) -> StageAverages {
        let state = self.lock();
        let capture = mean(state.records.iter().map(|r| Some(r.capture)));
        let detect = mean(state.records.iter().map(|r| r.detect));
        let present = mean(state.records.iter().map(|r| r.present));
        StageAverages {
            capture,
            detect,
            present,
        }
    }

    pub fn record_memory(&self, memory_mb: f64) {
        let mut state = self.lock();
        if state.memory_mb.len() >= MAX_MEMORY_SAMPLES {
            state.memory_mb.pop_front();
        }
        state.memory_mb.push_back(memory_mb);
        if memory_mb > state.memory_peak_mb {
            state.memory_peak_mb = memory_mb;
        }
    }

    pub fn latest_memory_mb(&self) -> Option<f64> {
        self.lock().memory_mb.back().copied()
    }

    pub fn memory_peak_mb(&self) -> f64 {
        self.lock().memory_peak_mb
    }

    /// Release spare buffer capacity and drop the memory history.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.memory_mb.clear();
        state.memory_mb.shrink_to_fit();
        state.records.shrink_to(self.capacity);
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let fps = self.current_fps();
        let averages = self.average_stage_durations();
        let state = self.lock();
        PerformanceSnapshot {
            fps,
            averages,
            cycles: state.totals.cycles,
            frames_presented: state.totals.presented,
            frames_skipped: state.totals.skipped,
            detection_runs: state.totals.detected,
            memory_mb: state.memory_mb.back().copied(),
            memory_peak_mb: state.memory_peak_mb,
        }
    }
}

fn mean(durations: impl Iterator<Item = Option<Duration>>) -> Duration {
    let (total, count) = durations
        .flatten()
        .fold((Duration::ZERO, 0u32), |(sum, n), d| (sum + d, n + 1));
    if count == 0 {
        Duration::ZERO
    } else {
        total / count
    }
}

/// Point-in-time performance figures.
#[derive(Clone, Debug)]
pub struct PerformanceSnapshot {
    pub fps: f64,
    pub averages: StageAverages,
    pub cycles: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub detection_runs: u64,
    pub memory_mb: Option<f64>,
    pub memory_peak_mb: f64,
}

impl PerformanceSnapshot {
    /// Advice for an operator, empty when the loop is healthy.
    pub fn suggestions(&self, target_fps: f64, max_memory_mb: Option<f64>) -> Vec<String> {
        let mut out = Vec::new();
        if self.fps < target_fps * 0.8 {
            out.push(format!(
                "FPS is low ({:.1}/{:.1}); consider a lower resolution or detection frequency",
                self.fps, target_fps
            ));
        }
        if let (Some(limit), Some(current)) = (max_memory_mb, self.memory_mb) {
            if current > limit * 0.8 {
                out.push(format!(
                    "memory usage is high ({:.1}MB of {:.1}MB)",
                    current, limit
                ));
            }
        }
        let cycle_budget = Duration::from_secs_f64(1.0 / target_fps.max(f64::EPSILON));
        let busy = self.averages.capture + self.averages.detect + self.averages.present;
        if busy > cycle_budget.mul_f64(1.2) {
            out.push(format!(
                "cycle work takes {}ms against a {}ms budget; the detector may be too slow",
                busy.as_millis(),
                cycle_budget.as_millis()
            ));
        }
        if self.cycles > 0 && self.frames_skipped as f64 / self.cycles as f64 > 0.3 {
            out.push(format!(
                "{} of {} cycles presented no frame; the source may be unstable",
                self.frames_skipped, self.cycles
            ));
        }
        if self.frames_presented > 0
            && (self.frames_presented - self.detection_runs.min(self.frames_presented)) as f64
                / self.frames_presented as f64
                > 0.3
        {
            out.push("detection skipped on more than 30% of frames; system may be overloaded".to_string());
        }
        out
    }
}

/// Resident set size of this process in MiB.
#[cfg(target_os = "linux")]
pub fn process_rss_mb() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages as f64 * page_size as f64 / (1024.0 * 1024.0))
}

#[cfg(not(target_os = "linux"))]
pub fn process_rss_mb() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn window_never_exceeds_capacity_and_evicts_fifo() {
        let window = TelemetryWindow::new(4);
        let base = Instant::now();
        for i in 0..10u64 {
            window.record(CycleRecord::presented(ms(i), None, ms(1), base + ms(i)));
            assert!(window.len() <= 4);
        }
        let kept: Vec<Duration> = window.records().iter().map(|r| r.capture).collect();
        assert_eq!(kept, vec![ms(6), ms(7), ms(8), ms(9)]);
    }

    #[test]
    fn huge_capacity_is_not_preallocated() {
        let window = TelemetryWindow::new(usize::MAX);
        assert_eq!(window.capacity(), usize::MAX);
        window.record(CycleRecord::presented(ms(1), None, ms(1), Instant::now()));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn empty_window_reports_zero_fps() {
        let window = TelemetryWindow::new(8);
        assert_eq!(window.current_fps(), 0.0);
        assert!(window.is_below_target(1.0));
    }

    #[test]
    fn fps_counts_presented_frames_in_trailing_second() {
        let window = TelemetryWindow::new(100);
        let base = Instant::now();
        // 20 frames over 2 seconds, every 4th cycle skipped.
        for i in 0..20u64 {
            let ts = base + ms(i * 100);
            if i % 4 == 0 {
                window.record(CycleRecord::skipped(ms(1), ts));
            } else {
                window.record(CycleRecord::presented(ms(1), None, ms(1), ts));
            }
        }
        let now = base + ms(1900);
        // Window (0.9s, 1.9s]: i = 10..=19, of which 12 and 16 were skipped.
        assert_eq!(window.current_fps_at(now), 8.0);
    }

    #[test]
    fn fps_uses_covered_span_for_short_history() {
        let window = TelemetryWindow::new(100);
        let base = Instant::now();
        for i in 0..5u64 {
            window.record(CycleRecord::presented(ms(1), None, ms(1), base + ms(i * 50)));
        }
        let fps = window.current_fps_at(base + ms(200));
        assert!((fps - 20.0).abs() < 1e-6, "fps = {fps}");
    }

    #[test]
    fn stage_averages_only_count_cycles_where_stage_ran() {
        let window = TelemetryWindow::new(10);
        let base = Instant::now();
        window.record(CycleRecord::presented(ms(10), Some(ms(30)), ms(4), base));
        window.record(CycleRecord::presented(ms(20), None, ms(6), base + ms(10)));
        window.record(CycleRecord::skipped(ms(30), base + ms(20)));
        let avg = window.average_stage_durations();
        assert_eq!(avg.capture, ms(20));
        assert_eq!(avg.detect, ms(30));
        assert_eq!(avg.present, ms(5));
    }

    #[test]
    fn snapshot_tracks_totals_beyond_window() {
        let window = TelemetryWindow::new(2);
        let base = Instant::now();
        for i in 0..5u64 {
            window.record(CycleRecord::presented(ms(1), Some(ms(1)), ms(1), base + ms(i)));
        }
        window.record(CycleRecord::skipped(ms(1), base + ms(6)));
        window.record_memory(120.0);
        window.record_memory(80.0);
        let snap = window.snapshot();
        assert_eq!(snap.cycles, 6);
        assert_eq!(snap.frames_presented, 5);
        assert_eq!(snap.frames_skipped, 1);
        assert_eq!(snap.detection_runs, 5);
        assert_eq!(snap.memory_mb, Some(80.0));
        assert_eq!(snap.memory_peak_mb, 120.0);
    }

    #[test]
    fn suggestions_flag_low_fps_and_memory() {
        let snap = PerformanceSnapshot {
            fps: 5.0,
            averages: StageAverages::default(),
            cycles: 10,
            frames_presented: 10,
            frames_skipped: 0,
            detection_runs: 10,
            memory_mb: Some(500.0),
            memory_peak_mb: 500.0,
        };
        let advice = snap.suggestions(15.0, Some(512.0));
        assert_eq!(advice.len(), 2);
        assert!(advice[0].contains("FPS is low"));
        assert!(advice[1].contains("memory"));
    }
}
