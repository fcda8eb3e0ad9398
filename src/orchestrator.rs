//! The detection loop.
//!
//! `Orchestrator` owns every other component and is the only caller of the
//! collaborators. One `step()` is one cycle:
//!
//! 1. observe shutdown, then take the prefetched frame from the capture stage
//! 2. ask the governor whether detection runs and at what scale
//! 3. run inference on its worker, bounded by the inference timeout
//! 4. present on the render worker, bounded by the render timeout, and poll input
//! 5. record telemetry, sample memory, feed the cycle outcome to the recovery
//!    engine, carry out its actions and report the failure that drove it
//!
//! No stage call can hold the loop longer than its timeout. A collaborator that
//! overruns keeps its thread; the loop moves on and treats the overrun as a
//! failure of that stage's kind.

use anyhow::Result;
use log::Level;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::detect::InferenceBackend;
use crate::failure::{FailureEvent, FailureKind};
use crate::frame::{map_to_frame, Detection, Frame};
use crate::governor::PerformanceGovernor;
use crate::ingest::{CameraBackend, CaptureOutcome, CaptureStage, SourceProber};
use crate::recovery::{
    CycleOutcome, FatalReason, RecoveryAction, RecoveryEngine, RecoveryState, Transition,
};
use crate::render::{Command, OverlayMeta, Renderer};
use crate::report::{RateLimitedReporter, ReportSink};
use crate::shutdown::ShutdownSignal;
use crate::source::{SourceDescriptor, SourceSelector};
use crate::stage::{StageError, StageWorker};
use crate::telemetry::{process_rss_mb, CycleRecord, PerformanceSnapshot, TelemetryWindow};

/// The external services the loop drives.
pub struct Collaborators {
    pub camera: Arc<dyn CameraBackend>,
    /// Inference backends in fallback order. Empty runs display-only.
    pub inference: Vec<Box<dyn InferenceBackend>>,
    pub renderer: Box<dyn Renderer>,
}

/// How the session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Graceful,
    Fatal(String),
}

impl ExitStatus {
    /// Process exit code: 0 for a graceful stop, 1 after an unrecoverable failure.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Graceful => 0,
            ExitStatus::Fatal(_) => 1,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Graceful => f.write_str("graceful"),
            ExitStatus::Fatal(reason) => write!(f, "fatal ({})", reason),
        }
    }
}

/// Final statistics of a session.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub exit: ExitStatus,
    pub cycles: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub detection_runs: u64,
    pub failures: BTreeMap<FailureKind, u64>,
    pub recovery_attempts: u64,
    pub source_switches: u64,
    pub final_source: String,
    pub detection_enabled: bool,
    pub performance: PerformanceSnapshot,
}

impl RunSummary {
    pub fn failure_count(&self, kind: FailureKind) -> u64 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }
}

/// What one cycle did.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Source the cycle's frame came from, or the active source when none arrived.
    pub source_id: String,
    pub captured: bool,
    pub presented: bool,
    pub detection_ran: bool,
    pub detections: usize,
    /// Engine state after the cycle.
    pub state: RecoveryState,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleStatus {
    Running(CycleReport),
    /// The loop tore down; further steps do nothing.
    Finished,
}

type InferenceWorker = StageWorker<Box<dyn InferenceBackend>>;
type RenderWorker = StageWorker<Box<dyn Renderer>>;

pub struct Orchestrator {
    config: PipelineConfig,
    selector: Arc<SourceSelector>,
    telemetry: TelemetryWindow,
    reporter: RateLimitedReporter,
    governor: PerformanceGovernor,
    recovery: RecoveryEngine,
    capture: Option<CaptureStage>,
    inference: Vec<InferenceWorker>,
    /// Backends configured at start; workers are drained at teardown.
    backend_count: usize,
    active_inference: usize,
    renderer: Option<RenderWorker>,
    prober: Option<SourceProber>,
    shutdown: ShutdownSignal,
    /// The capture worker idles after a failed open; reopen before the next cycle.
    needs_open: bool,
    /// Detection is held off until this instant after an inference backoff.
    detection_retry_at: Option<Instant>,
    cycle: u64,
    failures: BTreeMap<FailureKind, u64>,
    torn_down: bool,
}

impl Orchestrator {
    /// Validate `config`, build every component and open the preferred source.
    pub fn start(
        config: PipelineConfig,
        collaborators: Collaborators,
        sink: Box<dyn ReportSink>,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            camera,
            inference,
            renderer,
        } = collaborators;

        let selector = Arc::new(SourceSelector::new(config.sources.clone())?);
        let telemetry = TelemetryWindow::new(config.telemetry_capacity());
        let reporter = RateLimitedReporter::new(config.report_policy(), sink);
        let governor = PerformanceGovernor::new(config.governor_config());
        let recovery = RecoveryEngine::new(config.recovery_config());

        let mut capture = CaptureStage::spawn(
            camera.clone(),
            config.capture.clone(),
            config.prefetch_depth,
            shutdown.clone(),
        )?;
        let active = selector.active();
        capture.open(active.clone())?;

        let backend_names: Vec<String> = inference.iter().map(|b| b.name().to_string()).collect();
        let inference = inference
            .into_iter()
            .map(|backend| {
                StageWorker::spawn("inference", backend, shutdown.clone(), config.shutdown_grace)
            })
            .collect::<Result<Vec<_>>>()?;
        let renderer =
            StageWorker::spawn("render", renderer, shutdown.clone(), config.shutdown_grace)?;

        let prober = match config.reprobe_interval {
            Some(interval) => Some(SourceProber::spawn(
                camera,
                selector.clone(),
                config.capture.clone(),
                interval,
            )?),
            None => None,
        };

        log::info!(
            "detection loop starting: source={} sources={} target_fps={} inference=[{}]",
            active.id,
            config.sources.len(),
            config.target_fps,
            backend_names.join(", ")
        );
        if inference.is_empty() {
            log::warn!("no inference backend configured; running display-only");
        }

        let mut orchestrator = Self {
            config,
            selector,
            telemetry,
            reporter,
            governor,
            recovery,
            capture: Some(capture),
            backend_count: inference.len(),
            inference,
            active_inference: 0,
            renderer: Some(renderer),
            prober,
            shutdown,
            needs_open: false,
            detection_retry_at: None,
            cycle: 0,
            failures: BTreeMap::new(),
            torn_down: false,
        };
        orchestrator.warm_up_active_backend();
        Ok(orchestrator)
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn active_source(&self) -> SourceDescriptor {
        self.selector.active()
    }

    pub fn selector(&self) -> &SourceSelector {
        &self.selector
    }

    pub fn telemetry(&self) -> &TelemetryWindow {
        &self.telemetry
    }

    pub fn governor(&self) -> &PerformanceGovernor {
        &self.governor
    }

    pub fn reporter(&self) -> &RateLimitedReporter {
        &self.reporter
    }

    /// Handle that stops the loop when requested.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Detection is on: not disabled by recovery and a backend remains.
    pub fn detection_enabled(&self) -> bool {
        !self.recovery.detection_disabled() && self.active_inference < self.backend_count
    }

    pub fn is_finished(&self) -> bool {
        self.torn_down
    }

    /// Run cycles until shutdown or a fatal failure, then tear down.
    pub fn run(mut self) -> RunSummary {
        while let CycleStatus::Running(_) = self.step() {}
        self.summary()
    }

    // ------------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------------

    /// Run one cycle.
    pub fn step(&mut self) -> CycleStatus {
        if self.torn_down {
            return CycleStatus::Finished;
        }
        if self.recovery.is_fatal() {
            self.teardown();
            return CycleStatus::Finished;
        }
        if self.shutdown.is_requested() {
            self.recovery.shutdown();
            log::info!("shutdown requested after {} cycles", self.cycle);
            self.teardown();
            return CycleStatus::Finished;
        }

        self.cycle += 1;
        if self.needs_open {
            self.needs_open = false;
            self.reopen(self.selector.active());
        }

        let mut outcome = CycleOutcome::default();
        let mut report = CycleReport {
            cycle: self.cycle,
            source_id: self.selector.active().id,
            captured: false,
            presented: false,
            detection_ran: false,
            detections: 0,
            state: self.recovery.state(),
        };

        let (frame, capture_elapsed) = self.capture_frame(&mut outcome);
        let mut cancelled = self.shutdown.is_requested();

        if let Some(frame) = frame.filter(|_| !cancelled) {
            outcome.captured = true;
            report.captured = true;
            // A source that delivers is healthy again, even if a switch found nowhere to go.
            self.selector.mark_healthy(&frame.source_id);
            report.source_id = frame.source_id.to_string();

            let decision = self.governor.decide_for_cycle(&self.telemetry);
            let detection_ready = self.detection_enabled()
                && self
                    .detection_retry_at
                    .map_or(true, |at| Instant::now() >= at);

            let mut detections = Vec::new();
            let mut detect_elapsed = None;
            if detection_ready && decision.run_detection {
                let started = Instant::now();
                match self.infer(&frame, decision.target_scale) {
                    Ok(found) => {
                        outcome.inferred = true;
                        detections = found;
                    }
                    Err(Some(event)) => outcome.failures.push(event),
                    Err(None) => cancelled = true,
                }
                detect_elapsed = Some(started.elapsed());
                report.detection_ran = outcome.inferred;
            }
            report.detections = detections.len();

            if !cancelled {
                let meta = OverlayMeta {
                    cycle: self.cycle,
                    fps: self.telemetry.current_fps(),
                    target_fps: self.config.target_fps,
                    source_id: report.source_id.clone(),
                    state: self.recovery.state(),
                    detection_enabled: self.detection_enabled(),
                    detection_ran: outcome.inferred,
                    target_scale: decision.target_scale,
                };
                let started = Instant::now();
                match self.present(frame, detections, meta) {
                    Ok(command) => {
                        outcome.presented = true;
                        report.presented = true;
                        self.telemetry.record(CycleRecord::presented(
                            capture_elapsed,
                            detect_elapsed,
                            started.elapsed(),
                            Instant::now(),
                        ));
                        self.handle_command(command);
                    }
                    Err(Some(event)) => outcome.failures.push(event),
                    Err(None) => cancelled = true,
                }
            }
        }
        if !outcome.presented {
            self.telemetry
                .record(CycleRecord::skipped(capture_elapsed, Instant::now()));
        }
        if cancelled {
            // Stage calls were cut short by shutdown; the next step tears down.
            report.state = self.recovery.state();
            return CycleStatus::Running(report);
        }

        self.check_resources(&mut outcome);
        for failure in &outcome.failures {
            *self.failures.entry(failure.kind).or_insert(0) += 1;
        }

        let observed = self.recovery.observe(&outcome);
        let transition = self.apply(observed);
        self.report_cycle(&outcome, &transition);
        self.wait_out(&transition);

        report.state = self.recovery.state();
        CycleStatus::Running(report)
    }

    /// Take the prefetched frame. Returns the frame, if any, and the time the
    /// collaborator spent producing it.
    fn capture_frame(&mut self, outcome: &mut CycleOutcome) -> (Option<Frame>, Duration) {
        let Some(capture) = self.capture.as_ref() else {
            outcome
                .failures
                .push(FailureEvent::new(FailureKind::Capture, "capture stage stopped"));
            return (None, Duration::ZERO);
        };
        match capture.next(self.config.stage_timeouts.capture) {
            Ok(captured) => {
                let elapsed = captured.elapsed;
                let frame = match captured.outcome {
                    CaptureOutcome::Frame(frame) => Some(frame),
                    CaptureOutcome::Unavailable => {
                        outcome.failures.push(FailureEvent::new(
                            FailureKind::Capture,
                            format!("source {} returned no frame", captured.source_id),
                        ));
                        None
                    }
                    CaptureOutcome::OpenFailed(err) => {
                        self.needs_open = true;
                        let err = err.context(format!("open source {}", captured.source_id));
                        outcome
                            .failures
                            .push(FailureEvent::from_error(FailureKind::Capture, &err));
                        None
                    }
                    CaptureOutcome::Failed(err) => {
                        let err = err.context(format!("capture from {}", captured.source_id));
                        outcome
                            .failures
                            .push(FailureEvent::from_error(FailureKind::Capture, &err));
                        None
                    }
                };
                (frame, elapsed)
            }
            Err(StageError::Cancelled) => (None, Duration::ZERO),
            Err(err) => {
                let waited = match err {
                    StageError::TimedOut(limit) => limit,
                    _ => Duration::ZERO,
                };
                outcome
                    .failures
                    .push(FailureEvent::from_stage_error(FailureKind::Capture, err));
                (None, waited)
            }
        }
    }

    /// Detections mapped onto `frame`. `Err(None)` means the call was cancelled.
    fn infer(&self, frame: &Frame, scale: f64) -> Result<Vec<Detection>, Option<FailureEvent>> {
        let Some(worker) = self.inference.get(self.active_inference) else {
            return Ok(Vec::new());
        };
        let frame = frame.clone();
        let threshold = self.config.confidence_threshold;
        let result = worker.call(self.config.stage_timeouts.inference, move |backend| -> Result<Vec<Detection>> {
            let input = frame.downscaled(scale)?;
            let detections = backend.infer(&input, threshold)?;
            Ok(map_to_frame(
                detections,
                input.dimensions(),
                frame.dimensions(),
            ))
        });
        stage_result(FailureKind::Inference, result)
    }

    /// Present and poll input. `Err(None)` means the call was cancelled.
    fn present(
        &self,
        frame: Frame,
        detections: Vec<Detection>,
        meta: OverlayMeta,
    ) -> Result<Command, Option<FailureEvent>> {
        let Some(worker) = self.renderer.as_ref() else {
            return Err(Some(FailureEvent::new(
                FailureKind::Render,
                "renderer already released",
            )));
        };
        let result = worker.call(self.config.stage_timeouts.render, move |renderer| -> Result<Command> {
            renderer.present(&frame, &detections, &meta)?;
            let command = renderer.poll_input();
            if command == Command::ToggleFullscreen {
                renderer.toggle_fullscreen();
            }
            Ok(command)
        });
        stage_result(FailureKind::Render, result)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Quit => {
                log::info!("quit requested by operator");
                self.shutdown.request();
            }
            Command::SwitchSource => match self.selector.rotate() {
                Ok(next) => {
                    log::info!("operator switched source to {}", next.id);
                    self.reopen(next);
                }
                Err(err) => log::warn!("cannot switch source: {}", err),
            },
            Command::ToggleFullscreen | Command::None => {}
        }
    }

    fn check_resources(&self, outcome: &mut CycleOutcome) {
        let Some(limit) = self.config.max_memory_mb else {
            outcome.resources_checked = true;
            return;
        };
        if self.cycle % self.config.memory_sample_every != 0 {
            return;
        }
        let Some(rss) = process_rss_mb() else {
            return;
        };
        self.telemetry.record_memory(rss);
        if rss > limit {
            outcome.failures.push(FailureEvent::new(
                FailureKind::Resource,
                format!("resident memory {:.1}MB above limit {:.1}MB", rss, limit),
            ));
        } else {
            outcome.resources_checked = true;
        }
    }

    // ------------------------------------------------------------------------
    // Recovery actions
    // ------------------------------------------------------------------------

    /// Carry out the transition's actions. An action that cannot be carried out
    /// feeds back into the engine; the last transition is returned.
    fn apply(&mut self, transition: Transition) -> Transition {
        for action in transition.actions.clone() {
            if let Some(follow_up) = self.perform(action) {
                return self.apply(follow_up);
            }
        }
        transition
    }

    fn perform(&mut self, action: RecoveryAction) -> Option<Transition> {
        match action {
            RecoveryAction::SwitchSource => {
                let failed = self.selector.active();
                match self.selector.mark_unhealthy(&failed.id) {
                    Some(Ok(next)) if next.id != failed.id => {
                        log::info!("switching source {} -> {}", failed.id, next.id);
                        self.reopen(next);
                    }
                    Some(Err(err)) => {
                        log::debug!("{}; staying on {}", err, failed.id);
                    }
                    _ => {}
                }
                None
            }
            RecoveryAction::ReprobeSources => {
                let readmitted = self.selector.readmit_failed();
                let active = self.selector.active();
                self.selector.mark_healthy(&active.id);
                match self.selector.switch_to_next() {
                    Ok(next) => {
                        log::info!(
                            "re-probing sources ({} re-admitted); reopening {}",
                            readmitted,
                            next.id
                        );
                        self.reopen(next);
                    }
                    Err(err) => log::debug!("re-probe found nothing: {}", err),
                }
                None
            }
            RecoveryAction::ContinueDisplayOnly => None,
            RecoveryAction::SwitchInferenceBackend => {
                self.active_inference += 1;
                match self.inference.get(self.active_inference) {
                    Some(_) => {
                        log::info!(
                            "switching to inference backend #{}",
                            self.active_inference + 1
                        );
                        self.detection_retry_at = None;
                        self.warm_up_active_backend();
                        None
                    }
                    None => Some(self.recovery.capability_exhausted(
                        FailureKind::Inference,
                        "no fallback inference backend left",
                    )),
                }
            }
            RecoveryAction::DisableDetection => {
                self.detection_retry_at = None;
                None
            }
            RecoveryAction::RestartRenderer => {
                if let Some(renderer) = self.renderer.as_ref() {
                    match renderer.call(self.config.stage_timeouts.render, |r| r.restart()) {
                        Ok(Ok(())) => log::info!("renderer restarted"),
                        Ok(Err(err)) => log::debug!("renderer restart failed: {:#}", err),
                        Err(err) => log::debug!("renderer restart not completed: {}", err),
                    }
                }
                None
            }
            RecoveryAction::ReclaimResources => {
                self.reclaim();
                None
            }
            RecoveryAction::ShedDetectionLoad => {
                log::info!("resource pressure persists; shedding detection load");
                self.governor.force_floor();
                None
            }
            RecoveryAction::Teardown => None,
        }
    }

    fn reopen(&mut self, source: SourceDescriptor) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        match capture.open(source) {
            // Supersedes any reopen a failed open queued earlier in the cycle.
            Ok(_) => self.needs_open = false,
            Err(err) => {
                log::debug!("reopen failed: {:#}", err);
                self.needs_open = true;
            }
        }
    }

    fn reclaim(&mut self) {
        if let Some(capture) = self.capture.as_ref() {
            capture.reclaim();
        }
        let timeout = self.config.stage_timeouts.inference;
        if let Some(worker) = self.inference.get(self.active_inference) {
            if let Ok(Err(err)) = worker.call(timeout, |b| b.reclaim()) {
                log::debug!("inference reclaim failed: {:#}", err);
            }
        }
        if let Some(renderer) = self.renderer.as_ref() {
            if let Ok(Err(err)) = renderer.call(self.config.stage_timeouts.render, |r| r.reclaim()) {
                log::debug!("renderer reclaim failed: {:#}", err);
            }
        }
        self.telemetry.compact();
        log::info!("reclamation pass done");
    }

    fn warm_up_active_backend(&mut self) {
        let Some(worker) = self.inference.get(self.active_inference) else {
            return;
        };
        match worker.call(self.config.stage_timeouts.inference, |b| b.warm_up()) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("inference warm-up failed: {:#}", err),
            Err(err) => log::warn!("inference warm-up not completed: {}", err),
        }
    }

    /// Report every failure of the cycle. The failure that drove the transition is
    /// reported at a level matching where the engine ended up; the rest at info.
    fn report_cycle(&self, outcome: &CycleOutcome, transition: &Transition) {
        let driver = outcome
            .failures
            .iter()
            .enumerate()
            .max_by_key(|(_, f)| f.kind.severity())
            .map(|(idx, _)| idx);
        for (idx, failure) in outcome.failures.iter().enumerate() {
            if Some(idx) != driver || transition.trigger.is_none() {
                self.reporter.report_at(failure, Level::Info);
            }
        }
        if let Some(trigger) = transition.trigger.as_ref() {
            self.reporter.report_at(trigger, transition_level(transition));
        }
        if transition.changed() && transition.to == RecoveryState::Stable {
            log::info!("recovered from {}", transition.from);
        }
    }

    /// Honour the transition's backoff. Inference backs off by holding detection
    /// off; every other kind delays the next cycle.
    fn wait_out(&mut self, transition: &Transition) {
        let Some(delay) = transition.delay else {
            return;
        };
        match transition.trigger.as_ref().map(|t| t.kind) {
            Some(FailureKind::Inference) => {
                self.detection_retry_at = Some(Instant::now() + delay);
            }
            _ => {
                log::debug!("backing off {}ms", delay.as_millis());
                self.shutdown.wait_timeout(delay);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Stop every stage within the shutdown grace, release the renderer, flush
    /// reports and log the session statistics.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        // Stage calls blocked on the handoff or a collaborator must notice.
        self.shutdown.request();
        let deadline = Instant::now() + self.config.shutdown_grace;
        let remaining = || {
            deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(10))
        };

        if let Some(prober) = self.prober.take() {
            prober.stop(remaining());
        }
        if let Some(capture) = self.capture.take() {
            capture.stop(remaining());
        }
        if let Some(renderer) = self.renderer.take() {
            if let Err(err) = renderer.call_uncancelled(remaining(), |r| r.release()) {
                log::warn!("renderer release not completed: {}", err);
            }
            renderer.stop(remaining());
        }
        for worker in self.inference.drain(..) {
            worker.stop(remaining());
        }
        self.reporter.flush();

        let summary = self.summary();
        match &summary.exit {
            ExitStatus::Graceful => log::info!("detection loop stopped after {} cycles", summary.cycles),
            ExitStatus::Fatal(reason) => {
                log::error!("detection loop stopped after {} cycles: {}", summary.cycles, reason)
            }
        }
        let perf = &summary.performance;
        log::info!(
            "presented={} skipped={} detection_runs={} fps={:.1} avg capture={}ms detect={}ms present={}ms",
            perf.frames_presented,
            perf.frames_skipped,
            perf.detection_runs,
            perf.fps,
            perf.averages.capture.as_millis(),
            perf.averages.detect.as_millis(),
            perf.averages.present.as_millis()
        );
        log::info!(
            "recovery attempts={} source switches={} final source={} detection {}",
            summary.recovery_attempts,
            summary.source_switches,
            summary.final_source,
            if summary.detection_enabled { "on" } else { "off" }
        );
        for suggestion in perf.suggestions(self.config.target_fps, self.config.max_memory_mb) {
            log::info!("suggestion: {}", suggestion);
        }
    }

    /// Statistics so far. Final once the loop has finished.
    pub fn summary(&self) -> RunSummary {
        let exit = match self.recovery.fatal_reason() {
            Some(reason @ FatalReason::Exhausted { .. }) => ExitStatus::Fatal(reason.to_string()),
            Some(FatalReason::Shutdown) | None => ExitStatus::Graceful,
        };
        let performance = self.telemetry.snapshot();
        RunSummary {
            exit,
            cycles: self.cycle,
            frames_presented: performance.frames_presented,
            frames_skipped: performance.frames_skipped,
            detection_runs: performance.detection_runs,
            failures: self.failures.clone(),
            recovery_attempts: self.recovery.recovery_attempts(),
            source_switches: self.selector.switches(),
            final_source: self.selector.active().id,
            detection_enabled: self.detection_enabled(),
            performance,
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.torn_down {
            self.recovery.shutdown();
            self.teardown();
        }
    }
}

/// Classify a worker call. `Err(None)` means shutdown cut the call short.
fn stage_result<T>(
    kind: FailureKind,
    result: Result<Result<T>, StageError>,
) -> Result<T, Option<FailureEvent>> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Some(FailureEvent::from_error(kind, &err))),
        Err(StageError::Cancelled) => Err(None),
        Err(err) => Err(Some(FailureEvent::from_stage_error(kind, err))),
    }
}

fn transition_level(transition: &Transition) -> Level {
    match transition.to {
        RecoveryState::Fatal => Level::Error,
        RecoveryState::Recovering { .. } => Level::Warn,
        _ if transition.has_action(RecoveryAction::DisableDetection)
            || transition.has_action(RecoveryAction::ShedDetectionLoad) =>
        {
            Level::Warn
        }
        _ => Level::Info,
    }
}
