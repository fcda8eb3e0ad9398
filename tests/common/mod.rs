#![allow(dead_code)]

use anyhow::{anyhow, Result};
use log::Level;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigil::{
    BoundingBox, CameraBackend, CaptureHandle, CaptureSettings, Collaborators, Command, Detection,
    Frame, InferenceBackend, Orchestrator, OverlayMeta, PipelineConfig, Region, Renderer,
    ReportSink, ShutdownSignal, SourceDescriptor, SourceKind, SyntheticCamera,
};

/// Config with short timeouts and millisecond backoff.
pub fn test_config(sources: &[(&str, &str)]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sources = sources
        .iter()
        .enumerate()
        .map(|(idx, (id, locator))| {
            let kind = if idx == 0 {
                SourceKind::Primary
            } else {
                SourceKind::Fallback
            };
            SourceDescriptor::new(id, locator, idx as u8, kind)
        })
        .collect();
    config.capture.width = 32;
    config.capture.height = 24;
    config.capture.fps = 1000.0;
    // Low enough that the governor never degrades during a test.
    config.target_fps = 1.0;
    config.stage_timeouts.capture = Duration::from_millis(500);
    config.stage_timeouts.inference = Duration::from_millis(20);
    config.stage_timeouts.render = Duration::from_millis(200);
    config.backoff_base = Duration::from_millis(1);
    config.backoff_cap = Duration::from_millis(5);
    config.report_quiet_period = Duration::from_secs(10);
    config.shutdown_grace = Duration::from_millis(300);
    config
}

pub fn start(
    config: PipelineConfig,
    inference: Vec<Box<dyn InferenceBackend>>,
    renderer: ScriptedRenderer,
    sink: RecordingSink,
) -> Orchestrator {
    start_with_camera(
        config,
        Arc::new(SyntheticCamera::unpaced()),
        inference,
        renderer,
        sink,
    )
}

pub fn start_with_camera(
    config: PipelineConfig,
    camera: Arc<dyn CameraBackend>,
    inference: Vec<Box<dyn InferenceBackend>>,
    renderer: ScriptedRenderer,
    sink: RecordingSink,
) -> Orchestrator {
    let collaborators = Collaborators {
        camera,
        inference,
        renderer: Box::new(renderer),
    };
    Orchestrator::start(config, collaborators, Box::new(sink), ShutdownSignal::new())
        .expect("start orchestrator")
}

// ----------------------------------------------------------------------------
// Camera
// ----------------------------------------------------------------------------

/// Synthetic camera that records every open. `hang://` sources open but never
/// deliver: each capture blocks for seconds.
pub struct RecordingCamera {
    inner: SyntheticCamera,
    opened: Arc<Mutex<Vec<String>>>,
}

impl RecordingCamera {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let camera = Self {
            inner: SyntheticCamera::unpaced(),
            opened: opened.clone(),
        };
        (camera, opened)
    }
}

struct StalledHandle;

impl CaptureHandle for StalledHandle {
    fn capture(&mut self) -> Result<Option<Frame>> {
        std::thread::sleep(Duration::from_secs(5));
        Ok(None)
    }
}

impl CameraBackend for RecordingCamera {
    fn open(
        &self,
        source: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureHandle>> {
        self.opened.lock().unwrap().push(source.id.clone());
        if source.locator.starts_with("hang://") {
            return Ok(Box::new(StalledHandle));
        }
        self.inner.open(source, settings)
    }
}

// ----------------------------------------------------------------------------
// Inference
// ----------------------------------------------------------------------------

/// Reports one pixel-space box per frame.
pub struct BoxBackend;

impl InferenceBackend for BoxBackend {
    fn name(&self) -> &str {
        "box"
    }

    fn infer(&mut self, frame: &Frame, _confidence_threshold: f32) -> Result<Vec<Detection>> {
        let (w, h) = (frame.width as f32, frame.height as f32);
        Ok(vec![Detection::new(
            "person",
            0.9,
            Region::Pixel(BoundingBox::new(0.0, 0.0, w / 2.0, h / 2.0)),
        )])
    }
}

/// Takes `delay` per call, longer than any test inference timeout.
pub struct SlowBackend {
    pub delay: Duration,
}

impl InferenceBackend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }

    fn infer(&mut self, _frame: &Frame, _confidence_threshold: f32) -> Result<Vec<Detection>> {
        std::thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

// ----------------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RenderLog {
    pub presented: u64,
    pub detections: u64,
    pub sources: Vec<String>,
    pub restarts: u64,
    pub reclaims: u64,
    pub released: bool,
}

pub struct ScriptedRenderer {
    log: Arc<Mutex<RenderLog>>,
    commands: VecDeque<Command>,
    failing_presents: u64,
}

impl ScriptedRenderer {
    pub fn new() -> (Self, Arc<Mutex<RenderLog>>) {
        let log = Arc::new(Mutex::new(RenderLog::default()));
        let renderer = Self {
            log: log.clone(),
            commands: VecDeque::new(),
            failing_presents: 0,
        };
        (renderer, log)
    }

    /// Commands returned by successive `poll_input` calls.
    pub fn with_commands(mut self, commands: &[Command]) -> Self {
        self.commands = commands.iter().copied().collect();
        self
    }

    /// The first `n` presents fail.
    pub fn failing_first(mut self, n: u64) -> Self {
        self.failing_presents = n;
        self
    }
}

impl Renderer for ScriptedRenderer {
    fn present(&mut self, frame: &Frame, detections: &[Detection], _meta: &OverlayMeta) -> Result<()> {
        if self.failing_presents > 0 {
            self.failing_presents -= 1;
            return Err(anyhow!("display surface lost"));
        }
        let mut log = self.log.lock().unwrap();
        log.presented += 1;
        log.detections += detections.len() as u64;
        log.sources.push(frame.source_id.to_string());
        Ok(())
    }

    fn poll_input(&mut self) -> Command {
        self.commands.pop_front().unwrap_or(Command::None)
    }

    fn restart(&mut self) -> Result<()> {
        self.log.lock().unwrap().restarts += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released = true;
    }

    fn reclaim(&mut self) -> Result<()> {
        self.log.lock().unwrap().reclaims += 1;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Reporting
// ----------------------------------------------------------------------------

pub type Emissions = Arc<Mutex<Vec<(Level, String, u64)>>>;

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub emissions: Emissions,
}

impl RecordingSink {
    pub fn new() -> (Self, Emissions) {
        let sink = Self::default();
        let emissions = sink.emissions.clone();
        (sink, emissions)
    }
}

impl ReportSink for RecordingSink {
    fn emit(&mut self, level: Level, message: &str, suppressed: u64) -> Result<()> {
        self.emissions
            .lock()
            .unwrap()
            .push((level, message.to_string(), suppressed));
        Ok(())
    }
}

pub fn count_level(emissions: &Emissions, level: Level) -> usize {
    emissions
        .lock()
        .unwrap()
        .iter()
        .filter(|(l, _, _)| *l == level)
        .count()
}
