//! demo - synthetic fault drill for the vigil detection loop
//!
//! Runs the loop against two `stub://` sources. The primary goes dark after a
//! configurable number of frames so the loop must fall back; the detector has
//! random latency and can be made to stall for good so the loop must drop to
//! display-only. Prints what happened at the end.

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

use vigil::{
    Collaborators, ConsoleRenderer, Detection, FailureKind, Frame, InferenceBackend, LogSink,
    MotionBackend, Orchestrator, PipelineConfig, ShutdownSignal, SourceDescriptor, SourceKind,
    SyntheticCamera,
};

const INFERENCE_TIMEOUT: Duration = Duration::from_millis(60);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// How long to run the drill.
    #[arg(long, default_value_t = 8)]
    seconds: u64,
    /// Frame rate of the synthetic sources and the governor target.
    #[arg(long, default_value_t = 15)]
    fps: u32,
    /// Frames the primary source delivers before going dark.
    #[arg(long, default_value_t = 40)]
    primary_frames: u64,
    /// Inference calls before the detector stalls for good (0 never stalls).
    #[arg(long, default_value_t = 60)]
    stall_after: u64,
    /// Upper bound of the random detector latency, in milliseconds.
    #[arg(long, default_value_t = 40)]
    max_latency_ms: u64,
    /// Optional deterministic seed for the latency jitter.
    #[arg(long)]
    seed: Option<u64>,
}

/// Motion detector with random latency that can stall permanently.
struct JitteryBackend {
    inner: MotionBackend,
    rng: StdRng,
    max_latency: Duration,
    stall_after: Option<u64>,
    calls: u64,
}

impl InferenceBackend for JitteryBackend {
    fn name(&self) -> &str {
        "jittery-motion"
    }

    fn infer(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        self.calls += 1;
        let latency = if self.stall_after.is_some_and(|limit| self.calls > limit) {
            INFERENCE_TIMEOUT * 4
        } else {
            let max_ms = self.max_latency.as_millis().max(1) as u64;
            Duration::from_millis(self.rng.gen_range(0..max_ms))
        };
        std::thread::sleep(latency);
        self.inner.infer(frame, confidence_threshold)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    stage("configure drill");
    let mut config = PipelineConfig::default();
    config.sources = vec![
        SourceDescriptor::new(
            "primary",
            &format!("stub://primary?fail_after={}", args.primary_frames.max(1)),
            0,
            SourceKind::Primary,
        ),
        SourceDescriptor::new("fallback", "stub://fallback", 1, SourceKind::Fallback),
    ];
    config.capture.width = 320;
    config.capture.height = 240;
    config.capture.fps = f64::from(args.fps);
    config.target_fps = f64::from(args.fps);
    config.stage_timeouts.inference = INFERENCE_TIMEOUT;
    config.backoff_base = Duration::from_millis(100);
    config.backoff_cap = Duration::from_secs(2);
    config.validate()?;

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let backend = JitteryBackend {
        inner: MotionBackend::new(),
        rng,
        max_latency: Duration::from_millis(args.max_latency_ms),
        stall_after: (args.stall_after > 0).then_some(args.stall_after),
        calls: 0,
    };
    let collaborators = Collaborators {
        camera: Arc::new(SyntheticCamera::new()),
        inference: vec![Box::new(backend)],
        renderer: Box::new(ConsoleRenderer::new(false)),
    };

    stage("run detection loop");
    let shutdown = ShutdownSignal::new();
    let timer = shutdown.clone();
    let run_for = Duration::from_secs(args.seconds);
    std::thread::spawn(move || {
        if !timer.wait_timeout(run_for) {
            timer.request();
        }
    });
    let orchestrator = Orchestrator::start(config, collaborators, Box::new(LogSink), shutdown)?;
    let summary = orchestrator.run();

    stage("drill results");
    eprintln!("  exit: {}", summary.exit);
    eprintln!(
        "  cycles: {} presented: {} skipped: {} detection runs: {}",
        summary.cycles, summary.frames_presented, summary.frames_skipped, summary.detection_runs
    );
    for kind in FailureKind::ALL {
        eprintln!("  {} failures: {}", kind, summary.failure_count(kind));
    }
    eprintln!(
        "  source switches: {} (final source {})",
        summary.source_switches, summary.final_source
    );
    eprintln!(
        "  detection: {}",
        if summary.detection_enabled {
            "enabled"
        } else {
            "disabled (display-only)"
        }
    );
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
