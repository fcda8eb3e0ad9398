//! vigild - fault-tolerant detection loop daemon
//!
//! This daemon:
//! 1. Loads the pipeline configuration (file, environment, flags)
//! 2. Captures from the highest-priority healthy source, falling back on failure
//! 3. Runs the configured inference backends, display-only if they all fail
//! 4. Presents frames on the console renderer (`q`/Esc quit, `c` switch source)
//! 5. Exits 0 on a graceful stop (Ctrl-C, `q`), 1 when recovery was exhausted

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use vigil::config::{parse_resolution, parse_sources, secs_to_interval};
use vigil::{
    build_backends, Collaborators, ConsoleRenderer, LocatorCamera, LogSink, Orchestrator,
    PipelineConfig, ShutdownSignal,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run the vigil detection loop against prioritized camera sources"
)]
struct Args {
    /// JSON or TOML pipeline configuration.
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Source as `id=locator`, highest priority first. Repeatable.
    #[arg(long = "source", value_name = "ID=LOCATOR")]
    sources: Vec<String>,

    /// Capture resolution, e.g. 1280x720.
    #[arg(long, value_name = "WxH")]
    resolution: Option<String>,

    /// Minimum detection confidence in [0, 1].
    #[arg(long)]
    confidence: Option<f32>,

    /// Frame rate the governor defends.
    #[arg(long)]
    target_fps: Option<f64>,

    /// Inference backend, in fallback order. Repeatable.
    #[arg(long = "backend", value_name = "SPEC")]
    backends: Vec<String>,

    /// Re-probe failed sources every N seconds (0 disables).
    #[arg(long)]
    reprobe_secs: Option<f64>,

    /// Read keyboard commands from stdin (q/Esc quit, c switch source, f fullscreen).
    #[arg(long, env = "VIGIL_INTERACTIVE")]
    interactive: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = load_config(&args)?;
    let collaborators = Collaborators {
        camera: Arc::new(LocatorCamera::new()),
        inference: build_backends(&config.inference_backends)?,
        renderer: Box::new(ConsoleRenderer::new(args.interactive)),
    };

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping detection loop...");
        signal.request();
    })?;

    log::info!(
        "vigild {} running. sources: {}",
        env!("CARGO_PKG_VERSION"),
        config
            .sources
            .iter()
            .map(|s| format!("{}={}", s.id, s.locator))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let orchestrator = Orchestrator::start(config, collaborators, Box::new(LogSink), shutdown)?;
    let summary = orchestrator.run();

    log::info!(
        "vigild exiting: {} (cycles={} presented={} capture_failures={} inference_failures={})",
        summary.exit,
        summary.cycles,
        summary.frames_presented,
        summary.failure_count(vigil::FailureKind::Capture),
        summary.failure_count(vigil::FailureKind::Inference)
    );
    std::process::exit(summary.exit.code());
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_from(args.config.as_deref())?;
    if !args.sources.is_empty() {
        config.sources = parse_sources(&args.sources.join(","))?;
    }
    if let Some(resolution) = args.resolution.as_deref() {
        let (width, height) = parse_resolution(resolution)?;
        config.capture.width = width;
        config.capture.height = height;
    }
    if let Some(confidence) = args.confidence {
        config.confidence_threshold = confidence;
    }
    if let Some(target_fps) = args.target_fps {
        config.target_fps = target_fps;
    }
    if !args.backends.is_empty() {
        config.inference_backends = args.backends.clone();
    }
    if let Some(secs) = args.reprobe_secs {
        config.reprobe_interval = secs_to_interval("--reprobe-secs", secs)?;
    }
    config.validate()?;
    Ok(config)
}
