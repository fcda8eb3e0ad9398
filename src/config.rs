use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::governor::GovernorConfig;
use crate::ingest::CaptureSettings;
use crate::recovery::{RecoveryConfig, RetryCeilings};
use crate::report::ReportPolicy;
use crate::source::{SourceDescriptor, SourceKind};

const DEFAULT_SOURCE_ID: &str = "primary";
const DEFAULT_SOURCE_LOCATOR: &str = "stub://primary";
const DEFAULT_TARGET_FPS: f64 = 15.0;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
const DEFAULT_REPORT_QUIET_MS: u64 = 10_000;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RENDER_TIMEOUT_MS: u64 = 500;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
const DEFAULT_MEMORY_SAMPLE_EVERY: u64 = 30;
const DEFAULT_INFERENCE_BACKEND: &str = "motion";
/// Telemetry history kept by default, in seconds at the target rate.
const DEFAULT_TELEMETRY_SECS: f64 = 4.0;
const MAX_TARGET_FPS: f64 = 1_000.0;
const MAX_TELEMETRY_CAPACITY: usize = 100_000;

// ---- File schema ----

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    sources: Option<Vec<SourceConfigFile>>,
    capture: Option<CaptureSettings>,
    confidence_threshold: Option<f32>,
    target_fps: Option<f64>,
    retry_ceiling: Option<RetryCeilingFile>,
    max_recovery_attempts: Option<u32>,
    backoff: Option<BackoffConfigFile>,
    governor: Option<GovernorConfigFile>,
    prefetch_depth: Option<usize>,
    telemetry_capacity: Option<usize>,
    timeouts: Option<TimeoutConfigFile>,
    reprobe_secs: Option<f64>,
    max_memory_mb: Option<f64>,
    memory_sample_every: Option<u64>,
    inference_backends: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SourceConfigFile {
    id: String,
    locator: String,
    priority: Option<u8>,
    kind: Option<SourceKind>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryCeilingFile {
    capture: Option<u32>,
    inference: Option<u32>,
    render: Option<u32>,
    resource: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BackoffConfigFile {
    base_ms: Option<u64>,
    cap_ms: Option<u64>,
    report_quiet_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct GovernorConfigFile {
    scale_floor: Option<f64>,
    scale_step: Option<f64>,
    degrade_streak: Option<u32>,
    recover_streak: Option<u32>,
    max_skip_ratio: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TimeoutConfigFile {
    capture_ms: Option<u64>,
    inference_ms: Option<u64>,
    render_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
}

// ---- Runtime configuration ----

/// Per-stage call bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub capture: Duration,
    pub inference: Duration,
    pub render: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            capture: Duration::from_millis(DEFAULT_CAPTURE_TIMEOUT_MS),
            inference: Duration::from_millis(DEFAULT_INFERENCE_TIMEOUT_MS),
            render: Duration::from_millis(DEFAULT_RENDER_TIMEOUT_MS),
        }
    }
}

/// Everything the loop needs, enumerated once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Acquisition sources. Lower priority value is preferred.
    pub sources: Vec<SourceDescriptor>,
    pub capture: CaptureSettings,
    pub confidence_threshold: f32,
    pub target_fps: f64,
    pub retry_ceiling: RetryCeilings,
    pub max_recovery_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub report_quiet_period: Duration,
    /// Frames in flight ahead of the loop. Must be 1.
    pub prefetch_depth: usize,
    pub scale_floor: f64,
    pub scale_step: f64,
    pub degrade_streak: u32,
    pub recover_streak: u32,
    pub max_skip_ratio: u32,
    /// Cycle records kept. `None` sizes the window for a few seconds at `target_fps`.
    pub telemetry_capacity: Option<usize>,
    pub stage_timeouts: StageTimeouts,
    pub shutdown_grace: Duration,
    /// Background re-probe period for failed sources. `None` disables probing.
    pub reprobe_interval: Option<Duration>,
    /// Resident memory above which a cycle records a resource failure.
    pub max_memory_mb: Option<f64>,
    pub memory_sample_every: u64,
    /// Inference backends in fallback order (see `detect::build_backends`).
    pub inference_backends: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let governor = GovernorConfig::default();
        Self {
            sources: vec![SourceDescriptor::new(
                DEFAULT_SOURCE_ID,
                DEFAULT_SOURCE_LOCATOR,
                0,
                SourceKind::Primary,
            )],
            capture: CaptureSettings::default(),
            confidence_threshold: DEFAULT_CONFIDENCE,
            target_fps: DEFAULT_TARGET_FPS,
            retry_ceiling: RetryCeilings::default(),
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            report_quiet_period: Duration::from_millis(DEFAULT_REPORT_QUIET_MS),
            prefetch_depth: 1,
            scale_floor: governor.scale_floor,
            scale_step: governor.scale_step,
            degrade_streak: governor.degrade_streak,
            recover_streak: governor.recover_streak,
            max_skip_ratio: governor.max_skip_ratio,
            telemetry_capacity: None,
            stage_timeouts: StageTimeouts::default(),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            reprobe_interval: None,
            max_memory_mb: None,
            memory_sample_every: DEFAULT_MEMORY_SAMPLE_EVERY,
            inference_backends: vec![DEFAULT_INFERENCE_BACKEND.to_string()],
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the file named by `VIGIL_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIGIL_CONFIG").ok();
        let config_path = config_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(Path::new);
        Self::load_from(config_path)
    }

    /// Defaults, then `path` if given, then environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let sources = match file.sources {
            Some(entries) => entries
                .into_iter()
                .enumerate()
                .map(|(idx, entry)| {
                    let priority = match entry.priority {
                        Some(p) => p,
                        None => u8::try_from(idx)
                            .map_err(|_| anyhow!("too many sources; set explicit priorities"))?,
                    };
                    let kind = entry.kind.unwrap_or(if idx == 0 {
                        SourceKind::Primary
                    } else {
                        SourceKind::Fallback
                    });
                    Ok(SourceDescriptor::new(&entry.id, &entry.locator, priority, kind))
                })
                .collect::<Result<Vec<_>>>()?,
            None => defaults.sources,
        };
        let ceilings = file.retry_ceiling.unwrap_or_default();
        let backoff = file.backoff.unwrap_or_default();
        let governor = file.governor.unwrap_or_default();
        let timeouts = file.timeouts.unwrap_or_default();
        let reprobe_interval = match file.reprobe_secs {
            Some(secs) => secs_to_interval("reprobe_secs", secs)?,
            None => None,
        };

        Ok(Self {
            sources,
            capture: file.capture.unwrap_or(defaults.capture),
            confidence_threshold: file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            target_fps: file.target_fps.unwrap_or(defaults.target_fps),
            retry_ceiling: RetryCeilings {
                capture: ceilings.capture.unwrap_or(defaults.retry_ceiling.capture),
                inference: ceilings.inference.unwrap_or(defaults.retry_ceiling.inference),
                render: ceilings.render.unwrap_or(defaults.retry_ceiling.render),
                resource: ceilings.resource.unwrap_or(defaults.retry_ceiling.resource),
            },
            max_recovery_attempts: file
                .max_recovery_attempts
                .unwrap_or(defaults.max_recovery_attempts),
            backoff_base: backoff
                .base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_cap: backoff
                .cap_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
            report_quiet_period: backoff
                .report_quiet_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.report_quiet_period),
            prefetch_depth: file.prefetch_depth.unwrap_or(defaults.prefetch_depth),
            scale_floor: governor.scale_floor.unwrap_or(defaults.scale_floor),
            scale_step: governor.scale_step.unwrap_or(defaults.scale_step),
            degrade_streak: governor.degrade_streak.unwrap_or(defaults.degrade_streak),
            recover_streak: governor.recover_streak.unwrap_or(defaults.recover_streak),
            max_skip_ratio: governor.max_skip_ratio.unwrap_or(defaults.max_skip_ratio),
            telemetry_capacity: file.telemetry_capacity,
            stage_timeouts: StageTimeouts {
                capture: timeouts
                    .capture_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stage_timeouts.capture),
                inference: timeouts
                    .inference_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stage_timeouts.inference),
                render: timeouts
                    .render_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stage_timeouts.render),
            },
            shutdown_grace: timeouts
                .shutdown_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
            reprobe_interval,
            max_memory_mb: file.max_memory_mb,
            memory_sample_every: file
                .memory_sample_every
                .unwrap_or(defaults.memory_sample_every),
            inference_backends: file
                .inference_backends
                .unwrap_or(defaults.inference_backends),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(sources) = std::env::var("VIGIL_SOURCES") {
            if !sources.trim().is_empty() {
                self.sources = parse_sources(&sources)?;
            }
        }
        if let Ok(fps) = std::env::var("VIGIL_TARGET_FPS") {
            self.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("VIGIL_TARGET_FPS must be a number"))?;
        }
        if let Ok(confidence) = std::env::var("VIGIL_CONFIDENCE") {
            self.confidence_threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("VIGIL_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(resolution) = std::env::var("VIGIL_RESOLUTION") {
            if !resolution.trim().is_empty() {
                let (width, height) = parse_resolution(&resolution)?;
                self.capture.width = width;
                self.capture.height = height;
            }
        }
        if let Ok(secs) = std::env::var("VIGIL_REPROBE_SECS") {
            let secs: f64 = secs
                .trim()
                .parse()
                .map_err(|_| anyhow!("VIGIL_REPROBE_SECS must be a number of seconds"))?;
            self.reprobe_interval = secs_to_interval("VIGIL_REPROBE_SECS", secs)?;
        }
        if let Ok(backends) = std::env::var("VIGIL_BACKENDS") {
            self.inference_backends = split_csv(&backends);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() || source.locator.trim().is_empty() {
                return Err(anyhow!("sources need a non-empty id and locator"));
            }
            if !ids.insert(source.id.as_str()) {
                return Err(anyhow!("duplicate source id '{}'", source.id));
            }
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture resolution must be non-zero"));
        }
        if !(self.capture.fps.is_finite() && self.capture.fps > 0.0) {
            return Err(anyhow!("capture fps must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence threshold must be within [0, 1]"));
        }
        if !(self.target_fps.is_finite() && self.target_fps > 0.0) {
            return Err(anyhow!("target fps must be greater than zero"));
        }
        if self.target_fps > MAX_TARGET_FPS {
            return Err(anyhow!("target fps must not exceed {}", MAX_TARGET_FPS));
        }
        if self.prefetch_depth != 1 {
            return Err(anyhow!("prefetch depth must be exactly 1"));
        }
        if !(self.scale_floor > 0.0 && self.scale_floor <= 1.0) {
            return Err(anyhow!("scale floor must be within (0, 1]"));
        }
        if !(self.scale_step > 0.0 && self.scale_step < 1.0) {
            return Err(anyhow!("scale step must be within (0, 1)"));
        }
        if self.degrade_streak == 0 || self.recover_streak == 0 {
            return Err(anyhow!("governor streaks must be greater than zero"));
        }
        if self.max_skip_ratio == 0 {
            return Err(anyhow!("max skip ratio must be at least 1"));
        }
        let ceilings = self.retry_ceiling;
        if [
            ceilings.capture,
            ceilings.inference,
            ceilings.render,
            ceilings.resource,
        ]
        .contains(&0)
        {
            return Err(anyhow!("retry ceilings must be greater than zero"));
        }
        if self.max_recovery_attempts == 0 {
            return Err(anyhow!("max recovery attempts must be greater than zero"));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_cap {
            return Err(anyhow!("backoff base must be non-zero and not above the cap"));
        }
        let timeouts = self.stage_timeouts;
        if timeouts.capture.is_zero() || timeouts.inference.is_zero() || timeouts.render.is_zero()
        {
            return Err(anyhow!("stage timeouts must be greater than zero"));
        }
        if self.shutdown_grace.is_zero() {
            return Err(anyhow!("shutdown grace must be greater than zero"));
        }
        if let Some(capacity) = self.telemetry_capacity {
            if capacity == 0 || capacity > MAX_TELEMETRY_CAPACITY {
                return Err(anyhow!(
                    "telemetry capacity must be within 1..={}",
                    MAX_TELEMETRY_CAPACITY
                ));
            }
        }
        if self.memory_sample_every == 0 {
            return Err(anyhow!("memory_sample_every must be greater than zero"));
        }
        if let Some(limit) = self.max_memory_mb {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(anyhow!("max memory must be a positive number of MiB"));
            }
        }
        Ok(())
    }

    pub fn telemetry_capacity(&self) -> usize {
        self.telemetry_capacity
            .unwrap_or_else(|| (self.target_fps * DEFAULT_TELEMETRY_SECS).ceil().max(1.0) as usize)
            .min(MAX_TELEMETRY_CAPACITY)
    }

    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            target_fps: self.target_fps,
            scale_floor: self.scale_floor,
            scale_step: self.scale_step,
            degrade_streak: self.degrade_streak,
            recover_streak: self.recover_streak,
            max_skip_ratio: self.max_skip_ratio,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            retry_ceiling: self.retry_ceiling,
            max_attempts: self.max_recovery_attempts,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
        }
    }

    pub fn report_policy(&self) -> ReportPolicy {
        ReportPolicy {
            base: self.backoff_base,
            cap: self.backoff_cap,
            quiet_period: self.report_quiet_period,
        }
    }
}

/// `id=locator` pairs separated by commas, in priority order. A bare locator
/// gets the id `source<N>`.
pub fn parse_sources(value: &str) -> Result<Vec<SourceDescriptor>> {
    split_csv(value)
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            let priority =
                u8::try_from(idx).map_err(|_| anyhow!("too many sources in list"))?;
            let (id, locator) = match entry.split_once('=') {
                Some((id, locator)) => (id.trim().to_string(), locator.trim().to_string()),
                None => (format!("source{}", idx), entry.clone()),
            };
            let kind = if idx == 0 {
                SourceKind::Primary
            } else {
                SourceKind::Fallback
            };
            Ok(SourceDescriptor::new(&id, &locator, priority, kind))
        })
        .collect()
}

/// `WIDTHxHEIGHT`, e.g. `1280x720`.
pub fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("resolution must look like 640x480, got '{}'", value))?;
    let width = w
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid resolution width '{}'", w))?;
    let height = h
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid resolution height '{}'", h))?;
    Ok((width, height))
}

/// Seconds to an optional interval; 0 disables.
pub fn secs_to_interval(name: &str, secs: f64) -> Result<Option<Duration>> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("{} must be a non-negative number of seconds", name));
    }
    if secs == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| anyhow!("{} is out of range: {}", name, secs))
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.telemetry_capacity(), 60);
    }

    #[test]
    fn parses_source_list() {
        let sources = parse_sources("drone=stub://drone, laptop=stub://laptop,stub://spare").unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].id, "drone");
        assert_eq!(sources[0].kind, SourceKind::Primary);
        assert_eq!(sources[1].priority, 1);
        assert_eq!(sources[2].id, "source2");
        assert_eq!(sources[2].locator, "stub://spare");
    }

    #[test]
    fn parses_resolution() {
        assert_eq!(parse_resolution("1280x720").unwrap(), (1280, 720));
        assert!(parse_resolution("1280").is_err());
        assert!(parse_resolution("axb").is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = PipelineConfig::default();
        cfg.prefetch_depth = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.scale_floor = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.sources.push(cfg.sources[0].clone());
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.retry_ceiling.render = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_reprobe_disables_probing() {
        assert_eq!(secs_to_interval("x", 0.0).unwrap(), None);
        assert_eq!(
            secs_to_interval("x", 1.5).unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert!(secs_to_interval("x", -1.0).is_err());
        assert!(secs_to_interval("x", f64::INFINITY).is_err());
        assert!(secs_to_interval("x", 1e300).is_err());
    }

    #[test]
    fn huge_rates_are_rejected_not_allocated() {
        let mut cfg = PipelineConfig::default();
        cfg.target_fps = 1e18;
        assert!(cfg.validate().is_err());
        assert!(cfg.telemetry_capacity() <= MAX_TELEMETRY_CAPACITY);

        let mut cfg = PipelineConfig::default();
        cfg.telemetry_capacity = Some(usize::MAX);
        assert!(cfg.validate().is_err());
    }
}
