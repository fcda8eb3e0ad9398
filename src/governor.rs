//! Adaptive performance control.
//!
//! The governor watches the measured frame rate and trades detection quality for
//! throughput. Under sustained low FPS it first shrinks the frame handed to the
//! detector, then skips detection on a fraction of cycles. Capture and present run
//! every cycle regardless. Separate degrade/recover streaks give hysteresis.

use crate::telemetry::TelemetryWindow;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GovernorConfig {
    pub target_fps: f64,
    /// Smallest detector scale, in (0, 1].
    pub scale_floor: f64,
    /// Multiplier applied per degrade step, in (0, 1).
    pub scale_step: f64,
    /// Consecutive below-target samples before a degrade step.
    pub degrade_streak: u32,
    /// Consecutive at-or-above-target samples before a recover step.
    pub recover_streak: u32,
    /// Detection runs on one cycle in `max_skip_ratio` at most degradation.
    pub max_skip_ratio: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            target_fps: 15.0,
            scale_floor: 0.5,
            scale_step: 0.75,
            degrade_streak: 3,
            recover_streak: 10,
            max_skip_ratio: 3,
        }
    }
}

/// What to do with the current cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CycleDecision {
    pub run_detection: bool,
    /// Factor the frame is down-sampled by before detection.
    pub target_scale: f64,
}

pub struct PerformanceGovernor {
    config: GovernorConfig,
    scale: f64,
    /// 1 = detect every cycle, 2 = every other cycle, ...
    skip_ratio: u32,
    below_streak: u32,
    above_streak: u32,
    cycle: u64,
}

impl PerformanceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            scale: 1.0,
            skip_ratio: 1,
            below_streak: 0,
            above_streak: 0,
            cycle: 0,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn target_scale(&self) -> f64 {
        self.scale
    }

    pub fn skip_ratio(&self) -> u32 {
        self.skip_ratio
    }

    /// True when neither scale nor skip-rate is degraded.
    pub fn is_nominal(&self) -> bool {
        self.skip_ratio == 1 && self.scale >= 1.0
    }

    pub fn decide_for_cycle(&mut self, telemetry: &TelemetryWindow) -> CycleDecision {
        self.decide_with_fps(telemetry.current_fps())
    }

    /// Feed one FPS sample and decide the cycle.
    ///
    /// A sample of zero or less means no history yet and leaves both streaks alone.
    pub fn decide_with_fps(&mut self, fps: f64) -> CycleDecision {
        if fps > 0.0 {
            self.observe(fps);
        }
        let run_detection = self.cycle % u64::from(self.skip_ratio) == 0;
        self.cycle = self.cycle.wrapping_add(1);
        CycleDecision {
            run_detection,
            target_scale: self.scale,
        }
    }

    fn observe(&mut self, fps: f64) {
        if fps < self.config.target_fps {
            self.above_streak = 0;
            self.below_streak += 1;
            if self.below_streak >= self.config.degrade_streak {
                self.below_streak = 0;
                self.degrade();
            }
        } else {
            self.below_streak = 0;
            self.above_streak += 1;
            if self.above_streak >= self.config.recover_streak {
                self.above_streak = 0;
                self.recover();
            }
        }
    }

    fn degrade(&mut self) {
        let floor = self.config.scale_floor;
        if self.scale > floor {
            self.scale = (self.scale * self.config.scale_step).max(floor);
            log::debug!("governor: detector scale lowered to {:.2}", self.scale);
        } else if self.skip_ratio < self.config.max_skip_ratio {
            self.skip_ratio += 1;
            self.cycle = 0;
            log::debug!("governor: detecting on 1 of {} cycles", self.skip_ratio);
        }
    }

    /// Jump straight to the most degraded setting. Normal recovery applies afterwards.
    pub fn force_floor(&mut self) {
        self.scale = self.config.scale_floor;
        self.skip_ratio = self.config.max_skip_ratio.max(1);
        self.below_streak = 0;
        self.above_streak = 0;
        self.cycle = 0;
        log::debug!(
            "governor: shedding load, scale {:.2}, detecting on 1 of {} cycles",
            self.scale,
            self.skip_ratio
        );
    }

    fn recover(&mut self) {
        if self.skip_ratio > 1 {
            self.skip_ratio -= 1;
            self.cycle = 0;
            log::debug!("governor: detecting on 1 of {} cycles", self.skip_ratio);
        } else if self.scale < 1.0 {
            let raised = self.scale / self.config.scale_step;
            // Snap to 1.0 so float drift never leaves us a hair under full scale.
            self.scale = if raised >= 1.0 - 1e-9 { 1.0 } else { raised };
            log::debug!("governor: detector scale raised to {:.2}", self.scale);
        }
    }
}
