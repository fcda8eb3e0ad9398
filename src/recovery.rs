//! Failure recovery state machine.
//!
//! `RecoveryEngine` is evaluated once per cycle with that cycle's outcome and
//! returns a `Transition` naming the new state and the corrective actions the
//! orchestrator must carry out. The engine itself never touches a collaborator;
//! when an action turns out to be impossible (no fallback inference backend, for
//! instance) the orchestrator feeds that back through `capability_exhausted`.
//!
//! States:
//! - `Stable`: nothing wrong.
//! - `Degraded`: tolerating up to the per-kind retry ceiling of consecutive
//!   failures of one kind; one clean cycle returns to `Stable`.
//! - `Recovering`: the ceiling was hit; each further failure is another attempt,
//!   separated by exponential backoff, up to `max_attempts`.
//! - `Fatal`: terminal. Reached by exhausting a fatal-capable kind (capture or
//!   render), or by an explicit shutdown. Exhausted inference turns detection
//!   off; exhausted resource pressure sheds detection load and keeps going.

use std::fmt;
use std::time::Duration;

use crate::failure::{FailureEvent, FailureKind};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Consecutive failures tolerated per kind before recovery starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryCeilings {
    pub capture: u32,
    pub inference: u32,
    pub render: u32,
    pub resource: u32,
}

impl RetryCeilings {
    pub fn for_kind(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Capture => self.capture,
            FailureKind::Inference => self.inference,
            FailureKind::Render => self.render,
            FailureKind::Resource => self.resource,
        }
    }
}

impl Default for RetryCeilings {
    fn default() -> Self {
        Self {
            capture: 3,
            inference: 5,
            render: 3,
            resource: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub retry_ceiling: RetryCeilings,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: RetryCeilings::default(),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// States, actions, transitions
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    Stable,
    Degraded { kind: FailureKind, consecutive: u32 },
    Recovering { kind: FailureKind, attempt: u32 },
    Fatal,
}

impl RecoveryState {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecoveryState::Fatal)
    }

    /// Kind currently being tolerated or recovered, if any.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            RecoveryState::Degraded { kind, .. } | RecoveryState::Recovering { kind, .. } => {
                Some(*kind)
            }
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryState::Stable => f.write_str("stable"),
            RecoveryState::Degraded { kind, consecutive } => {
                write!(f, "degraded({}, {})", kind, consecutive)
            }
            RecoveryState::Recovering { kind, attempt } => {
                write!(f, "recovering({}, attempt {})", kind, attempt)
            }
            RecoveryState::Fatal => f.write_str("fatal"),
        }
    }
}

/// Corrective work the orchestrator performs after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Mark the active source unhealthy and move to the next healthy one.
    SwitchSource,
    /// Give failed sources another chance, pick the best and reopen it.
    ReprobeSources,
    /// Present this cycle without detections; detection is retried next cycle.
    ContinueDisplayOnly,
    /// Move to the next configured inference backend.
    SwitchInferenceBackend,
    /// Turn detection off for the rest of the session.
    DisableDetection,
    RestartRenderer,
    /// Ask every collaborator to free what it can and compact internal buffers.
    ReclaimResources,
    /// Drop the governor to its most degraded setting.
    ShedDetectionLoad,
    /// Stop the loop and release everything.
    Teardown,
}

/// Why the engine reached `Fatal`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FatalReason {
    /// Explicit shutdown. Not an error.
    Shutdown,
    Exhausted { kind: FailureKind, message: String },
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::Shutdown => f.write_str("shutdown requested"),
            FatalReason::Exhausted { kind, message } => {
                write!(f, "{} recovery exhausted: {}", kind, message)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub from: RecoveryState,
    pub to: RecoveryState,
    /// Failure that drove the transition.
    pub trigger: Option<FailureEvent>,
    pub actions: Vec<RecoveryAction>,
    /// Wait before the affected stage runs again.
    pub delay: Option<Duration>,
}

impl Transition {
    fn stay(state: RecoveryState) -> Self {
        Self {
            from: state,
            to: state,
            trigger: None,
            actions: Vec::new(),
            delay: None,
        }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn has_action(&self, action: RecoveryAction) -> bool {
        self.actions.contains(&action)
    }
}

/// What happened during one cycle.
#[derive(Clone, Debug, Default)]
pub struct CycleOutcome {
    pub failures: Vec<FailureEvent>,
    /// A frame was captured.
    pub captured: bool,
    /// Inference ran to completion.
    pub inferred: bool,
    /// A frame was presented.
    pub presented: bool,
    /// Resource usage was checked and found within limits.
    pub resources_checked: bool,
}

impl CycleOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn exercised(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::Capture => self.captured,
            FailureKind::Inference => self.inferred,
            FailureKind::Render => self.presented,
            FailureKind::Resource => self.resources_checked,
        }
    }

    /// Most severe failure of the cycle.
    pub fn worst(&self) -> Option<&FailureEvent> {
        self.failures.iter().max_by_key(|f| f.kind.severity())
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

pub struct RecoveryEngine {
    config: RecoveryConfig,
    state: RecoveryState,
    detection_disabled: bool,
    fatal_reason: Option<FatalReason>,
    recovery_attempts: u64,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: RecoveryState::Stable,
            detection_disabled: false,
            fatal_reason: None,
            recovery_attempts: 0,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn is_fatal(&self) -> bool {
        self.state.is_fatal()
    }

    pub fn detection_disabled(&self) -> bool {
        self.detection_disabled
    }

    pub fn fatal_reason(&self) -> Option<&FatalReason> {
        self.fatal_reason.as_ref()
    }

    /// Recovery attempts made over the session.
    pub fn recovery_attempts(&self) -> u64 {
        self.recovery_attempts
    }

    /// `base * 2^(attempt-1)`, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        self.config
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.config.backoff_cap)
    }

    /// Advance the machine by one cycle.
    pub fn observe(&mut self, outcome: &CycleOutcome) -> Transition {
        let from = self.state;
        if from.is_fatal() {
            return Transition::stay(from);
        }

        let Some(event) = outcome.worst().cloned() else {
            return match from.kind() {
                Some(kind) if self.cycle_clears(kind, outcome) => {
                    self.state = RecoveryState::Stable;
                    Transition {
                        from,
                        to: self.state,
                        trigger: None,
                        actions: Vec::new(),
                        delay: None,
                    }
                }
                // Stable, or the affected stage did not run: nothing learned.
                _ => Transition::stay(from),
            };
        };

        let kind = event.kind;
        let (to, actions, delay) = match from {
            RecoveryState::Degraded {
                kind: current,
                consecutive,
            } if current == kind => self.escalate(kind, consecutive + 1),
            RecoveryState::Recovering {
                kind: current,
                attempt,
            } if current == kind => {
                let attempt = attempt + 1;
                if attempt > self.config.max_attempts {
                    self.exhaust(kind, &event.message)
                } else {
                    self.recovery_attempts += 1;
                    (
                        RecoveryState::Recovering { kind, attempt },
                        recovering_actions(kind),
                        Some(self.backoff_for(attempt)),
                    )
                }
            }
            // Stable, or a different kind than the one being tracked.
            _ => self.escalate(kind, 1),
        };

        self.state = to;
        Transition {
            from,
            to,
            trigger: Some(event),
            actions,
            delay,
        }
    }

    /// The orchestrator could not carry out the corrective action for `kind`.
    pub fn capability_exhausted(&mut self, kind: FailureKind, message: &str) -> Transition {
        let from = self.state;
        if from.is_fatal() {
            return Transition::stay(from);
        }
        let (to, actions, delay) = self.exhaust(kind, message);
        self.state = to;
        Transition {
            from,
            to,
            trigger: Some(FailureEvent::new(kind, message)),
            actions,
            delay,
        }
    }

    /// Explicit shutdown: any state goes to `Fatal` through the graceful path.
    pub fn shutdown(&mut self) -> Transition {
        let from = self.state;
        if !from.is_fatal() {
            self.state = RecoveryState::Fatal;
            self.fatal_reason = Some(FatalReason::Shutdown);
        }
        Transition {
            from,
            to: self.state,
            trigger: None,
            actions: vec![RecoveryAction::Teardown],
            delay: None,
        }
    }

    fn cycle_clears(&self, kind: FailureKind, outcome: &CycleOutcome) -> bool {
        outcome.exercised(kind) || (kind == FailureKind::Inference && self.detection_disabled)
    }

    fn escalate(
        &mut self,
        kind: FailureKind,
        consecutive: u32,
    ) -> (RecoveryState, Vec<RecoveryAction>, Option<Duration>) {
        if consecutive >= self.config.retry_ceiling.for_kind(kind) {
            self.recovery_attempts += 1;
            (
                RecoveryState::Recovering { kind, attempt: 1 },
                recovering_actions(kind),
                Some(self.backoff_for(1)),
            )
        } else {
            (
                RecoveryState::Degraded { kind, consecutive },
                degraded_actions(kind),
                None,
            )
        }
    }

    fn exhaust(
        &mut self,
        kind: FailureKind,
        message: &str,
    ) -> (RecoveryState, Vec<RecoveryAction>, Option<Duration>) {
        if kind.is_fatal_capable() {
            self.fatal_reason = Some(FatalReason::Exhausted {
                kind,
                message: message.to_string(),
            });
            (RecoveryState::Fatal, vec![RecoveryAction::Teardown], None)
        } else {
            let consecutive = self.config.retry_ceiling.for_kind(kind) + self.config.max_attempts;
            let state = RecoveryState::Degraded { kind, consecutive };
            if kind == FailureKind::Resource {
                // Keep running at the lowest load; the cap spaces out further tries.
                (
                    state,
                    vec![
                        RecoveryAction::ReclaimResources,
                        RecoveryAction::ShedDetectionLoad,
                    ],
                    Some(self.config.backoff_cap),
                )
            } else {
                self.detection_disabled = true;
                (state, vec![RecoveryAction::DisableDetection], None)
            }
        }
    }
}

fn degraded_actions(kind: FailureKind) -> Vec<RecoveryAction> {
    vec![match kind {
        FailureKind::Capture => RecoveryAction::SwitchSource,
        FailureKind::Inference => RecoveryAction::ContinueDisplayOnly,
        FailureKind::Render => RecoveryAction::RestartRenderer,
        FailureKind::Resource => RecoveryAction::ReclaimResources,
    }]
}

fn recovering_actions(kind: FailureKind) -> Vec<RecoveryAction> {
    vec![match kind {
        FailureKind::Capture => RecoveryAction::ReprobeSources,
        FailureKind::Inference => RecoveryAction::SwitchInferenceBackend,
        FailureKind::Render => RecoveryAction::RestartRenderer,
        FailureKind::Resource => RecoveryAction::ReclaimResources,
    }]
}
