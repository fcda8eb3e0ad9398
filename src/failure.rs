//! Failure taxonomy for the detection loop.
//!
//! Every stage call returns `Result<T, FailureEvent>`. Nothing else crosses a
//! stage boundary: collaborator errors, timeouts and panics are all classified
//! into one of four kinds here and then handed to the recovery engine and the
//! reporter by value.

use std::fmt;
use std::time::Instant;

use crate::stage::StageError;

/// Failure classes, ordered by severity (most severe first).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    /// Source unreachable or returned no frame.
    Capture,
    /// Presentation surface unavailable.
    Render,
    /// Memory or handle exhaustion signalled by a collaborator.
    Resource,
    /// Model call failed or timed out.
    Inference,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Capture,
        FailureKind::Render,
        FailureKind::Resource,
        FailureKind::Inference,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Capture => "capture",
            FailureKind::Render => "render",
            FailureKind::Resource => "resource",
            FailureKind::Inference => "inference",
        }
    }

    /// Kinds whose exhaustion ends the session. Inference is recovered by
    /// switching the loop to display-only, resource pressure by shedding load.
    pub fn is_fatal_capable(self) -> bool {
        matches!(self, FailureKind::Capture | FailureKind::Render)
    }

    /// Higher is more severe.
    pub fn severity(self) -> u8 {
        match self {
            FailureKind::Capture => 3,
            FailureKind::Render => 2,
            FailureKind::Resource => 1,
            FailureKind::Inference => 0,
        }
    }

    pub fn troubleshooting(self) -> &'static str {
        match self {
            FailureKind::Capture => {
                "check camera connections and make sure no other application holds the device"
            }
            FailureKind::Render => {
                "check display settings and that the process may open a presentation surface"
            }
            FailureKind::Resource => "close other applications to free memory or lower the resolution",
            FailureKind::Inference => {
                "the model may be overloaded; the loop continues and will retry detection"
            }
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure. Transient: passed by value, never persisted.
#[derive(Clone, Debug)]
pub struct FailureEvent {
    pub kind: FailureKind,
    pub message: String,
    pub timestamp: Instant,
}

impl FailureEvent {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn at(kind: FailureKind, message: impl Into<String>, timestamp: Instant) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp,
        }
    }

    /// Classify a collaborator error raised by a stage of `kind`.
    ///
    /// Errors carrying a [`ResourceExhausted`] marker are reclassified as
    /// `Resource` whichever stage raised them.
    pub fn from_error(kind: FailureKind, err: &anyhow::Error) -> Self {
        if let Some(exhausted) = err.downcast_ref::<ResourceExhausted>() {
            return Self::new(
                FailureKind::Resource,
                format!("{} stage: {}", kind, exhausted),
            );
        }
        Self::new(kind, format!("{:#}", err))
    }

    pub fn from_stage_error(kind: FailureKind, err: StageError) -> Self {
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for FailureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Marker error a collaborator returns to signal memory/handle exhaustion.
///
/// ```
/// use vigil::ResourceExhausted;
/// let err: anyhow::Error = ResourceExhausted::new("decoder pool empty").into();
/// assert!(err.downcast_ref::<ResourceExhausted>().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct ResourceExhausted {
    pub detail: String,
}

impl ResourceExhausted {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ResourceExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource exhausted: {}", self.detail)
    }
}

impl std::error::Error for ResourceExhausted {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn resource_marker_reclassifies_stage_error() {
        let err: anyhow::Error = ResourceExhausted::new("no buffers").into();
        let event = FailureEvent::from_error(FailureKind::Capture, &err);
        assert_eq!(event.kind, FailureKind::Resource);
        assert!(event.message.contains("no buffers"));
    }

    #[test]
    fn plain_error_keeps_stage_kind() {
        let err = anyhow!("model crashed");
        let event = FailureEvent::from_error(FailureKind::Inference, &err);
        assert_eq!(event.kind, FailureKind::Inference);
        assert_eq!(event.message, "model crashed");
    }

    #[test]
    fn severity_orders_capture_first() {
        let mut kinds = FailureKind::ALL.to_vec();
        kinds.sort_by_key(|k| std::cmp::Reverse(k.severity()));
        assert_eq!(kinds[0], FailureKind::Capture);
        assert_eq!(kinds[3], FailureKind::Inference);
        assert!(!FailureKind::Inference.is_fatal_capable());
    }

    #[test]
    fn only_capture_and_render_can_end_the_session() {
        assert!(FailureKind::Capture.is_fatal_capable());
        assert!(FailureKind::Render.is_fatal_capable());
        assert!(!FailureKind::Resource.is_fatal_capable());
    }
}
