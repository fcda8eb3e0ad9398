//! Vigil
//!
//! A fault-tolerant real-time detection loop: capture a frame, maybe run an
//! object detector on it, present the result, and keep doing so at an acceptable
//! frame rate while cameras drop out, inference stalls and displays go away.
//!
//! # Architecture
//!
//! The loop holds four guarantees:
//!
//! 1. **Bounded stages**: every collaborator call carries a timeout; an overrun is
//!    a failure of that stage, never a hang.
//! 2. **One frame in flight**: capture prefetches at most one frame ahead.
//! 3. **Partial service over shutdown**: losing detection leaves a display-only
//!    loop; only losing acquisition, rendering or memory ends the session.
//! 4. **Bounded log volume**: failures are reported through a per-kind
//!    exponential backoff.
//!
//! # Module Structure
//!
//! - `telemetry`: rolling cycle statistics (`TelemetryWindow`)
//! - `report`: rate-limited failure reporting (`RateLimitedReporter`)
//! - `source`: prioritized source fallback (`SourceSelector`)
//! - `governor`: detection scale and skip control (`PerformanceGovernor`)
//! - `recovery`: failure state machine (`RecoveryEngine`)
//! - `orchestrator`: the loop itself (`Orchestrator`)
//! - `ingest`, `detect`, `render`: collaborator contracts and built-in collaborators
//! - `stage`, `shutdown`: bounded worker calls and cooperative cancellation

pub mod config;
pub mod detect;
pub mod failure;
pub mod frame;
pub mod governor;
pub mod ingest;
pub mod orchestrator;
pub mod recovery;
pub mod render;
pub mod report;
pub mod shutdown;
pub mod source;
pub mod stage;
pub mod telemetry;

pub use config::{PipelineConfig, StageTimeouts};
pub use detect::{build_backends, InferenceBackend, MotionBackend};
pub use failure::{FailureEvent, FailureKind, ResourceExhausted};
pub use frame::{map_to_frame, BoundingBox, Detection, Frame, Region};
pub use governor::{CycleDecision, GovernorConfig, PerformanceGovernor};
pub use ingest::{
    CameraBackend, CaptureHandle, CaptureSettings, LocatorCamera, StillsCamera, SyntheticCamera,
};
pub use orchestrator::{
    Collaborators, CycleReport, CycleStatus, ExitStatus, Orchestrator, RunSummary,
};
pub use recovery::{
    CycleOutcome, FatalReason, RecoveryAction, RecoveryConfig, RecoveryEngine, RecoveryState,
    RetryCeilings, Transition,
};
pub use render::{Command, ConsoleRenderer, OverlayMeta, Renderer};
pub use report::{LogSink, RateLimitedReporter, ReportPolicy, ReportSink};
pub use shutdown::ShutdownSignal;
pub use source::{NoneAvailable, SourceDescriptor, SourceKind, SourceSelector};
pub use stage::{StageError, StageWorker};
pub use telemetry::{CycleRecord, PerformanceSnapshot, StageAverages, TelemetryWindow};
