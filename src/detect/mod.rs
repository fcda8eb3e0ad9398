//! Inference collaborators.
//!
//! The loop treats the detector as an opaque service: a frame goes in, a list of
//! detections comes out. Backends are listed in fallback order; when one keeps
//! failing the loop moves on to the next.

mod backend;
mod backends;
mod registry;

pub use backend::InferenceBackend;
pub use backends::MotionBackend;
pub use registry::build_backends;

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
