use anyhow::{anyhow, Result};

use super::backend::InferenceBackend;
use super::backends::MotionBackend;

/// Build the inference fallback chain from configuration entries.
///
/// Entries, in preference order:
/// - `motion`
/// - `tract:<model.onnx>` or `tract:<model.onnx>@<W>x<H>` (feature `backend-tract`;
///   input defaults to 224x224)
pub fn build_backends(specs: &[String]) -> Result<Vec<Box<dyn InferenceBackend>>> {
    specs.iter().map(|spec| build_backend(spec)).collect()
}

fn build_backend(spec: &str) -> Result<Box<dyn InferenceBackend>> {
    let (kind, arg) = match spec.split_once(':') {
        Some((kind, arg)) => (kind, Some(arg)),
        None => (spec, None),
    };
    match (kind, arg) {
        ("motion", None) => Ok(Box::new(MotionBackend::new())),
        ("tract", Some(arg)) => build_tract(arg),
        _ => Err(anyhow!("unknown inference backend '{}'", spec)),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(arg: &str) -> Result<Box<dyn InferenceBackend>> {
    let (path, size) = match arg.rsplit_once('@') {
        Some((path, size)) => (path, Some(size)),
        None => (arg, None),
    };
    let (width, height) = match size {
        Some(size) => {
            let (w, h) = size
                .split_once('x')
                .ok_or_else(|| anyhow!("model size must look like 224x224, got '{}'", size))?;
            (w.parse()?, h.parse()?)
        }
        None => (224, 224),
    };
    Ok(Box::new(super::backends::TractBackend::new(path, width, height)?))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_arg: &str) -> Result<Box<dyn InferenceBackend>> {
    Err(anyhow!(
        "tract backend requested but vigil was built without the backend-tract feature"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_motion_chain() {
        let chain = build_backends(&["motion".to_string(), "motion".to_string()]).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].name(), "motion");
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(build_backends(&["yolo".to_string()]).is_err());
        assert!(build_backends(&["motion:extra".to_string()]).is_err());
    }
}
