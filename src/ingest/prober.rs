//! Opportunistic re-probe of failed sources.
//!
//! Runs on its own thread and talks to the rest of the loop only through
//! `SourceSelector::mark_healthy`. The active source is never probed; the capture
//! worker already owns it.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{CameraBackend, CaptureSettings};
use crate::source::SourceSelector;

pub struct SourceProber {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SourceProber {
    pub fn spawn(
        camera: Arc<dyn CameraBackend>,
        selector: Arc<SourceSelector>,
        settings: CaptureSettings,
        interval: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join = std::thread::Builder::new()
            .name("vigil-prober".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        probe_once(camera.as_ref(), &selector, &settings);
                    }
                    _ => break,
                }
            })
            .context("spawn source prober")?;
        log::info!("source prober running every {}ms", interval.as_millis());
        Ok(Self {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    /// Stop probing. A probe stuck inside a collaborator call is detached after `grace`.
    pub fn stop(mut self, grace: Duration) -> bool {
        self.stop = None;
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + grace;
        while !join.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if join.is_finished() {
            let _ = join.join();
            true
        } else {
            log::warn!("source prober did not stop within {}ms", grace.as_millis());
            false
        }
    }
}

/// Try every unhealthy, inactive source once. Returns the ids re-admitted.
pub fn probe_once(
    camera: &dyn CameraBackend,
    selector: &SourceSelector,
    settings: &CaptureSettings,
) -> Vec<String> {
    let active = selector.active();
    let mut recovered = Vec::new();
    for source in selector.snapshot() {
        if source.is_healthy || source.id == active.id {
            continue;
        }
        let reachable = match camera.open(&source, settings) {
            Ok(mut handle) => {
                let got_frame = matches!(handle.capture(), Ok(Some(_)));
                handle.close();
                got_frame
            }
            Err(err) => {
                log::debug!("probe: {} still unreachable: {:#}", source.id, err);
                false
            }
        };
        if reachable && selector.mark_healthy(&source.id) {
            log::info!("probe: source {} is reachable again", source.id);
            recovered.push(source.id);
        }
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SyntheticCamera;
    use crate::source::{SourceDescriptor, SourceKind};

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 4,
            height: 4,
            fps: 1000.0,
        }
    }

    #[test]
    fn probe_readmits_reachable_sources_only() {
        let selector = SourceSelector::new(vec![
            SourceDescriptor::new("main", "stub://main", 0, SourceKind::Primary),
            SourceDescriptor::new("spare", "stub://spare", 1, SourceKind::Fallback),
            SourceDescriptor::new("dead", "stub://dead?offline", 2, SourceKind::Fallback),
        ])
        .unwrap();
        selector.mark_unhealthy("spare");
        selector.mark_unhealthy("dead");

        let recovered = probe_once(&SyntheticCamera::unpaced(), &selector, &settings());
        assert_eq!(recovered, vec!["spare".to_string()]);
        assert_eq!(selector.healthy_count(), 2);
    }

    #[test]
    fn active_source_is_never_probed() {
        let selector = SourceSelector::new(vec![SourceDescriptor::new(
            "only",
            "stub://only",
            0,
            SourceKind::Primary,
        )])
        .unwrap();
        selector.mark_unhealthy("only");
        assert!(probe_once(&SyntheticCamera::unpaced(), &selector, &settings()).is_empty());
        assert_eq!(selector.healthy_count(), 0);
    }

    #[test]
    fn background_prober_stops_promptly() {
        let selector = Arc::new(
            SourceSelector::new(vec![
                SourceDescriptor::new("main", "stub://main", 0, SourceKind::Primary),
                SourceDescriptor::new("spare", "stub://spare", 1, SourceKind::Fallback),
            ])
            .unwrap(),
        );
        selector.mark_unhealthy("spare");
        let prober = SourceProber::spawn(
            Arc::new(SyntheticCamera::unpaced()),
            selector.clone(),
            settings(),
            Duration::from_millis(10),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while selector.healthy_count() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(selector.healthy_count(), 2);
        assert!(prober.stop(Duration::from_secs(1)));
    }
}
