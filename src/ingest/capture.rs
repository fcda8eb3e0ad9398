//! Prefetching capture stage.
//!
//! Every `open` starts a fresh worker thread that owns that source's
//! `CaptureHandle` and captures continuously. Results are handed to the loop over
//! a rendezvous channel, so while the loop processes frame N the worker holds at
//! most frame N+1: exactly one frame in flight, and a capture faster than the
//! loop simply blocks on the handoff.
//!
//! Reopening retires the previous worker instead of queueing behind it. A worker
//! stuck inside `capture` is abandoned: its channels are dropped, it exits and
//! closes its handle once the call returns, and the new source starts right away.

use anyhow::{anyhow, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{CameraBackend, CaptureHandle, CaptureSettings};
use crate::frame::Frame;
use crate::shutdown::ShutdownSignal;
use crate::source::SourceDescriptor;
use crate::stage::StageError;

const POLL_SLICE: Duration = Duration::from_millis(10);

enum WorkerCommand {
    Reclaim,
    Stop,
}

#[derive(Debug)]
pub enum CaptureOutcome {
    Frame(Frame),
    /// The source answered but had no frame.
    Unavailable,
    /// The source could not be opened. The worker idles until the next `open`.
    OpenFailed(anyhow::Error),
    Failed(anyhow::Error),
}

#[derive(Debug)]
pub struct Captured {
    pub generation: u64,
    pub source_id: String,
    pub outcome: CaptureOutcome,
    /// Time spent inside the collaborator's `open`/`capture`.
    pub elapsed: Duration,
}

/// The thread serving one opened source.
struct SourceWorker {
    source_id: String,
    commands: Sender<WorkerCommand>,
    frames: Receiver<Captured>,
    join: JoinHandle<()>,
}

pub struct CaptureStage {
    camera: Arc<dyn CameraBackend>,
    settings: CaptureSettings,
    cancel: ShutdownSignal,
    generation: u64,
    current: Option<SourceWorker>,
    /// Workers from earlier opens that have not exited yet.
    retired: Vec<(String, JoinHandle<()>)>,
}

impl CaptureStage {
    /// Prepare the stage. `prefetch_depth` is the number of frames allowed in
    /// flight ahead of the loop; only 1 is supported. Nothing runs until `open`.
    pub fn spawn(
        camera: Arc<dyn CameraBackend>,
        settings: CaptureSettings,
        prefetch_depth: usize,
        cancel: ShutdownSignal,
    ) -> Result<Self> {
        if prefetch_depth != 1 {
            return Err(anyhow!(
                "prefetch depth must be 1, got {}",
                prefetch_depth
            ));
        }
        Ok(Self {
            camera,
            settings,
            cancel,
            generation: 0,
            current: None,
            retired: Vec::new(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Workers abandoned by earlier opens that are still running.
    pub fn lingering_workers(&self) -> usize {
        self.retired.iter().filter(|(_, j)| !j.is_finished()).count()
    }

    /// Switch to `source` on a new worker. Never waits on the previous one.
    pub fn open(&mut self, source: SourceDescriptor) -> Result<u64> {
        self.retire_current();
        self.generation += 1;
        let generation = self.generation;
        log::debug!("capture: opening {} (generation {})", source.id, generation);

        let (cmd_tx, cmd_rx) = mpsc::channel();
        // The frame the worker is blocked handing over is the one in flight.
        let (frame_tx, frame_rx) = mpsc::sync_channel(0);
        let source_id = source.id.clone();
        let camera = self.camera.clone();
        let settings = self.settings.clone();
        let join = std::thread::Builder::new()
            .name("vigil-capture".to_string())
            .spawn(move || run_source(camera, settings, source, generation, cmd_rx, frame_tx))
            .context("spawn capture worker")?;
        self.current = Some(SourceWorker {
            source_id,
            commands: cmd_tx,
            frames: frame_rx,
            join,
        });
        Ok(generation)
    }

    pub fn reclaim(&self) {
        if let Some(worker) = self.current.as_ref() {
            let _ = worker.commands.send(WorkerCommand::Reclaim);
        }
    }

    /// Wait up to `timeout` for the next result from the current source.
    pub fn next(&self, timeout: Duration) -> Result<Captured, StageError> {
        let worker = self.current.as_ref().ok_or(StageError::Disconnected)?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.cancel.is_requested() {
                return Err(StageError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StageError::TimedOut(timeout));
            }
            match worker.frames.recv_timeout((deadline - now).min(POLL_SLICE)) {
                Ok(captured) => return Ok(captured),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(StageError::Disconnected),
            }
        }
    }

    /// Stop capturing and close every source, waiting up to `grace`.
    pub fn stop(mut self, grace: Duration) -> bool {
        self.retire_current();
        let deadline = Instant::now() + grace;
        while self.lingering_workers() > 0 && Instant::now() < deadline {
            std::thread::sleep(POLL_SLICE);
        }
        let mut clean = true;
        for (id, join) in self.retired.drain(..) {
            if join.is_finished() {
                let _ = join.join();
            } else {
                log::warn!(
                    "capture worker for {} did not stop within {}ms; detaching",
                    id,
                    grace.as_millis()
                );
                clean = false;
            }
        }
        clean
    }

    fn retire_current(&mut self) {
        if let Some(worker) = self.current.take() {
            let _ = worker.commands.send(WorkerCommand::Stop);
            // Dropping the receiver unblocks a worker waiting on the handoff.
            drop(worker.frames);
            self.retired.push((worker.source_id, worker.join));
        }

        let mut running = Vec::with_capacity(self.retired.len());
        for (id, join) in self.retired.drain(..) {
            if join.is_finished() {
                let _ = join.join();
            } else {
                running.push((id, join));
            }
        }
        if running.len() > 1 {
            log::debug!("capture: {} abandoned workers still running", running.len());
        }
        self.retired = running;
    }
}

fn run_source(
    camera: Arc<dyn CameraBackend>,
    settings: CaptureSettings,
    source: SourceDescriptor,
    generation: u64,
    commands: Receiver<WorkerCommand>,
    frames: SyncSender<Captured>,
) {
    let started = Instant::now();
    let opened = panic::catch_unwind(AssertUnwindSafe(|| camera.open(&source, &settings)))
        .unwrap_or_else(|_| Err(anyhow!("camera backend panicked while opening")));
    let mut handle: Box<dyn CaptureHandle> = match opened {
        Ok(handle) => handle,
        Err(err) => {
            let failed = Captured {
                generation,
                source_id: source.id,
                outcome: CaptureOutcome::OpenFailed(err),
                elapsed: started.elapsed(),
            };
            if frames.send(failed).is_ok() {
                // Idle until retired.
                while let Ok(WorkerCommand::Reclaim) = commands.recv() {}
            }
            return;
        }
    };

    loop {
        match commands.try_recv() {
            Ok(WorkerCommand::Reclaim) => {
                if let Err(err) = handle.reclaim() {
                    log::debug!("capture: reclaim on {} failed: {:#}", source.id, err);
                }
                continue;
            }
            Ok(WorkerCommand::Stop) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let started = Instant::now();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handle.capture())) {
            Ok(Ok(Some(frame))) => CaptureOutcome::Frame(frame),
            Ok(Ok(None)) => CaptureOutcome::Unavailable,
            Ok(Err(err)) => CaptureOutcome::Failed(err),
            Err(_) => CaptureOutcome::Failed(anyhow!("capture handle panicked")),
        };
        let captured = Captured {
            generation,
            source_id: source.id.clone(),
            outcome,
            elapsed: started.elapsed(),
        };
        if frames.send(captured).is_err() {
            break;
        }
    }

    handle.close();
    log::debug!("capture: released {}", source.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SyntheticCamera;
    use crate::source::SourceKind;

    /// `hang://` sources open fine and then block in `capture`.
    struct StallingCamera {
        inner: SyntheticCamera,
    }

    struct StalledHandle;

    impl CaptureHandle for StalledHandle {
        fn capture(&mut self) -> Result<Option<Frame>> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(None)
        }
    }

    impl CameraBackend for StallingCamera {
        fn open(
            &self,
            source: &SourceDescriptor,
            settings: &CaptureSettings,
        ) -> Result<Box<dyn CaptureHandle>> {
            if source.locator.starts_with("hang://") {
                return Ok(Box::new(StalledHandle));
            }
            self.inner.open(source, settings)
        }
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 8,
            height: 8,
            fps: 1000.0,
        }
    }

    fn stage() -> CaptureStage {
        CaptureStage::spawn(
            Arc::new(SyntheticCamera::unpaced()),
            settings(),
            1,
            ShutdownSignal::new(),
        )
        .unwrap()
    }

    fn source(id: &str, locator: &str) -> SourceDescriptor {
        SourceDescriptor::new(id, locator, 0, SourceKind::Primary)
    }

    #[test]
    fn rejects_deeper_prefetch() {
        let result = CaptureStage::spawn(
            Arc::new(SyntheticCamera::unpaced()),
            CaptureSettings::default(),
            2,
            ShutdownSignal::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn nothing_to_read_before_open() {
        let stage = stage();
        assert_eq!(
            stage.next(Duration::from_millis(20)).unwrap_err(),
            StageError::Disconnected
        );
        assert!(stage.stop(Duration::from_millis(50)));
    }

    #[test]
    fn delivers_frames_in_order() {
        let mut stage = stage();
        stage.open(source("a", "stub://a")).unwrap();
        let mut last = 0;
        for _ in 0..5 {
            let captured = stage.next(Duration::from_secs(2)).unwrap();
            let CaptureOutcome::Frame(frame) = captured.outcome else {
                panic!("expected frame");
            };
            assert!(frame.sequence > last);
            last = frame.sequence;
        }
        assert!(stage.stop(Duration::from_secs(1)));
    }

    #[test]
    fn reopen_only_yields_the_new_source() {
        let mut stage = stage();
        stage.open(source("a", "stub://a")).unwrap();
        stage.next(Duration::from_secs(2)).unwrap();
        stage.open(source("b", "stub://b")).unwrap();
        for _ in 0..3 {
            let captured = stage.next(Duration::from_secs(2)).unwrap();
            assert_eq!(captured.source_id, "b");
            assert_eq!(captured.generation, 2);
        }
        assert!(stage.stop(Duration::from_secs(1)));
    }

    #[test]
    fn reopen_does_not_wait_for_a_stalled_capture() {
        let camera = StallingCamera {
            inner: SyntheticCamera::unpaced(),
        };
        let mut stage =
            CaptureStage::spawn(Arc::new(camera), settings(), 1, ShutdownSignal::new()).unwrap();
        stage.open(source("stuck", "hang://stuck")).unwrap();
        assert_eq!(
            stage.next(Duration::from_millis(50)).unwrap_err(),
            StageError::TimedOut(Duration::from_millis(50))
        );

        let started = Instant::now();
        stage.open(source("b", "stub://b")).unwrap();
        let captured = stage.next(Duration::from_secs(1)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(captured.source_id, "b");
        assert!(matches!(captured.outcome, CaptureOutcome::Frame(_)));
        assert_eq!(stage.lingering_workers(), 1);

        // The stalled worker is still inside `capture` and gets detached.
        assert!(!stage.stop(Duration::from_millis(50)));
    }

    #[test]
    fn open_failure_is_reported_then_worker_idles() {
        let mut stage = stage();
        stage.open(source("a", "stub://a?offline")).unwrap();
        let captured = stage.next(Duration::from_secs(2)).unwrap();
        assert!(matches!(captured.outcome, CaptureOutcome::OpenFailed(_)));
        assert_eq!(
            stage.next(Duration::from_millis(50)).unwrap_err(),
            StageError::TimedOut(Duration::from_millis(50))
        );
        assert!(stage.stop(Duration::from_secs(1)));
    }

    #[test]
    fn unavailable_frames_are_surfaced() {
        let mut stage = stage();
        stage.open(source("a", "stub://a?fail_after=1")).unwrap();
        assert!(matches!(
            stage.next(Duration::from_secs(2)).unwrap().outcome,
            CaptureOutcome::Frame(_)
        ));
        assert!(matches!(
            stage.next(Duration::from_secs(2)).unwrap().outcome,
            CaptureOutcome::Unavailable
        ));
    }
}
