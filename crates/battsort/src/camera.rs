//! Camera acquisition threads.
//!
//! A [`CameraWorker`] owns one frame source and hands every frame to a
//! [`FrameProcessor`]. When the source fails the worker exits and raises
//! `needs_restart`; the supervisor joins it and starts a fresh worker with
//! the same processor on a newly opened source. A cooperative stop never
//! raises `needs_restart`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::RgbImage;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera {name} could not be opened: {reason}")]
    Open { name: String, reason: String },
    #[error("camera {name} stopped delivering frames: {reason}")]
    Lost { name: String, reason: String },
    #[error("failed to spawn thread for camera {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// A live camera.
pub trait FrameSource: Send {
    /// Next frame. `Ok(None)` is a transient miss; `Err` ends the session.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, CameraError>;
}

/// Opens a new session on the same device after a failure.
pub type SourceOpener = Arc<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

/// Per-frame work done on a camera thread.
pub trait FrameProcessor: Send + 'static {
    fn on_frame(&mut self, frame: &RgbImage);
}

impl FrameProcessor for Box<dyn FrameProcessor> {
    fn on_frame(&mut self, frame: &RgbImage) {
        (**self).on_frame(frame);
    }
}

/// Cross-thread "please save the next frame" request.
///
/// Raised by an arm when it reaches an inspection pose, cleared by the
/// snapshot writer once the frame is on disk (or the write failed).
#[derive(Debug, Clone, Default)]
pub struct CaptureFlag(Arc<AtomicBool>);

impl CaptureFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn acknowledge(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Saves one frame per capture request as
/// `<dir>/snapshot_<timestamp>_<n>.png`.
pub struct SnapshotWriter {
    dir: PathBuf,
    capture: CaptureFlag,
    saved: u64,
    last_path: Option<PathBuf>,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, capture: CaptureFlag) -> Self {
        Self {
            dir: dir.into(),
            capture,
            saved: 0,
            last_path: None,
        }
    }

    pub fn saved(&self) -> u64 {
        self.saved
    }

    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }

    pub fn save(&mut self, frame: &RgbImage) -> Result<PathBuf, CameraError> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
        let path = self
            .dir
            .join(format!("snapshot_{stamp}_{:04}.png", self.saved));
        frame
            .save(&path)
            .map_err(|source| CameraError::Snapshot {
                path: path.clone(),
                source,
            })?;
        self.saved += 1;
        self.last_path = Some(path.clone());
        Ok(path)
    }
}

impl FrameProcessor for SnapshotWriter {
    fn on_frame(&mut self, frame: &RgbImage) {
        if !self.capture.is_requested() {
            return;
        }
        match self.save(frame) {
            Ok(path) => tracing::info!("snapshot saved to {}", path.display()),
            Err(e) => tracing::error!("{e}"),
        }
        // a failed write still releases the arm
        self.capture.acknowledge();
    }
}

/// Shared flags of a running worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerFlags {
    stop: Arc<AtomicBool>,
    is_open: Arc<AtomicBool>,
    needs_restart: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl WorkerFlags {
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    pub fn needs_restart(&self) -> bool {
        self.needs_restart.load(Ordering::Acquire)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

pub struct CameraWorker<P: FrameProcessor> {
    name: String,
    flags: WorkerFlags,
    handle: Option<JoinHandle<()>>,
    /// Lent to the thread while it runs, put back when it exits.
    processor: Arc<Mutex<Option<P>>>,
}

impl<P: FrameProcessor> CameraWorker<P> {
    /// Open a session through `opener` and start the acquisition thread.
    pub fn spawn(
        name: impl Into<String>,
        opener: &SourceOpener,
        processor: P,
    ) -> Result<Self, CameraError> {
        Self::launch(name.into(), opener, Arc::new(Mutex::new(Some(processor))))
    }

    fn launch(
        name: String,
        opener: &SourceOpener,
        slot: Arc<Mutex<Option<P>>>,
    ) -> Result<Self, CameraError> {
        let flags = WorkerFlags::default();
        let opener = Arc::clone(opener);
        let thread_flags = flags.clone();
        let thread_slot = Arc::clone(&slot);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("camera-{name}"))
            .spawn(move || {
                let flags = thread_flags;
                let Some(mut processor) = thread_slot.lock().take() else {
                    tracing::error!("camera {thread_name} started without a frame processor");
                    return;
                };
                let mut source = match opener() {
                    Ok(source) => source,
                    Err(e) => {
                        tracing::warn!("{e}");
                        *thread_slot.lock() = Some(processor);
                        flags.needs_restart.store(true, Ordering::Release);
                        return;
                    }
                };
                flags.is_open.store(true, Ordering::Release);
                tracing::info!("camera {thread_name} opened");
                while !flags.stop.load(Ordering::Acquire) {
                    match source.read_frame() {
                        Ok(Some(frame)) => {
                            processor.on_frame(&frame);
                            flags.frames.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(None) => thread::sleep(Duration::from_millis(1)),
                        Err(e) => {
                            tracing::warn!("{e}");
                            flags.needs_restart.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
                flags.is_open.store(false, Ordering::Release);
                tracing::info!("camera {thread_name} released");
                *thread_slot.lock() = Some(processor);
            })
            .map_err(|source| CameraError::Spawn {
                name: name.clone(),
                source,
            })?;
        Ok(Self {
            name,
            flags,
            handle: Some(handle),
            processor: slot,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> &WorkerFlags {
        &self.flags
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the thread to stop and wait for it. Returns the processor, or
    /// `None` if the thread panicked.
    pub fn stop(mut self) -> Option<P> {
        self.flags.request_stop();
        self.join_inner();
        self.processor.lock().take()
    }

    /// Join the thread if there is one. A panicked thread is flagged for
    /// restart.
    fn join_inner(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.join().is_err() {
            tracing::error!("camera {} thread panicked", self.name);
            self.flags.is_open.store(false, Ordering::Release);
            self.flags.needs_restart.store(true, Ordering::Release);
        }
    }

    /// If the worker exited asking for a restart, join it and start a new
    /// one with the same processor. Returns `Ok(None)` when no restart was
    /// needed.
    ///
    /// A failed re-spawn keeps the processor and leaves `needs_restart` set,
    /// so the next call tries again.
    pub fn restart_if_needed(
        &mut self,
        opener: &SourceOpener,
    ) -> Result<Option<()>, CameraError> {
        if !self.is_finished() {
            return Ok(None);
        }
        self.join_inner();
        if !self.flags.needs_restart() {
            return Ok(None);
        }
        if self.processor.lock().is_none() {
            return Err(CameraError::Lost {
                name: self.name.clone(),
                reason: "frame processor was lost with its thread".into(),
            });
        }
        tracing::info!("restarting camera {}", self.name);
        *self = Self::launch(self.name.clone(), opener, Arc::clone(&self.processor))?;
        Ok(Some(()))
    }
}

impl<P: FrameProcessor> Drop for CameraWorker<P> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.flags.request_stop();
            self.join_inner();
        }
    }
}

/// Frame source that replays a fixed frame list in a loop, optionally
/// failing after a number of frames. Used for simulation and tests.
pub struct ReplaySource {
    frames: Vec<RgbImage>,
    next: usize,
    fail_after: Option<usize>,
    period: Duration,
}

impl ReplaySource {
    pub fn new(frames: Vec<RgbImage>, period: Duration) -> Self {
        Self {
            frames,
            next: 0,
            fail_after: None,
            period,
        }
    }

    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl FrameSource for ReplaySource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
        if self.fail_after.is_some_and(|n| self.next >= n) {
            return Err(CameraError::Lost {
                name: "replay".into(),
                reason: format!("scripted failure after {} frames", self.next),
            });
        }
        if self.frames.is_empty() {
            return Ok(None);
        }
        if !self.period.is_zero() {
            thread::sleep(self.period);
        }
        let frame = self.frames[self.next % self.frames.len()].clone();
        self.next += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Counter(Arc<AtomicU64>);

    impl FrameProcessor for Counter {
        fn on_frame(&mut self, _frame: &RgbImage) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn capture_flag_is_shared_between_clones() {
        let a = CaptureFlag::new();
        let b = a.clone();
        a.request();
        assert!(b.is_requested());
        b.acknowledge();
        assert!(!a.is_requested());
    }

    #[test]
    fn snapshot_writer_saves_once_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let flag = CaptureFlag::new();
        let mut w = SnapshotWriter::new(dir.path(), flag.clone());
        let frame = RgbImage::from_pixel(4, 3, image::Rgb([1, 2, 3]));
        w.on_frame(&frame);
        assert_eq!(w.saved(), 0);
        flag.request();
        w.on_frame(&frame);
        w.on_frame(&frame);
        assert_eq!(w.saved(), 1);
        assert!(!flag.is_requested());
        let path = w.last_path().unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(image::open(path).unwrap().to_rgb8(), frame);
    }

    #[test]
    fn failed_snapshot_still_releases_the_request() {
        let flag = CaptureFlag::new();
        let mut w = SnapshotWriter::new("/nonexistent/snapshots", flag.clone());
        flag.request();
        w.on_frame(&RgbImage::new(2, 2));
        assert!(!flag.is_requested());
        assert_eq!(w.saved(), 0);
    }

    #[test]
    fn worker_feeds_processor_and_stops_cleanly() {
        let count = Arc::new(AtomicU64::new(0));
        let opener: SourceOpener = Arc::new(|| {
            Ok(Box::new(ReplaySource::new(vec![RgbImage::new(2, 2)], Duration::ZERO))
                as Box<dyn FrameSource>)
        });
        let worker = CameraWorker::spawn("test", &opener, Counter(Arc::clone(&count))).unwrap();
        assert!(wait_until(|| count.load(Ordering::Relaxed) > 10));
        assert!(worker.flags().is_open());
        let flags = worker.flags().clone();
        assert!(worker.stop().is_some());
        assert!(!flags.is_open());
        assert!(!flags.needs_restart());
    }

    #[test]
    fn failing_source_is_restarted_with_same_processor() {
        let count = Arc::new(AtomicU64::new(0));
        let opener: SourceOpener = Arc::new(|| {
            Ok(Box::new(
                ReplaySource::new(vec![RgbImage::new(2, 2)], Duration::ZERO).failing_after(3),
            ) as Box<dyn FrameSource>)
        });
        let mut worker = CameraWorker::spawn("flaky", &opener, Counter(Arc::clone(&count))).unwrap();
        assert!(wait_until(|| worker.flags().needs_restart() && worker.is_finished()));
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(worker.restart_if_needed(&opener).unwrap(), Some(()));
        assert!(wait_until(|| count.load(Ordering::Relaxed) == 6 && worker.is_finished()));
        assert!(worker.stop().is_some());
    }

    #[test]
    fn unopenable_source_requests_restart() {
        let opener: SourceOpener = Arc::new(|| {
            Err(CameraError::Open {
                name: "cam0".into(),
                reason: "no device".into(),
            })
        });
        let count = Arc::new(AtomicU64::new(0));
        let worker = CameraWorker::spawn("cam0", &opener, Counter(count)).unwrap();
        assert!(wait_until(|| worker.is_finished()));
        assert!(worker.flags().needs_restart());
        assert!(!worker.flags().is_open());
    }

    #[test]
    fn stopped_worker_is_not_restarted() {
        let count = Arc::new(AtomicU64::new(0));
        let opener: SourceOpener = Arc::new(|| {
            Ok(Box::new(ReplaySource::new(vec![RgbImage::new(2, 2)], Duration::ZERO))
                as Box<dyn FrameSource>)
        });
        let mut worker = CameraWorker::spawn("idle", &opener, Counter(Arc::clone(&count))).unwrap();
        assert!(wait_until(|| count.load(Ordering::Relaxed) > 0));
        worker.flags().request_stop();
        assert!(wait_until(|| worker.is_finished()));
        assert_eq!(worker.restart_if_needed(&opener).unwrap(), None);
        assert!(!worker.flags().needs_restart());
        assert!(worker.stop().is_some());
    }

    #[test]
    fn failed_open_is_retried_with_the_same_processor() {
        let attempts = Arc::new(AtomicU64::new(0));
        let opener: SourceOpener = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move || {
                if attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                    return Err(CameraError::Open {
                        name: "cam1".into(),
                        reason: "busy".into(),
                    });
                }
                Ok(Box::new(ReplaySource::new(vec![RgbImage::new(2, 2)], Duration::ZERO))
                    as Box<dyn FrameSource>)
            })
        };
        let count = Arc::new(AtomicU64::new(0));
        let mut worker = CameraWorker::spawn("cam1", &opener, Counter(Arc::clone(&count))).unwrap();
        assert!(wait_until(|| worker.is_finished()));
        assert!(worker.flags().needs_restart());

        assert_eq!(worker.restart_if_needed(&opener).unwrap(), Some(()));
        assert!(wait_until(|| count.load(Ordering::Relaxed) > 5));
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert!(worker.stop().is_some());
    }

    struct Exploding;

    impl FrameProcessor for Exploding {
        fn on_frame(&mut self, _frame: &RgbImage) {
            panic!("processor failure");
        }
    }

    #[test]
    fn processor_lost_to_a_panic_keeps_reporting() {
        let opener: SourceOpener = Arc::new(|| {
            Ok(Box::new(ReplaySource::new(vec![RgbImage::new(2, 2)], Duration::ZERO))
                as Box<dyn FrameSource>)
        });
        let mut worker = CameraWorker::spawn("boom", &opener, Exploding).unwrap();
        assert!(wait_until(|| worker.is_finished()));
        for _ in 0..2 {
            assert!(matches!(
                worker.restart_if_needed(&opener),
                Err(CameraError::Lost { .. })
            ));
            assert!(worker.flags().needs_restart());
            assert!(!worker.flags().is_open());
        }
        assert!(worker.stop().is_none());
    }
}
