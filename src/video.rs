// src/video.rs - Camera capture and synthetic frame feeds
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::CaptureError;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive `frame()` failures after which an open stream counts as lost.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

/// One captured frame. `timestamp` is monotonic from the moment the feed opened.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Arc<RgbImage>,
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
}

impl VideoFrame {
    pub fn new(image: RgbImage, timestamp: Duration) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image: Arc::new(image),
            timestamp,
            width,
            height,
        }
    }

    pub fn blank(width: u32, height: u32, timestamp: Duration) -> Self {
        Self::new(RgbImage::new(width, height), timestamp)
    }
}

/// Latest-frame view shared with the presentation layer.
pub type FramePreview = watch::Receiver<Option<VideoFrame>>;

/// A video source the frame loop polls once per tick.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CaptureError>;

    fn close(&mut self);

    /// Most recent frame, or `None` before the first frame arrives.
    /// Returns the same frame (same timestamp) until a newer one is captured.
    fn latest_frame(&self) -> Option<VideoFrame>;

    /// A failure that ended an open stream. Reported once.
    fn take_error(&mut self) -> Option<CaptureError> {
        None
    }
}

impl FrameSource for Box<dyn FrameSource> {
    fn open(&mut self) -> Result<(), CaptureError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        (**self).latest_frame()
    }

    fn take_error(&mut self) -> Option<CaptureError> {
        (**self).take_error()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Webcam feed. Frames are captured on a dedicated thread and mirrored
/// horizontally so the preview behaves like a mirror.
pub struct CameraFeed {
    index: u32,
    format: CaptureFormat,
    frames: Arc<watch::Sender<Option<VideoFrame>>>,
    latest: watch::Receiver<Option<VideoFrame>>,
    failure: Arc<Mutex<Option<CaptureError>>>,
    worker: Option<CaptureWorker>,
    /// Capture thread of an open that timed out; it may still hold the device.
    abandoned: Option<CaptureWorker>,
}

impl CameraFeed {
    pub fn new(index: u32, format: CaptureFormat) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            index,
            format,
            frames: Arc::new(tx),
            latest: rx,
            failure: Arc::new(Mutex::new(None)),
            worker: None,
            abandoned: None,
        }
    }

    pub fn preview(&self) -> FramePreview {
        self.latest.clone()
    }

    fn reap_abandoned(&mut self) -> Result<(), CaptureError> {
        match self.abandoned.take() {
            Some(worker) if !worker.handle.is_finished() => {
                self.abandoned = Some(worker);
                Err(CaptureError::DeviceUnavailable(
                    "previous camera session is still shutting down".to_string(),
                ))
            }
            Some(worker) => {
                if worker.handle.join().is_err() {
                    warn!("Abandoned camera capture thread panicked");
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl FrameSource for CameraFeed {
    fn open(&mut self) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.reap_abandoned()?;
        info!(index = self.index, "Opening camera");
        self.take_error();

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let frames = Arc::clone(&self.frames);
        let failure = Arc::clone(&self.failure);
        let thread_stop = Arc::clone(&stop);
        let (index, format) = (self.index, self.format);

        let handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || capture_loop(index, format, frames, failure, thread_stop, ready_tx))
            .map_err(|e| CaptureError::DeviceUnavailable(format!("capture thread: {}", e)))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                info!(index = self.index, "Camera stream open");
                self.worker = Some(CaptureWorker { stop, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                // The thread exits on its own once the device responds.
                stop.store(true, Ordering::Relaxed);
                self.abandoned = Some(CaptureWorker { stop, handle });
                Err(CaptureError::DeviceUnavailable(
                    "camera did not respond in time".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Relaxed);
            if worker.handle.join().is_err() {
                warn!("Camera capture thread panicked");
            }
            info!(index = self.index, "Camera closed");
        }
        self.frames.send_replace(None);
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        self.latest.borrow().clone()
    }

    fn take_error(&mut self) -> Option<CaptureError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify_open_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

/// Counts back-to-back capture failures of an open stream.
#[derive(Debug, Default)]
struct FailureStreak {
    count: u32,
}

impl FailureStreak {
    /// Returns the error to report once the streak reaches the limit.
    fn record(&mut self, message: String) -> Option<CaptureError> {
        self.count += 1;
        if self.count == 1 {
            warn!("Failed to capture frame: {}", message);
        } else {
            debug!(streak = self.count, "Failed to capture frame: {}", message);
        }
        (self.count >= MAX_CONSECUTIVE_FAILURES).then(|| classify_open_error(message))
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

fn capture_loop(
    index: u32,
    format: CaptureFormat,
    frames: Arc<watch::Sender<Option<VideoFrame>>>,
    failure: Arc<Mutex<Option<CaptureError>>>,
    stop: Arc<AtomicBool>,
    ready: std_mpsc::Sender<Result<(), CaptureError>>,
) {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Exact(CameraFormat::new(
        Resolution::new(format.width, format.height),
        FrameFormat::MJPEG,
        format.fps,
    )));

    let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(classify_open_error(e.to_string())));
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        let _ = ready.send(Err(classify_open_error(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    let started = Instant::now();
    let mut streak = FailureStreak::default();
    while !stop.load(Ordering::Relaxed) {
        let buffer = match camera.frame() {
            Ok(buffer) => {
                streak.reset();
                buffer
            }
            Err(e) => {
                if let Some(lost) = streak.record(e.to_string()) {
                    error!("✗ Camera stream lost: {}", lost);
                    if let Ok(mut slot) = failure.lock() {
                        *slot = Some(lost);
                    }
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        match buffer.decode_image::<RgbFormat>() {
            Ok(decoded) => {
                let mirrored = image::imageops::flip_horizontal(&decoded);
                frames.send_replace(Some(VideoFrame::new(mirrored, started.elapsed())));
            }
            Err(e) => debug!("Failed to decode frame: {}", e),
        }
    }

    if let Err(e) = camera.stop_stream() {
        warn!("Failed to stop camera stream: {}", e);
    }
}

/// Camera-less feed for headless runs: a flat frame whose timestamp
/// advances at a fixed frame rate.
pub struct SyntheticFeed {
    format: CaptureFormat,
    image: Arc<RgbImage>,
    opened_at: Option<Instant>,
    preview: watch::Sender<Option<VideoFrame>>,
}

impl SyntheticFeed {
    pub fn new(format: CaptureFormat) -> Self {
        let image = RgbImage::from_pixel(format.width, format.height, Rgb([48, 48, 56]));
        let (preview, _) = watch::channel(None);
        Self {
            format,
            image: Arc::new(image),
            opened_at: None,
            preview,
        }
    }

    pub fn preview(&self) -> FramePreview {
        self.preview.subscribe()
    }
}

impl FrameSource for SyntheticFeed {
    fn open(&mut self) -> Result<(), CaptureError> {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        Ok(())
    }

    fn close(&mut self) {
        self.opened_at = None;
        self.preview.send_replace(None);
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        let opened_at = self.opened_at?;
        let fps = self.format.fps.max(1) as f64;
        let frame_index = (opened_at.elapsed().as_secs_f64() * fps).floor();
        let frame = VideoFrame {
            image: Arc::clone(&self.image),
            timestamp: Duration::from_secs_f64(frame_index / fps),
            width: self.format.width,
            height: self.format.height,
        };
        self.preview.send_replace(Some(frame.clone()));
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_feed_has_no_frames_until_opened() {
        let mut feed = SyntheticFeed::new(CaptureFormat::default());
        assert!(feed.latest_frame().is_none());
        feed.open().unwrap();
        let frame = feed.latest_frame().unwrap();
        assert_eq!((frame.width, frame.height), (640, 480));
        feed.close();
        assert!(feed.latest_frame().is_none());
    }

    #[test]
    fn synthetic_feed_timestamps_advance_in_frame_steps() {
        let mut feed = SyntheticFeed::new(CaptureFormat {
            width: 8,
            height: 8,
            fps: 20,
        });
        feed.open().unwrap();
        let first = feed.latest_frame().unwrap().timestamp;
        std::thread::sleep(Duration::from_millis(120));
        let later = feed.latest_frame().unwrap().timestamp;
        assert!(later > first);
        assert!(feed.latest_frame().unwrap().timestamp >= later);
    }

    #[test]
    fn synthetic_feed_publishes_preview() {
        let mut feed = SyntheticFeed::new(CaptureFormat::default());
        let preview = feed.preview();
        feed.open().unwrap();
        let frame = feed.latest_frame().unwrap();
        assert_eq!(preview.borrow().as_ref().map(|f| f.timestamp), Some(frame.timestamp));
    }

    #[test]
    fn capture_failures_are_reported_after_a_streak() {
        let mut streak = FailureStreak::default();
        for _ in 1..MAX_CONSECUTIVE_FAILURES {
            assert!(streak.record("device busy".to_string()).is_none());
        }
        streak.reset();
        for _ in 1..MAX_CONSECUTIVE_FAILURES {
            assert!(streak.record("device busy".to_string()).is_none());
        }
        assert!(matches!(
            streak.record("permission denied".to_string()),
            Some(CaptureError::PermissionDenied(_))
        ));
    }

    #[test]
    fn stream_failure_is_taken_once() {
        let mut feed = CameraFeed::new(0, CaptureFormat::default());
        assert!(feed.take_error().is_none());
        *feed.failure.lock().unwrap() = Some(CaptureError::DeviceUnavailable("unplugged".to_string()));
        assert!(matches!(feed.take_error(), Some(CaptureError::DeviceUnavailable(_))));
        assert!(feed.take_error().is_none());
    }

    #[test]
    fn reopen_waits_for_an_abandoned_capture_thread() {
        let mut feed = CameraFeed::new(0, CaptureFormat::default());
        let handle = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(200)));
        feed.abandoned = Some(CaptureWorker {
            stop: Arc::new(AtomicBool::new(true)),
            handle,
        });

        assert!(matches!(feed.open(), Err(CaptureError::DeviceUnavailable(_))));
        assert!(feed.abandoned.is_some());

        std::thread::sleep(Duration::from_millis(400));
        assert!(feed.reap_abandoned().is_ok());
        assert!(feed.abandoned.is_none());
    }

    #[test]
    fn permission_errors_are_classified() {
        assert!(matches!(
            classify_open_error("Permission denied by user".to_string()),
            CaptureError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_open_error("No device at index 3".to_string()),
            CaptureError::DeviceUnavailable(_)
        ));
    }
}
