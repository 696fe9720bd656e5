//! Video source: resolves a camera to a capture location and reads frames
//!
//! A [`VideoSourceHandle`] exclusively owns one capture backend. Reads are
//! blocking and never reopen a closed handle; a failed read degrades to the
//! last good frame instead of surfacing an error to the track.

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::frame::VideoFrame;
use crate::camera::{Camera, CameraKind, CameraPath, UrlSigner};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Concrete location a capture backend opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// File path, URL or device node
    Uri(String),
    /// Local capture device index (`/dev/videoN`)
    Device(u32),
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Uri(uri) => f.write_str(uri),
            SourceLocation::Device(index) => write!(f, "device {}", index),
        }
    }
}

/// Stream properties reported by a backend
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Total frames when the input is finite and the container reports it
    pub total_frames: Option<u64>,
}

/// An open capture device or decoder
pub trait CaptureBackend: Send {
    /// Read the next frame, blocking. `Ok(None)` means no frame is available
    /// right now (end of input, empty read).
    fn read(&mut self) -> Result<Option<VideoFrame>>;

    /// Release the underlying device. Called once.
    fn release(&mut self);

    fn info(&self) -> Option<VideoInfo> {
        None
    }
}

/// Opens capture backends for a location
pub trait CaptureOpener: Send + Sync {
    fn open(&self, location: &SourceLocation) -> Result<Box<dyn CaptureBackend>>;
}

/// Result of a single read
#[derive(Debug, Clone)]
pub enum SourceFrame {
    /// Freshly read frame
    Live(VideoFrame),
    /// Read failed; last good frame
    Cached(VideoFrame),
    /// Nothing has ever been read
    Empty,
}

impl SourceFrame {
    pub fn into_frame(self) -> Option<VideoFrame> {
        match self {
            SourceFrame::Live(frame) | SourceFrame::Cached(frame) => Some(frame),
            SourceFrame::Empty => None,
        }
    }
}

/// Read counters for one handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SourceStats {
    pub frames_read: u64,
    pub read_failures: u64,
}

/// Factory turning cameras into open capture handles
#[derive(Clone)]
pub struct VideoSource {
    opener: Arc<dyn CaptureOpener>,
    signer: Arc<dyn UrlSigner>,
    sign_expires: Duration,
}

impl VideoSource {
    pub fn new(
        opener: Arc<dyn CaptureOpener>,
        signer: Arc<dyn UrlSigner>,
        sign_expires: Duration,
    ) -> Self {
        Self {
            opener,
            signer,
            sign_expires,
        }
    }

    /// Resolve the concrete location for a camera
    ///
    /// File cameras are addressed by storage key and get a signed location;
    /// every other kind is used as given.
    pub fn resolve(&self, camera: &Camera) -> Result<SourceLocation> {
        if camera.path.is_empty() {
            return Err(AppError::source_unavailable(&camera.id, "camera has no path"));
        }
        match (&camera.kind, &camera.path) {
            (CameraKind::File, CameraPath::Text(key)) => self
                .signer
                .sign(key, self.sign_expires)
                .map(SourceLocation::Uri)
                .map_err(|e| AppError::source_unavailable(key, format!("signing failed: {}", e))),
            (CameraKind::File, CameraPath::Index(i)) => Err(AppError::source_unavailable(
                &camera.id,
                format!("file camera has numeric path {}", i),
            )),
            (_, CameraPath::Index(i)) => Ok(SourceLocation::Device(*i)),
            (_, CameraPath::Text(path)) => Ok(SourceLocation::Uri(path.trim().to_string())),
        }
    }

    /// Open a capture handle for the camera
    pub fn open(&self, camera: &Camera) -> Result<VideoSourceHandle> {
        let location = self.resolve(camera)?;
        open_location(self.opener.as_ref(), &camera.id, location)
    }

    /// Open a capture handle, giving up at `deadline`
    ///
    /// The open runs on a helper thread. If the deadline passes first the
    /// call returns `NegotiationTimeout` and a handle that arrives later is
    /// closed on arrival.
    pub fn open_with_deadline(&self, camera: &Camera, deadline: Instant) -> Result<VideoSourceHandle> {
        let location = self.resolve(camera)?;
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(AppError::NegotiationTimeout(0));
        }

        let (tx, rx) = mpsc::sync_channel::<Result<VideoSourceHandle>>(1);
        let opener = self.opener.clone();
        let camera_id = camera.id.clone();
        std::thread::Builder::new()
            .name(format!("source-open-{}", camera.id))
            .spawn(move || {
                let result = open_location(opener.as_ref(), &camera_id, location);
                if let Err(mpsc::SendError(Ok(handle))) = tx.send(result) {
                    debug!(
                        "Source for {} opened after deadline, closing {}",
                        camera_id, handle.location
                    );
                    drop(handle);
                }
            })
            .map_err(|e| AppError::Internal(format!("failed to spawn source open thread: {}", e)))?;

        match rx.recv_timeout(budget) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(AppError::NegotiationTimeout(budget.as_millis() as u64))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(AppError::source_unavailable(
                &camera.id,
                "source open thread exited",
            )),
        }
    }
}

fn open_location(
    opener: &dyn CaptureOpener,
    camera_id: &str,
    location: SourceLocation,
) -> Result<VideoSourceHandle> {
    let backend = opener.open(&location).map_err(|e| match e {
        AppError::SourceUnavailable { .. } => e,
        other => AppError::source_unavailable(location.to_string(), other),
    })?;
    info!("Video source opened for camera {}: {}", camera_id, location);
    Ok(VideoSourceHandle::new(camera_id.to_string(), location, backend))
}

/// Exclusive owner of one open capture backend
pub struct VideoSourceHandle {
    camera_id: String,
    location: SourceLocation,
    backend: Option<Box<dyn CaptureBackend>>,
    last_frame: Option<VideoFrame>,
    stats: SourceStats,
    throttler: LogThrottler,
}

impl VideoSourceHandle {
    pub fn new(camera_id: String, location: SourceLocation, backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            camera_id,
            location,
            backend: Some(backend),
            last_frame: None,
            stats: SourceStats::default(),
            throttler: LogThrottler::default(),
        }
    }

    /// Read one frame, degrading to the last good frame on failure
    pub fn get_frame(&mut self) -> SourceFrame {
        let Some(backend) = self.backend.as_mut() else {
            return self.cached();
        };

        match backend.read() {
            Ok(Some(frame)) => {
                self.stats.frames_read += 1;
                self.throttler.clear("read");
                self.last_frame = Some(frame.clone());
                SourceFrame::Live(frame)
            }
            Ok(None) => {
                self.stats.read_failures += 1;
                self.cached()
            }
            Err(e) => {
                self.stats.read_failures += 1;
                warn_throttled!(
                    self.throttler,
                    "read",
                    "Frame read failed for camera {} ({}): {}",
                    self.camera_id,
                    self.location,
                    e
                );
                self.cached()
            }
        }
    }

    fn cached(&self) -> SourceFrame {
        match &self.last_frame {
            Some(frame) => SourceFrame::Cached(frame.clone()),
            None => SourceFrame::Empty,
        }
    }

    pub fn last_frame(&self) -> Option<&VideoFrame> {
        self.last_frame.as_ref()
    }

    pub fn info(&self) -> Option<VideoInfo> {
        self.backend.as_ref().and_then(|b| b.info())
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// Release the backend. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.release();
            info!(
                "Video source closed for camera {} ({} frames, {} failed reads)",
                self.camera_id, self.stats.frames_read, self.stats.read_failures
            );
        }
    }
}

impl Drop for VideoSourceHandle {
    fn drop(&mut self) {
        self.close();
    }
}
