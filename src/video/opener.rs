//! Backend selection for capture locations

use std::path::Path;
use tracing::debug;

use super::source::{CaptureBackend, CaptureOpener, SourceLocation};
use super::still_capture::{is_still_image, StillImageCapture};
use super::v4l_capture::{V4l2Capture, V4l2Config};
use crate::error::{AppError, Result};

/// Which backend serves a location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    V4l2,
    StillImage,
    Ffmpeg,
}

/// Pick the backend for a location
///
/// Device indexes and `/dev/video*` nodes go to V4L2, local still images to
/// the image decoder, everything else (video files, HTTP, RTSP) to FFmpeg.
pub fn backend_for(location: &SourceLocation) -> BackendKind {
    match location {
        SourceLocation::Device(_) => BackendKind::V4l2,
        SourceLocation::Uri(uri) if uri.starts_with("/dev/video") => BackendKind::V4l2,
        SourceLocation::Uri(uri) if !uri.contains("://") && is_still_image(Path::new(uri)) => {
            BackendKind::StillImage
        }
        SourceLocation::Uri(_) => BackendKind::Ffmpeg,
    }
}

/// Opener for real devices, files and streams
#[derive(Debug, Default, Clone)]
pub struct SystemCaptureOpener {
    /// Capture mode requested from V4L2 devices
    pub v4l2_fps: Option<u32>,
}

impl SystemCaptureOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureOpener for SystemCaptureOpener {
    fn open(&self, location: &SourceLocation) -> Result<Box<dyn CaptureBackend>> {
        let kind = backend_for(location);
        debug!("Opening {} with {:?} backend", location, kind);

        match (kind, location) {
            (BackendKind::V4l2, _) => {
                let mut config = match location {
                    SourceLocation::Device(index) => V4l2Config::for_index(*index),
                    SourceLocation::Uri(uri) => V4l2Config::for_device(uri),
                };
                if let Some(fps) = self.v4l2_fps {
                    config.fps = fps;
                }
                Ok(Box::new(V4l2Capture::open(&config)?))
            }
            (BackendKind::StillImage, SourceLocation::Uri(uri)) => {
                Ok(Box::new(StillImageCapture::open(Path::new(uri))?))
            }
            (BackendKind::Ffmpeg, SourceLocation::Uri(uri)) => open_ffmpeg(uri),
            _ => Err(AppError::source_unavailable(
                location.to_string(),
                "no capture backend for location",
            )),
        }
    }
}

#[cfg(feature = "ffmpeg")]
fn open_ffmpeg(uri: &str) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(super::ffmpeg_capture::FfmpegCapture::open(uri)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_ffmpeg(uri: &str) -> Result<Box<dyn CaptureBackend>> {
    let local = !uri.contains("://");
    if local && !Path::new(uri).exists() {
        return Err(AppError::source_unavailable(uri, "no such file"));
    }
    Err(AppError::source_unavailable(
        uri,
        "video decoding requires the 'ffmpeg' feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection() {
        assert_eq!(backend_for(&SourceLocation::Device(0)), BackendKind::V4l2);
        assert_eq!(
            backend_for(&SourceLocation::Uri("/dev/video2".into())),
            BackendKind::V4l2
        );
        assert_eq!(
            backend_for(&SourceLocation::Uri("/srv/media/door.jpg".into())),
            BackendKind::StillImage
        );
        assert_eq!(
            backend_for(&SourceLocation::Uri("rtsp://cam/live".into())),
            BackendKind::Ffmpeg
        );
        assert_eq!(
            backend_for(&SourceLocation::Uri("http://cdn/door.jpg".into())),
            BackendKind::Ffmpeg
        );
        assert_eq!(
            backend_for(&SourceLocation::Uri("/srv/media/clip.mp4".into())),
            BackendKind::Ffmpeg
        );
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let opener = SystemCaptureOpener::new();
        for uri in ["/nonexistent/clip.mp4", "/nonexistent/still.png"] {
            let result = opener.open(&SourceLocation::Uri(uri.into()));
            assert!(matches!(result, Err(AppError::SourceUnavailable { .. })));
        }
    }
}
