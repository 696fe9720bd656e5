//! One-shot camera snapshot and stream probe
//!
//! Both operations open their own capture handle and close it before
//! returning. They block, so callers on the runtime use `spawn_blocking`.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::convert::{i420_to_rgb24, to_i420};
use super::format::PixelFormat;
use super::frame::VideoFrame;
use super::source::{SourceFrame, VideoInfo, VideoSource};
use crate::camera::Camera;
use crate::error::{AppError, Result};

/// Reads attempted before giving up on a live frame
const SNAPSHOT_ATTEMPTS: usize = 5;
const JPEG_QUALITY: u8 = 80;

/// Encode a frame as JPEG
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Bytes> {
    if frame.format == PixelFormat::Mjpeg {
        return Ok(frame.data_bytes());
    }
    let i420 = to_i420(frame)?;
    let rgb = i420_to_rgb24(&i420)?;

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&rgb, i420.width(), i420.height(), ExtendedColorType::Rgb8)
        .map_err(|e| AppError::VideoError(format!("JPEG encode failed: {}", e)))?;
    Ok(Bytes::from(out))
}

/// Grab one live frame from the camera as JPEG
pub fn capture_snapshot(source: &VideoSource, camera: &Camera) -> Result<Bytes> {
    let mut handle = source.open(camera)?;
    let mut frame = None;
    for _ in 0..SNAPSHOT_ATTEMPTS {
        if let SourceFrame::Live(f) = handle.get_frame() {
            frame = Some(f);
            break;
        }
    }
    handle.close();

    let frame = frame.ok_or_else(|| {
        AppError::source_unavailable(&camera.id, "camera produced no frame")
    })?;
    encode_jpeg(&frame, JPEG_QUALITY)
}

/// Stream properties of a camera
///
/// Backends that cannot report properties up front are probed by reading a
/// single frame.
pub fn probe_video_info(source: &VideoSource, camera: &Camera) -> Result<VideoInfo> {
    let mut handle = source.open(camera)?;
    let info = match handle.info() {
        Some(info) if info.width > 0 => Some(info),
        _ => handle.get_frame().into_frame().map(|f| VideoInfo {
            width: f.width(),
            height: f.height(),
            ..Default::default()
        }),
    };
    handle.close();
    info.ok_or_else(|| AppError::source_unavailable(&camera.id, "camera produced no frame"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraKind, CameraPath};
    use crate::video::source::testing::{source, FakeOpener, Step};
    use std::sync::Arc;

    fn camera() -> Camera {
        Camera::new("c", CameraKind::Rtsp, CameraPath::Text("rtsp://x/y".into()))
    }

    #[test]
    fn test_snapshot_is_jpeg_and_closes_source() {
        let opener = Arc::new(FakeOpener::new(vec![Step::Fail, Step::Frame]));
        let counters = opener.counters.clone();
        let jpeg = capture_snapshot(&source(opener), &camera()).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(counters.releases(), 1);
    }

    #[test]
    fn test_snapshot_without_frames_fails() {
        let opener = Arc::new(FakeOpener::new(vec![Step::Fail; SNAPSHOT_ATTEMPTS]));
        assert!(matches!(
            capture_snapshot(&source(opener), &camera()),
            Err(AppError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_probe_reads_frame_size() {
        let opener = Arc::new(FakeOpener::new(vec![Step::Frame]));
        let info = probe_video_info(&source(opener), &camera()).unwrap();
        assert_eq!((info.width, info.height), (16, 16));
    }

    #[test]
    fn test_mjpeg_passthrough() {
        let frame = VideoFrame::from_vec(
            vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9],
            crate::video::format::Resolution::new(2, 2),
            PixelFormat::Mjpeg,
            0,
        );
        assert_eq!(encode_jpeg(&frame, 80).unwrap().len(), 6);
    }
}
