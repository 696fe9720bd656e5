//! Still image backend: a JPEG/PNG/BMP file served as a constant stream

use std::path::Path;

use super::convert::rgb24_to_i420;
use super::format::Resolution;
use super::frame::VideoFrame;
use super::source::{CaptureBackend, VideoInfo};
use crate::error::{AppError, Result};

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

pub struct StillImageCapture {
    frame: Option<VideoFrame>,
    sequence: u64,
}

impl StillImageCapture {
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .map_err(|e| AppError::source_unavailable(path.display().to_string(), e))?
            .to_rgb8();
        let resolution = Resolution::new(image.width(), image.height());
        let frame = rgb24_to_i420(image.as_raw(), resolution, 0)
            .map_err(|e| AppError::source_unavailable(path.display().to_string(), e))?;
        Ok(Self {
            frame: Some(frame),
            sequence: 0,
        })
    }
}

impl CaptureBackend for StillImageCapture {
    fn read(&mut self) -> Result<Option<VideoFrame>> {
        let Some(frame) = &self.frame else {
            return Ok(None);
        };
        self.sequence += 1;
        let mut frame = frame.clone();
        frame.sequence = self.sequence;
        frame.capture_ts = std::time::Instant::now();
        Ok(Some(frame))
    }

    fn release(&mut self) {
        self.frame = None;
    }

    fn info(&self) -> Option<VideoInfo> {
        self.frame.as_ref().map(|f| VideoInfo {
            width: f.width(),
            height: f.height(),
            fps: 0.0,
            total_frames: Some(1),
        })
    }
}
