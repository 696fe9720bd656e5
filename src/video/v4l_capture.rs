//! V4L2 capture backend for local USB cameras
//!
//! Uses memory-mapped buffers. The device and its stream are kept together in
//! one self-referencing struct because the stream borrows the device.

use ouroboros::self_referencing;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;

use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use super::source::{CaptureBackend, VideoInfo};
use crate::error::{AppError, Result};

const BUFFER_COUNT: u32 = 4;
/// Longest wait for a dequeued buffer before the read counts as empty
const READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Frames smaller than this are treated as empty reads
const MIN_FRAME_SIZE: usize = 128;

/// Requested capture mode
#[derive(Debug, Clone)]
pub struct V4l2Config {
    pub device: PathBuf,
    pub resolution: Resolution,
    pub fps: u32,
}

impl V4l2Config {
    pub fn for_device(device: impl AsRef<Path>) -> Self {
        Self {
            device: device.as_ref().to_path_buf(),
            resolution: Resolution::HD720,
            fps: 30,
        }
    }

    /// Device node for a numeric index
    pub fn for_index(index: u32) -> Self {
        Self::for_device(format!("/dev/video{}", index))
    }
}

#[self_referencing]
struct DeviceStream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: MmapStream<'this>,
}

/// Open V4L2 device delivering YUYV or MJPEG frames
pub struct V4l2Capture {
    device_path: PathBuf,
    state: Option<DeviceStream>,
    resolution: Resolution,
    format: PixelFormat,
    fps: u32,
    sequence: u64,
}

impl V4l2Capture {
    pub fn open(config: &V4l2Config) -> Result<Self> {
        let path = &config.device;
        if !path.exists() {
            return Err(AppError::source_unavailable(
                path.display().to_string(),
                "device node does not exist",
            ));
        }

        let mut device = v4l::Device::with_path(path)
            .map_err(|e| AppError::source_unavailable(path.display().to_string(), e))?;

        let (format, resolution) = Self::negotiate_format(&mut device, config)?;

        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            if let Err(e) = device.set_params(&params) {
                warn!("Failed to set fps on {}: {}", path.display(), e);
            }
        }

        let state = DeviceStreamTryBuilder {
            device,
            stream_builder: |device| {
                MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT).map(
                    |mut stream| {
                        stream.set_timeout(READ_TIMEOUT);
                        stream
                    },
                )
            },
        }
        .try_build()
        .map_err(|e| AppError::source_unavailable(path.display().to_string(), e))?;

        info!(
            "V4L2 capture opened: {} {} @ {}fps",
            path.display(),
            resolution,
            config.fps
        );

        Ok(Self {
            device_path: path.clone(),
            state: Some(state),
            resolution,
            format,
            fps: config.fps,
            sequence: 0,
        })
    }

    /// Prefer YUYV, fall back to MJPEG; accept whatever size the driver picks
    fn negotiate_format(
        device: &mut v4l::Device,
        config: &V4l2Config,
    ) -> Result<(PixelFormat, Resolution)> {
        let path = config.device.display().to_string();
        let mut last = None;
        for wanted in [PixelFormat::Yuyv, PixelFormat::Mjpeg] {
            let mut fmt = device
                .format()
                .map_err(|e| AppError::source_unavailable(&path, e))?;
            fmt.width = config.resolution.width;
            fmt.height = config.resolution.height;
            fmt.fourcc = wanted.to_fourcc();

            match device.set_format(&fmt) {
                Ok(actual) => {
                    if let Some(format) = PixelFormat::from_fourcc(actual.fourcc) {
                        if matches!(format, PixelFormat::Yuyv | PixelFormat::Mjpeg) {
                            return Ok((format, Resolution::new(actual.width, actual.height)));
                        }
                    }
                    debug!("{} answered {} with {}", path, wanted, actual.fourcc);
                    last = Some(actual.fourcc.to_string());
                }
                Err(e) => {
                    debug!("{} rejected {}: {}", path, wanted, e);
                    last = Some(e.to_string());
                }
            }
        }
        Err(AppError::source_unavailable(
            path,
            format!(
                "no supported pixel format (YUYV/MJPEG): {}",
                last.unwrap_or_default()
            ),
        ))
    }
}

impl CaptureBackend for V4l2Capture {
    fn read(&mut self) -> Result<Option<VideoFrame>> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| AppError::VideoError("capture released".to_string()))?;

        let data = state.with_mut(|fields| {
            fields.stream.next().map(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };
                buf[..used].to_vec()
            })
        });
        let data = match read_outcome(&self.device_path, data)? {
            Some(data) => data,
            None => return Ok(None),
        };

        if data.len() < MIN_FRAME_SIZE {
            return Ok(None);
        }
        if self.format == PixelFormat::Mjpeg && !is_valid_jpeg(&data) {
            return Ok(None);
        }

        self.sequence += 1;
        Ok(Some(VideoFrame::from_vec(
            data,
            self.resolution,
            self.format,
            self.sequence,
        )))
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            debug!("V4L2 capture released: {}", self.device_path.display());
        }
    }

    fn info(&self) -> Option<VideoInfo> {
        Some(VideoInfo {
            width: self.resolution.width,
            height: self.resolution.height,
            fps: self.fps as f64,
            total_frames: None,
        })
    }
}

/// A dequeue timeout means no signal yet, so the caller keeps its cached frame
fn read_outcome(device: &Path, result: io::Result<Vec<u8>>) -> Result<Option<Vec<u8>>> {
    match result {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            debug!("Capture timeout on {} - no signal?", device.display());
            Ok(None)
        }
        Err(e) => Err(AppError::VideoError(format!(
            "capture {} failed: {}",
            device.display(),
            e
        ))),
    }
}

/// JPEG payload sanity check (SOI marker, plausible end marker)
fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < MIN_FRAME_SIZE || data[0] != 0xFF || data[1] != 0xD8 {
        return false;
    }
    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
    // Some capture cards pad after EOI
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_jpeg() {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; 200]);
        data.extend([0xFF, 0xD9]);
        assert!(is_valid_jpeg(&data));

        assert!(!is_valid_jpeg(&[0xFF, 0xD8, 0xFF, 0xD9]));

        let mut bad = vec![0x00, 0x00];
        bad.extend(vec![0u8; 200]);
        assert!(!is_valid_jpeg(&bad));
    }

    #[test]
    fn test_read_timeout_is_empty_read() {
        let device = Path::new("/dev/video0");
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF");
        assert!(matches!(read_outcome(device, Err(timed_out)), Ok(None)));

        let lost = io::Error::from_raw_os_error(19);
        assert!(matches!(
            read_outcome(device, Err(lost)),
            Err(AppError::VideoError(_))
        ));

        let frame = read_outcome(device, Ok(vec![1, 2, 3])).unwrap();
        assert_eq!(frame, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_missing_device() {
        let config = V4l2Config::for_device("/dev/video-does-not-exist");
        assert!(matches!(
            V4l2Capture::open(&config),
            Err(AppError::SourceUnavailable { .. })
        ));
        assert_eq!(V4l2Config::for_index(3).device, PathBuf::from("/dev/video3"));
    }
}
