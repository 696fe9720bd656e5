//! FFmpeg capture backend for files, HTTP URLs and RTSP streams
//!
//! Decoded pictures are scaled to I420 at their native size (rounded down to
//! even dimensions) so the encoder never has to touch libav types.

use ffmpeg_next as ffmpeg;
use tracing::{debug, info};

use super::format::Resolution;
use super::frame::VideoFrame;
use super::source::{CaptureBackend, VideoInfo};
use crate::error::{AppError, Result};

/// Socket read timeout for network inputs (microseconds)
const NETWORK_RW_TIMEOUT_US: &str = "5000000";

pub struct FfmpegCapture {
    uri: String,
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    resolution: Resolution,
    info: VideoInfo,
    sequence: u64,
    eof: bool,
}

// libav contexts are only touched by the thread currently owning the backend.
unsafe impl Send for FfmpegCapture {}

fn is_network(uri: &str) -> bool {
    uri.contains("://") && !uri.starts_with("file://")
}

impl FfmpegCapture {
    pub fn open(uri: &str) -> Result<Self> {
        let unavailable = |e: &dyn std::fmt::Display| AppError::source_unavailable(uri, e);

        ffmpeg::init().map_err(|e| unavailable(&e))?;

        let opened = if is_network(uri) {
            let mut options = ffmpeg::Dictionary::new();
            options.set("rw_timeout", NETWORK_RW_TIMEOUT_US);
            if uri.starts_with("rtsp://") {
                options.set("rtsp_transport", "tcp");
            }
            ffmpeg::format::input_with_dictionary(&uri, options)
        } else {
            let path = uri.strip_prefix("file://").unwrap_or(uri);
            if !std::path::Path::new(path).exists() {
                return Err(AppError::source_unavailable(uri, "no such file"));
            }
            ffmpeg::format::input(&path)
        };
        let input = opened.map_err(|e| unavailable(&e))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| AppError::source_unavailable(uri, "input has no video stream"))?;
        let stream_index = stream.index();

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };
        let total_frames = (stream.frames() > 0).then(|| stream.frames() as u64);

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| unavailable(&e))?;
        let decoder = context.decoder().video().map_err(|e| unavailable(&e))?;

        let resolution = Resolution::new(decoder.width(), decoder.height()).even();
        if resolution.width == 0 || resolution.height == 0 {
            return Err(AppError::source_unavailable(uri, "video stream has no dimensions"));
        }

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::YUV420P,
            resolution.width,
            resolution.height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| unavailable(&e))?;

        info!("FFmpeg capture opened: {} {} @ {:.2}fps", uri, resolution, fps);

        Ok(Self {
            uri: uri.to_string(),
            input: Some(input),
            stream_index,
            decoder,
            scaler,
            resolution,
            info: VideoInfo {
                width: resolution.width,
                height: resolution.height,
                fps,
                total_frames,
            },
            sequence: 0,
            eof: false,
        })
    }

    fn to_frame(&mut self, decoded: &ffmpeg::frame::Video) -> Result<VideoFrame> {
        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut yuv)
            .map_err(|e| AppError::VideoError(format!("scale failed: {}", e)))?;

        let w = self.resolution.width as usize;
        let h = self.resolution.height as usize;
        let mut data = Vec::with_capacity(w * h * 3 / 2);
        for (plane, (pw, ph)) in [(w, h), (w / 2, h / 2), (w / 2, h / 2)].into_iter().enumerate() {
            let stride = yuv.stride(plane);
            let src = yuv.data(plane);
            for row in 0..ph {
                let start = row * stride;
                let line = src.get(start..start + pw).ok_or_else(|| {
                    AppError::VideoError("decoded plane row out of bounds".to_string())
                })?;
                data.extend_from_slice(line);
            }
        }

        self.sequence += 1;
        Ok(VideoFrame::i420(data, self.resolution, self.sequence))
    }
}

impl CaptureBackend for FfmpegCapture {
    fn read(&mut self) -> Result<Option<VideoFrame>> {
        if self.eof {
            return Ok(None);
        }
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };

        let mut decoded = ffmpeg::frame::Video::empty();
        // Decoders may hold more than one picture per packet
        let mut got_frame = self.decoder.receive_frame(&mut decoded).is_ok();
        if !got_frame {
            for (stream, packet) in input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .map_err(|e| AppError::VideoError(format!("decode failed: {}", e)))?;
                if self.decoder.receive_frame(&mut decoded).is_ok() {
                    got_frame = true;
                    break;
                }
            }
        }

        if got_frame {
            return self.to_frame(&decoded).map(Some);
        }

        debug!("FFmpeg input ended: {}", self.uri);
        self.eof = true;
        Ok(None)
    }

    fn release(&mut self) {
        if self.input.take().is_some() {
            debug!("FFmpeg capture released: {}", self.uri);
        }
    }

    fn info(&self) -> Option<VideoInfo> {
        Some(self.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_detection() {
        assert!(is_network("rtsp://10.0.0.2/live"));
        assert!(is_network("https://cdn/x.m3u8"));
        assert!(!is_network("file:///tmp/a.mp4"));
        assert!(!is_network("/tmp/a.mp4"));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            FfmpegCapture::open("/nonexistent/clip.mp4"),
            Err(AppError::SourceUnavailable { .. })
        ));
    }
}
