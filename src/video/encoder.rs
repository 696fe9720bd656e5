//! H.264 software encoding with openh264

use bytes::Bytes;
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;
use tracing::{debug, info};

use super::convert::to_i420;
use super::format::Resolution;
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// One encoded access unit (Annex B)
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub keyframe: bool,
    pub resolution: Resolution,
}

/// Turns raw frames into H.264 access units
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame>;

    /// Make the next encoded frame an IDR
    fn request_keyframe(&mut self);
}

/// openh264-backed encoder
///
/// The encoder is rebuilt when the input resolution changes, which happens
/// when a session switches from the placeholder to live frames.
#[derive(Default)]
pub struct OpenH264Encoder {
    inner: Option<(Resolution, Encoder)>,
    frames: u64,
    keyframe_pending: bool,
}

impl OpenH264Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder_for(&mut self, resolution: Resolution) -> Result<&mut Encoder> {
        let rebuild = !matches!(&self.inner, Some((r, _)) if *r == resolution);
        if rebuild {
            let encoder = Encoder::new()
                .map_err(|e| AppError::VideoError(format!("Failed to create H264 encoder: {}", e)))?;
            if self.inner.is_some() {
                info!("H264 encoder reconfigured for {}", resolution);
            } else {
                debug!("H264 encoder created for {}", resolution);
            }
            self.inner = Some((resolution, encoder));
        }
        self.inner
            .as_mut()
            .map(|(_, encoder)| encoder)
            .ok_or_else(|| AppError::Internal("encoder missing".to_string()))
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame> {
        let frame = to_i420(frame)?;
        let resolution = frame.resolution;
        let force_idr = std::mem::take(&mut self.keyframe_pending);

        let encoder = self.encoder_for(resolution)?;
        if force_idr {
            encoder.force_intra_frame();
        }

        let yuv = YUVBuffer::from_vec(
            frame.data().to_vec(),
            resolution.width as usize,
            resolution.height as usize,
        );
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| AppError::VideoError(format!("H264 encode failed: {}", e)))?;

        let keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();

        self.frames += 1;
        if keyframe {
            debug!("Encoded keyframe #{} ({} bytes)", self.frames, data.len());
        }

        Ok(EncodedFrame {
            data: Bytes::from(data),
            keyframe,
            resolution,
        })
    }

    fn request_keyframe(&mut self) {
        self.keyframe_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::placeholder::placeholder_frame;

    #[test]
    fn test_first_frame_is_keyframe() {
        let mut encoder = OpenH264Encoder::new();
        let encoded = encoder.encode(&placeholder_frame(0)).unwrap();
        assert!(encoded.keyframe);
        assert!(!encoded.data.is_empty());
        // Annex B start code
        assert!(encoded.data.starts_with(&[0, 0, 0, 1]) || encoded.data.starts_with(&[0, 0, 1]));
    }

    #[test]
    fn test_resolution_change_rebuilds_encoder() {
        let mut encoder = OpenH264Encoder::new();
        encoder.encode(&placeholder_frame(0)).unwrap();

        let small = VideoFrame::i420(vec![16; 64 * 48 * 3 / 2], Resolution::new(64, 48), 1);
        let encoded = encoder.encode(&small).unwrap();
        assert_eq!(encoded.resolution, Resolution::new(64, 48));
        assert!(encoded.keyframe);
    }
}
