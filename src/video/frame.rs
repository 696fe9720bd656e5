//! Video frame data structures

use bytes::Bytes;
use std::time::Instant;

use super::format::{PixelFormat, Resolution};

/// A raw video frame with metadata
///
/// Frame data is reference counted, so clones are cheap. Caching the last
/// good frame in a source and re-emitting it from a track never copies pixels.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Frame sequence number assigned by the producing backend
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl VideoFrame {
    pub fn new(data: Bytes, resolution: Resolution, format: PixelFormat, sequence: u64) -> Self {
        Self {
            data,
            resolution,
            format,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    pub fn from_vec(
        data: Vec<u8>,
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self::new(Bytes::from(data), resolution, format, sequence)
    }

    /// I420 frame
    pub fn i420(data: Vec<u8>, resolution: Resolution, sequence: u64) -> Self {
        Self::from_vec(data, resolution, PixelFormat::Yuv420, sequence)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Whether the payload size matches the declared format and resolution
    pub fn is_consistent(&self) -> bool {
        match self.format.frame_size(self.resolution) {
            Some(expected) => self.data.len() == expected,
            None => !self.data.is_empty(),
        }
    }

    /// Frame age since capture
    pub fn age(&self) -> std::time::Duration {
        self.capture_ts.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_data() {
        let frame = VideoFrame::i420(vec![16; 4 * 2 * 3 / 2], Resolution::new(4, 2), 7);
        let copy = frame.clone();
        assert_eq!(copy.data().as_ptr(), frame.data().as_ptr());
        assert_eq!(copy.sequence, 7);
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_inconsistent_size() {
        let frame = VideoFrame::i420(vec![0; 10], Resolution::new(4, 4), 0);
        assert!(!frame.is_consistent());
    }
}
