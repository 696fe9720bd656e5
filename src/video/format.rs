//! Pixel format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Pixel formats produced by capture backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// MJPEG compressed format (common on USB cameras)
    Mjpeg,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// I420 / YUV420 planar format (encoder input)
    Yuv420,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Mjpeg => fourcc::FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => fourcc::FourCC::new(b"YUYV"),
            PixelFormat::Yuv420 => fourcc::FourCC::new(b"YU12"),
            PixelFormat::Rgb24 => fourcc::FourCC::new(b"RGB3"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Expected frame size for a given resolution, None for compressed formats
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Yuv420 => Some(pixels * 3 / 2),
            PixelFormat::Rgb24 => Some(pixels * 3),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Rgb24 => "RGB24",
        };
        f.write_str(name)
    }
}

/// Frame resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Largest resolution with even dimensions that fits in this one
    pub fn even(&self) -> Self {
        Self {
            width: self.width & !1,
            height: self.height & !1,
        }
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_roundtrip() {
        for format in [
            PixelFormat::Mjpeg,
            PixelFormat::Yuyv,
            PixelFormat::Yuv420,
            PixelFormat::Rgb24,
        ] {
            assert_eq!(PixelFormat::from_fourcc(format.to_fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(fourcc::FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(
            PixelFormat::Yuv420.frame_size(Resolution::VGA),
            Some(640 * 480 * 3 / 2)
        );
        assert_eq!(PixelFormat::Mjpeg.frame_size(Resolution::VGA), None);
        assert_eq!(Resolution::new(641, 479).even(), Resolution::new(640, 478));
    }
}
