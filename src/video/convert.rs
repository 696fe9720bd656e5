//! Pixel format conversion to and from I420
//!
//! Every capture backend hands frames to the track in whatever format the
//! device produces; the encoder only accepts I420 with even dimensions.

use image::ImageFormat;

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::VideoFrame;

/// I420 buffer with separate Y, U, V planes in one allocation
pub struct Yuv420pBuffer {
    data: Vec<u8>,
    resolution: Resolution,
    u_offset: usize,
    v_offset: usize,
}

impl Yuv420pBuffer {
    /// Create a buffer for the given (even) resolution, filled with black
    pub fn new(resolution: Resolution) -> Self {
        let y_size = resolution.pixels() as usize;
        let uv_size = y_size / 4;
        let mut data = vec![128u8; y_size + uv_size * 2];
        data[..y_size].fill(16);
        Self {
            data,
            resolution,
            u_offset: y_size,
            v_offset: y_size + uv_size,
        }
    }

    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y, uv) = self.data.split_at_mut(self.u_offset);
        let (u, v) = uv.split_at_mut(self.v_offset - self.u_offset);
        (y, u, v)
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.u_offset]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.u_offset..self.v_offset]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.v_offset..]
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn into_frame(self, sequence: u64) -> VideoFrame {
        VideoFrame::i420(self.data, self.resolution, sequence)
    }
}

fn check_len(format: PixelFormat, data: &[u8], resolution: Resolution) -> Result<()> {
    match format.frame_size(resolution) {
        Some(expected) if data.len() < expected => Err(AppError::VideoError(format!(
            "{} frame too small: {} < {} bytes ({})",
            format,
            data.len(),
            expected,
            resolution
        ))),
        _ => Ok(()),
    }
}

fn check_dimensions(resolution: Resolution) -> Result<Resolution> {
    let even = resolution.even();
    if even.width == 0 || even.height == 0 {
        return Err(AppError::VideoError(format!(
            "frame too small to encode: {}",
            resolution
        )));
    }
    Ok(even)
}

/// Convert packed RGB24 to I420 (BT.601), cropping odd edges
pub fn rgb24_to_i420(rgb: &[u8], resolution: Resolution, sequence: u64) -> Result<VideoFrame> {
    check_len(PixelFormat::Rgb24, rgb, resolution)?;
    let out = check_dimensions(resolution)?;
    let src_w = resolution.width as usize;
    let w = out.width as usize;
    let h = out.height as usize;

    let mut buffer = Yuv420pBuffer::new(out);
    let (y_plane, u_plane, v_plane) = buffer.planes_mut();

    for y in 0..h {
        for x in 0..w {
            let idx = (y * src_w + x) * 3;
            let r = rgb[idx] as i32;
            let g = rgb[idx + 1] as i32;
            let b = rgb[idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    Ok(buffer.into_frame(sequence))
}

/// Convert YUYV 4:2:2 to I420, averaging chroma of row pairs
pub fn yuyv_to_i420(yuyv: &[u8], resolution: Resolution, sequence: u64) -> Result<VideoFrame> {
    check_len(PixelFormat::Yuyv, yuyv, resolution)?;
    let out = check_dimensions(resolution)?;
    let stride = resolution.width as usize * 2;
    let w = out.width as usize;
    let h = out.height as usize;

    let mut buffer = Yuv420pBuffer::new(out);
    let (y_plane, u_plane, v_plane) = buffer.planes_mut();

    for y in 0..h {
        let row = &yuyv[y * stride..];
        for x in 0..w {
            y_plane[y * w + x] = row[x * 2];
        }
    }

    for cy in 0..h / 2 {
        let top = &yuyv[(cy * 2) * stride..];
        let bottom = &yuyv[(cy * 2 + 1) * stride..];
        for cx in 0..w / 2 {
            let base = cx * 4;
            let u = (top[base + 1] as u16 + bottom[base + 1] as u16 + 1) / 2;
            let v = (top[base + 3] as u16 + bottom[base + 3] as u16 + 1) / 2;
            u_plane[cy * (w / 2) + cx] = u as u8;
            v_plane[cy * (w / 2) + cx] = v as u8;
        }
    }

    Ok(buffer.into_frame(sequence))
}

/// Decode a JPEG/MJPEG payload to I420
pub fn mjpeg_to_i420(jpeg: &[u8], sequence: u64) -> Result<VideoFrame> {
    let image = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map_err(|e| AppError::VideoError(format!("MJPEG decode failed: {}", e)))?
        .to_rgb8();
    let resolution = Resolution::new(image.width(), image.height());
    rgb24_to_i420(image.as_raw(), resolution, sequence)
}

/// Bring any supported frame to I420 with even dimensions
pub fn to_i420(frame: &VideoFrame) -> Result<VideoFrame> {
    match frame.format {
        PixelFormat::Yuv420 if frame.resolution == frame.resolution.even() => {
            check_len(PixelFormat::Yuv420, frame.data(), frame.resolution)?;
            Ok(frame.clone())
        }
        PixelFormat::Yuv420 => {
            let rgb = i420_to_rgb24(frame)?;
            rgb24_to_i420(&rgb, frame.resolution, frame.sequence)
        }
        PixelFormat::Yuyv => yuyv_to_i420(frame.data(), frame.resolution, frame.sequence),
        PixelFormat::Rgb24 => rgb24_to_i420(frame.data(), frame.resolution, frame.sequence),
        PixelFormat::Mjpeg => mjpeg_to_i420(frame.data(), frame.sequence),
    }
}

/// Convert an I420 frame to packed RGB24 (BT.601), used for snapshots
pub fn i420_to_rgb24(frame: &VideoFrame) -> Result<Vec<u8>> {
    if frame.format != PixelFormat::Yuv420 {
        return Err(AppError::VideoError(format!(
            "expected YUV420 frame, got {}",
            frame.format
        )));
    }
    check_len(PixelFormat::Yuv420, frame.data(), frame.resolution)?;

    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    let data = frame.data();
    let y_plane = &data[..w * h];
    let u_plane = &data[w * h..w * h + cw * ch];
    let v_plane = &data[w * h + cw * ch..];

    let mut rgb = vec![0u8; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            let c = y_plane[y * w + x] as i32 - 16;
            let d = u_plane.get((y / 2) * cw + x / 2).copied().unwrap_or(128) as i32 - 128;
            let e = v_plane.get((y / 2) * cw + x / 2).copied().unwrap_or(128) as i32 - 128;

            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;

            let idx = (y * w + x) * 3;
            rgb[idx] = r.clamp(0, 255) as u8;
            rgb[idx + 1] = g.clamp(0, 255) as u8;
            rgb[idx + 2] = b.clamp(0, 255) as u8;
        }
    }
    Ok(rgb)
}
