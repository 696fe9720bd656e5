//! Synthetic frame shown while a source has not produced any picture yet

use std::sync::OnceLock;

use super::format::Resolution;
use super::frame::VideoFrame;

pub const PLACEHOLDER_RESOLUTION: Resolution = Resolution::VGA;

const LABEL: &str = "WAITING...";
const SCALE: usize = 6;
const GLYPH_W: usize = 5;
const GLYPH_H: usize = 7;
const LUMA_BG: u8 = 16;
const LUMA_FG: u8 = 235;
const LUMA_BAR: u8 = 128;
const BAR_W: usize = 80;
const BAR_H: usize = 8;

/// 5x7 glyph rows, MSB is the leftmost pixel
fn glyph(c: char) -> [u8; GLYPH_H] {
    match c {
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x1F],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0E],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        _ => [0; GLYPH_H],
    }
}

fn base_frame() -> &'static [u8] {
    static BASE: OnceLock<Vec<u8>> = OnceLock::new();
    BASE.get_or_init(|| {
        let w = PLACEHOLDER_RESOLUTION.width as usize;
        let h = PLACEHOLDER_RESOLUTION.height as usize;
        let mut data = vec![128u8; w * h * 3 / 2];
        data[..w * h].fill(LUMA_BG);

        let advance = (GLYPH_W + 1) * SCALE;
        let text_w = LABEL.len() * advance - SCALE;
        let x0 = (w - text_w) / 2;
        let y0 = (h - GLYPH_H * SCALE) / 2;

        for (i, c) in LABEL.chars().enumerate() {
            let rows = glyph(c);
            for (gy, bits) in rows.iter().enumerate() {
                for gx in 0..GLYPH_W {
                    if bits & (0x10 >> gx) == 0 {
                        continue;
                    }
                    let px = x0 + i * advance + gx * SCALE;
                    let py = y0 + gy * SCALE;
                    for dy in 0..SCALE {
                        let row = (py + dy) * w;
                        data[row + px..row + px + SCALE].fill(LUMA_FG);
                    }
                }
            }
        }
        data
    })
}

/// Render the placeholder for the given frame number
///
/// The label is static; a bar below it advances every frame so a viewer can
/// tell the stream is alive.
pub fn placeholder_frame(sequence: u64) -> VideoFrame {
    let w = PLACEHOLDER_RESOLUTION.width as usize;
    let h = PLACEHOLDER_RESOLUTION.height as usize;
    let mut data = base_frame().to_vec();

    let travel = (w - BAR_W) as u64;
    let x = ((sequence * 8) % travel) as usize;
    let y = h / 2 + GLYPH_H * SCALE;
    for row in y..y + BAR_H {
        data[row * w + x..row * w + x + BAR_W].fill(LUMA_BAR);
    }

    VideoFrame::i420(data, PLACEHOLDER_RESOLUTION, sequence)
}
