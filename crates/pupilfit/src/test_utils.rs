//! Shared synthetic-image helpers for unit tests.

use image::{GrayImage, Luma};

/// Render a filled rotated ellipse (`a`, `b` are semi-axes) of intensity
/// `fg` on a `bg` background.
pub(crate) fn draw_filled_ellipse(
    w: u32,
    h: u32,
    cx: f32,
    cy: f32,
    a: f32,
    b: f32,
    angle: f32,
    fg: u8,
    bg: u8,
) -> GrayImage {
    let mut img = GrayImage::from_pixel(w, h, Luma([bg]));
    let (sin_t, cos_t) = angle.sin_cos();
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let u = (cos_t * dx + sin_t * dy) / a;
            let v = (-sin_t * dx + cos_t * dy) / b;
            if u * u + v * v <= 1.0 {
                img.put_pixel(x, y, Luma([fg]));
            }
        }
    }
    img
}

/// Stamp a small bright disk (e.g. a corneal reflection) onto an image.
pub(crate) fn stamp_bright_disk(img: &mut GrayImage, cx: f32, cy: f32, r: f32, value: u8) {
    let (w, h) = img.dimensions();
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy <= r * r {
                img.put_pixel(x, y, Luma([value]));
            }
        }
    }
}
