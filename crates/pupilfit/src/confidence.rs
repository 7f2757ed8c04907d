//! Confidence metrics shared by all detection methods, plus the cheap
//! coarse pupil localizer used to pre-seed ROIs.

use image::GrayImage;

use crate::imgproc::{bilinear_sample, connected_components};
use crate::pupil::{Pupil, Roi};

const OUTLINE_SAMPLES: usize = 32;

/// Contrast across the pupil outline: boundary points are probed `bias`
/// pixels inside and outside along the local normal, and the mean absolute
/// intensity step (normalized to [0, 1]) is returned. Zero for pupils
/// without an outline or when too little of the boundary is measurable.
pub fn outline_contrast_confidence(frame: &GrayImage, pupil: &Pupil, bias: i32) -> f32 {
    if !pupil.has_outline() || pupil.cx < 0.0 || pupil.cy < 0.0 {
        return 0.0;
    }
    let bias = bias.max(1) as f32;
    let a = 0.5 * pupil.width;
    let b = 0.5 * pupil.height;
    let (sin_t, cos_t) = pupil.angle.sin_cos();

    let mut contrast_sum = 0.0f32;
    let mut evaluated = 0usize;
    for i in 0..OUTLINE_SAMPLES {
        let t = 2.0 * std::f32::consts::PI * (i as f32) / (OUTLINE_SAMPLES as f32);
        let (sin_p, cos_p) = t.sin_cos();
        let bx = pupil.cx + cos_t * a * cos_p - sin_t * b * sin_p;
        let by = pupil.cy + sin_t * a * cos_p + cos_t * b * sin_p;

        // Outward normal of the parametric ellipse point.
        let nx = cos_t * b * cos_p - sin_t * a * sin_p;
        let ny = sin_t * b * cos_p + cos_t * a * sin_p;
        let norm = (nx * nx + ny * ny).sqrt();
        if norm < 1e-6 {
            continue;
        }
        let (nx, ny) = (nx / norm, ny / norm);

        let inner = bilinear_sample(frame, bx - bias * nx, by - bias * ny);
        let outer = bilinear_sample(frame, bx + bias * nx, by + bias * ny);
        if let (Some(vi), Some(vo)) = (inner, outer) {
            contrast_sum += (vo - vi).abs() / 255.0;
            evaluated += 1;
        }
    }

    if evaluated < OUTLINE_SAMPLES / 2 {
        return 0.0;
    }
    (contrast_sum / evaluated as f32).clamp(0.0, 1.0)
}

/// Fraction of outline samples with a real edge pixel within `band` pixels.
/// Matching boundary points are appended to `edge_points`.
pub fn edge_ratio_confidence(
    edge: &[u8],
    width: usize,
    height: usize,
    pupil: &Pupil,
    edge_points: &mut Vec<[f32; 2]>,
    band: i32,
) -> f32 {
    if !pupil.has_outline() {
        return 0.0;
    }
    let samples = pupil.boundary_points(OUTLINE_SAMPLES * 2);
    let mut matched = 0usize;
    for [bx, by] in &samples {
        let (cx, cy) = (bx.round() as i32, by.round() as i32);
        let mut found = false;
        'probe: for dy in -band..=band {
            for dx in -band..=band {
                let (x, y) = (cx + dx, cy + dy);
                if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
                    continue;
                }
                if edge[y as usize * width + x as usize] != 0 {
                    found = true;
                    break 'probe;
                }
            }
        }
        if found {
            matched += 1;
            edge_points.push([*bx, *by]);
        }
    }
    matched as f32 / samples.len() as f32
}

/// Angular coverage of `points` around `center`: fraction of the eight
/// 45° sectors that contain at least one point.
pub fn angular_spread_confidence(points: &[[f32; 2]], center: [f32; 2]) -> f32 {
    if points.is_empty() {
        return 0.0;
    }
    let mut sectors = [false; 8];
    for &[x, y] in points {
        let angle = (y - center[1]).atan2(x - center[0]);
        let mut sector = ((angle + std::f32::consts::PI) / (std::f32::consts::PI / 4.0)) as usize;
        if sector >= 8 {
            sector = 7;
        }
        sectors[sector] = true;
    }
    sectors.iter().filter(|&&s| s).count() as f32 / 8.0
}

/// Roundness score: minor over major axis, zero without an outline.
pub fn aspect_ratio_confidence(pupil: &Pupil) -> f32 {
    if !pupil.has_outline() {
        return 0.0;
    }
    pupil.minor_axis() / pupil.major_axis()
}

/// Cheap coarse pupil localization: the frame is shrunk to
/// `working_width × working_height`, the intensity threshold is raised from
/// dark to bright until a single connected dark region holds at least
/// `min_coverage` of the thresholded pixels, and that region's bounding box
/// (padded by one working pixel) is scaled back to frame resolution.
/// Falls back to the full frame when no region dominates.
pub fn coarse_pupil_detection(
    frame: &GrayImage,
    min_coverage: f32,
    working_width: u32,
    working_height: u32,
) -> Roi {
    let (fw, fh) = frame.dimensions();
    if fw == 0 || fh == 0 {
        return Roi::full(fw, fh);
    }
    let small = image::imageops::resize(
        frame,
        working_width.min(fw).max(1),
        working_height.min(fh).max(1),
        image::imageops::FilterType::Triangle,
    );
    let (w, h) = (small.width() as usize, small.height() as usize);
    let raw = small.as_raw();
    let min_val = *raw.iter().min().unwrap_or(&0) as i32;
    let mean_val =
        (raw.iter().map(|&v| v as u64).sum::<u64>() / raw.len().max(1) as u64) as i32;

    let mut mask = vec![0u8; w * h];
    for th in (min_val..=mean_val).step_by(5) {
        let mut mask_total = 0usize;
        for (m, &v) in mask.iter_mut().zip(raw.iter()) {
            *m = if (v as i32) <= th { 1 } else { 0 };
            mask_total += *m as usize;
        }
        if mask_total < w * h / 100 {
            continue;
        }
        let components = connected_components(&mask, w, h);
        let Some(largest) = components.iter().max_by_key(|c| c.len()) else {
            continue;
        };
        if (largest.len() as f32) < min_coverage * mask_total as f32 {
            continue;
        }

        let (mut x0, mut y0, mut x1, mut y1) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
        for &[x, y] in largest {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let sx = fw as f32 / w as f32;
        let sy = fh as f32 / h as f32;
        let rx = (((x0 - 1) as f32) * sx).max(0.0) as u32;
        let ry = (((y0 - 1) as f32) * sy).max(0.0) as u32;
        let rw = (((x1 - x0 + 3) as f32) * sx).ceil() as u32;
        let rh = (((y1 - y0 + 3) as f32) * sy).ceil() as u32;
        return Roi::new(rx, ry, rw, rh).clamped_to(fw, fh);
    }
    Roi::full(fw, fh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pupil::Pupil;
    use crate::test_utils::draw_filled_ellipse;

    #[test]
    fn outline_contrast_high_on_sharp_ellipse() {
        let img = draw_filled_ellipse(200, 200, 100.0, 100.0, 30.0, 20.0, 0.0, 10, 240);
        let pupil = Pupil::from_outline(100.0, 100.0, 60.0, 40.0, 0.0);
        let c = outline_contrast_confidence(&img, &pupil, 5);
        assert!(c > 0.7, "sharp outline should score high, got {}", c);
    }

    #[test]
    fn outline_contrast_low_on_flat_image() {
        let img = GrayImage::from_pixel(200, 200, image::Luma([128]));
        let pupil = Pupil::from_outline(100.0, 100.0, 60.0, 40.0, 0.0);
        assert!(outline_contrast_confidence(&img, &pupil, 5) < 0.05);
    }

    #[test]
    fn outline_contrast_zero_for_cleared_pupil() {
        let img = GrayImage::from_pixel(100, 100, image::Luma([128]));
        assert_eq!(outline_contrast_confidence(&img, &Pupil::cleared(), 5), 0.0);
    }

    #[test]
    fn angular_spread_full_circle_vs_half() {
        let center = [0.0, 0.0];
        let full: Vec<[f32; 2]> = (0..16)
            .map(|i| {
                let t = 2.0 * std::f32::consts::PI * i as f32 / 16.0;
                [t.cos(), t.sin()]
            })
            .collect();
        assert!((angular_spread_confidence(&full, center) - 1.0).abs() < 1e-6);

        let half: Vec<[f32; 2]> = full.iter().copied().filter(|p| p[1] > 0.0).collect();
        let c = angular_spread_confidence(&half, center);
        assert!(c <= 0.625 && c >= 0.25, "half circle spread {}", c);
    }

    #[test]
    fn aspect_ratio_scores() {
        let round = Pupil::from_outline(50.0, 50.0, 30.0, 30.0, 0.0);
        assert!((aspect_ratio_confidence(&round) - 1.0).abs() < 1e-6);
        let flat = Pupil::from_outline(50.0, 50.0, 40.0, 10.0, 0.0);
        assert!((aspect_ratio_confidence(&flat) - 0.25).abs() < 1e-6);
        assert_eq!(aspect_ratio_confidence(&Pupil::cleared()), 0.0);
    }

    #[test]
    fn edge_ratio_counts_boundary_support() {
        let pupil = Pupil::from_outline(50.0, 50.0, 40.0, 40.0, 0.0);
        let (w, h) = (100usize, 100usize);
        let mut edge = vec![0u8; w * h];
        // Paint edge pixels along the true boundary circle.
        for i in 0..360 {
            let t = (i as f32).to_radians();
            let x = (50.0 + 20.0 * t.cos()).round() as usize;
            let y = (50.0 + 20.0 * t.sin()).round() as usize;
            edge[y * w + x] = 255;
        }
        let mut pts = Vec::new();
        let c = edge_ratio_confidence(&edge, w, h, &pupil, &mut pts, 5);
        assert!(c > 0.9, "full boundary support expected, got {}", c);
        assert!(!pts.is_empty());

        let mut pts = Vec::new();
        let empty = vec![0u8; w * h];
        assert_eq!(
            edge_ratio_confidence(&empty, w, h, &pupil, &mut pts, 5),
            0.0
        );
    }

    #[test]
    fn coarse_detection_brackets_dark_region() {
        let img = draw_filled_ellipse(320, 240, 180.0, 120.0, 35.0, 25.0, 0.0, 20, 220);
        let roi = coarse_pupil_detection(&img, 0.5, 60, 40);
        // The returned box must contain the pupil and be much smaller than
        // the frame.
        assert!(roi.x < 145 && (roi.x + roi.width) > 215);
        assert!(roi.y < 95 && (roi.y + roi.height) > 145);
        assert!(roi.area() < 320 * 240 / 2);
    }

    #[test]
    fn coarse_detection_flat_image_returns_full_frame() {
        let img = GrayImage::from_pixel(100, 80, image::Luma([200]));
        let roi = coarse_pupil_detection(&img, 0.5, 60, 40);
        assert_eq!(roi, Roi::full(100, 80));
    }
}
