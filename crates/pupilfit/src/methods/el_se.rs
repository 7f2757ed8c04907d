//! ElSe: ellipse selection over filtered edge curves, with a convolution
//! blob finder as the fallback when no curve survives.

use image::GrayImage;
use tracing::debug;

use crate::conic::{fit_ellipse_lsq, Ellipse};
use crate::edges::{gaussian_deriv_edges, thin_edges, trace_curves, Bounds, Curve};
use crate::imgproc::{downscale_to, normalize_minmax, region_mean};
use crate::method::{PupilDetectionMethod, MIN_ROI_AREA};
use crate::pupil::{Pupil, Roi};

const WORKING_SIZE: u32 = 640;
const MIN_CURVE_LEN: usize = 10;
/// A curve passing within this distance of its own centroid is not a
/// convex arc and cannot bound a pupil.
const MEAN_DIST: i32 = 3;
/// Required interior-vs-surround intensity margin for an accepted ellipse.
const GOOD_ELLIPSE_MARGIN: f32 = 10.0;

/// Edge-curve pupil detector with area-ratio gating.
#[derive(Debug, Clone)]
pub struct ElSe {
    /// Minimum accepted ellipse area as a fraction of the frame area.
    pub min_area_ratio: f32,
    /// Maximum accepted ellipse area as a fraction of the frame area.
    pub max_area_ratio: f32,
    /// Absolute area window (working-image pixels), set from diameter
    /// hints; overrides the ratios while present.
    area_override: Option<(f32, f32)>,
}

impl Default for ElSe {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.005,
            max_area_ratio: 0.2,
            area_override: None,
        }
    }
}

impl PupilDetectionMethod for ElSe {
    fn title(&self) -> &'static str {
        "ElSe"
    }

    fn description(&self) -> &'static str {
        "ElSe (Fuhl et al. 2016)"
    }

    fn detect(&mut self, frame: &GrayImage) -> Pupil {
        let (downscaled, ratio) = downscale_to(frame, WORKING_SIZE);
        let pic = normalize_minmax(&downscaled);
        let (w, h) = (pic.width() as usize, pic.height() as usize);
        if w < 16 || h < 16 {
            return Pupil::cleared();
        }

        let frame_area = (w * h) as f32;
        let (min_area, max_area) = match self.area_override {
            // Hints arrive in input-frame pixels; bring them into the
            // working scale.
            Some((lo, hi)) => (lo * ratio * ratio, hi * ratio * ratio),
            None => (
                frame_area * self.min_area_ratio,
                frame_area * self.max_area_ratio,
            ),
        };

        let bounds = Bounds::full(w, h);
        let mut edge = gaussian_deriv_edges(&pic);
        thin_edges(&mut edge, w, h, bounds);

        let mut pupil = match select_best_curve(&pic, &edge, w, h, bounds, min_area, max_area) {
            Some(ellipse) => Pupil::from_outline(
                ellipse.cx as f32,
                ellipse.cy as f32,
                (2.0 * ellipse.a) as f32,
                (2.0 * ellipse.b) as f32,
                ellipse.angle as f32,
            ),
            None => {
                debug!("no edge curve survived, trying blob finder");
                match blob_finder(&pic) {
                    // Coarse location only: the blob finder never commits
                    // to an outline.
                    Some([cx, cy]) => Pupil::from_outline(cx, cy, 0.0, 0.0, 0.0),
                    None => Pupil::cleared(),
                }
            }
        };
        if pupil.cx > 0.0 {
            pupil.rescale(1.0 / ratio);
        }
        pupil
    }

    fn detect_roi(
        &mut self,
        frame: &GrayImage,
        roi: Roi,
        min_pupil_diameter_px: f32,
        max_pupil_diameter_px: f32,
    ) -> Pupil {
        let roi = roi.clamped_to(frame.width(), frame.height());
        if roi.area() < MIN_ROI_AREA {
            debug!("degenerate ROI, falling back to full frame");
            return self.detect(frame);
        }
        self.area_override = (min_pupil_diameter_px > 0.0 && max_pupil_diameter_px > 0.0).then(
            || {
                (
                    min_pupil_diameter_px * min_pupil_diameter_px,
                    max_pupil_diameter_px * max_pupil_diameter_px,
                )
            },
        );
        let cropped = crate::imgproc::crop(frame, roi.x, roi.y, roi.width, roi.height);
        let pupil = self.detect(&cropped);
        self.area_override = None;
        pupil
    }
}

/// Pick the surviving curve with the darkest interior; `None` when no
/// curve passes the gates.
fn select_best_curve(
    pic: &GrayImage,
    edge: &[u8],
    w: usize,
    h: usize,
    bounds: Bounds,
    min_area: f32,
    max_area: f32,
) -> Option<Ellipse> {
    let curves = trace_curves(edge, w, h, bounds, MIN_CURVE_LEN);

    let mut best: Option<(Ellipse, i64, usize)> = None;
    for curve in &curves {
        // Arcs that run through their own centroid cannot enclose a pupil.
        if curve.points.iter().any(|&[x, y]| {
            (curve.mean[0] - x).abs() <= MEAN_DIST && (curve.mean[1] - y).abs() <= MEAN_DIST
        }) {
            continue;
        }

        let pts: Vec<[f64; 2]> = curve
            .points
            .iter()
            .map(|&[x, y]| [x as f64, y as f64])
            .collect();
        let Some(ellipse) = fit_ellipse_lsq(&pts) else {
            continue;
        };

        if ellipse.cx < 0.0
            || ellipse.cy < 0.0
            || ellipse.cx > w as f64
            || ellipse.cy > h as f64
        {
            continue;
        }
        if ellipse.aspect_ratio() > 3.0 {
            continue;
        }
        let area = (2.0 * ellipse.a * 2.0 * ellipse.b) as f32;
        if area < min_area || area > max_area {
            continue;
        }
        if !interior_darker_than_surround(pic, &ellipse, GOOD_ELLIPSE_MARGIN) {
            continue;
        }

        let inner = inner_gray_level(pic, curve, &ellipse);
        let weighted = (inner as f64 * (1.0 + (2.0 * ellipse.a - 2.0 * ellipse.b).abs())) as i64;
        let replace = match &best {
            None => true,
            Some((_, best_weighted, best_len)) => {
                weighted < *best_weighted
                    || (weighted == *best_weighted && curve.points.len() > *best_len)
            }
        };
        if replace {
            best = Some((ellipse, weighted, curve.points.len()));
        }
    }
    best.map(|(e, _, _)| e)
}

/// Interior-vs-surround contrast gate: the central quarter-size box must
/// be darker than the surrounding annulus by at least `margin` gray
/// levels.
fn interior_darker_than_surround(pic: &GrayImage, ellipse: &Ellipse, margin: f32) -> bool {
    if ellipse.cx == 0.0 && ellipse.cy == 0.0 {
        return false;
    }
    let (x0, y0) = (ellipse.cx as f32, ellipse.cy as f32);
    let (width, height) = ((2.0 * ellipse.a) as f32, (2.0 * ellipse.b) as f32);

    let inner = region_mean(
        pic,
        (x0 - width / 4.0).ceil() as i32,
        (x0 + width / 4.0).floor() as i32,
        (y0 - height / 4.0).ceil() as i32,
        (y0 + height / 4.0).floor() as i32,
    );
    let Some(inner) = inner else { return false };

    // Surround = 1.5×-size box minus the 1×-size box.
    let Some(surround) = annulus_mean(pic, x0, y0, width, height) else {
        return false;
    };
    surround - inner > margin
}

fn annulus_mean(pic: &GrayImage, x0: f32, y0: f32, width: f32, height: f32) -> Option<f32> {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();
    let (st_x, st_y) = ((x0 - width * 0.75) as i32, (y0 - height * 0.75) as i32);
    let (en_x, en_y) = ((x0 + width * 0.75) as i32, (y0 + height * 0.75) as i32);
    let (in_st_x, in_st_y) = (
        (x0 - width / 2.0).ceil() as i32,
        (y0 - height / 2.0).ceil() as i32,
    );
    let (in_en_x, in_en_y) = (
        (x0 + width / 2.0).floor() as i32,
        (y0 + height / 2.0).floor() as i32,
    );

    let mut sum = 0.0f64;
    let mut count = 0u32;
    for i in st_x..en_x {
        for j in st_y..en_y {
            if i >= in_st_x && i <= in_en_x && j >= in_st_y && j <= in_en_y {
                continue;
            }
            if i > 0 && i < w && j > 0 && j < h {
                sum += raw[(w * j + i) as usize] as f64;
                count += 1;
            }
        }
    }
    (count > 0).then(|| (sum / count as f64) as f32)
}

/// Mean gray level sampled just inside the curve (radial band 0.95 → 0.81
/// toward the ellipse center, deduplicated per pixel). Dark interiors win
/// the curve selection.
fn inner_gray_level(pic: &GrayImage, curve: &Curve, ellipse: &Ellipse) -> i32 {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();
    let mut visited = std::collections::HashSet::new();
    let mut sum = 0i64;
    let mut count = 0i64;

    for &[px, py] in &curve.points {
        let vec_x = (px as f64 - ellipse.cx).round();
        let vec_y = (py as f64 - ellipse.cy).round();
        let mut p = 0.95f64;
        while p > 0.80 {
            let sx = (ellipse.cx + vec_x * p + 0.5).round() as i32;
            let sy = (ellipse.cy + vec_y * p + 0.5).round() as i32;
            if sx > 0 && sx < w && sy > 0 && sy < h && visited.insert((sx, sy)) {
                sum += raw[(w * sy + sx) as usize] as i64;
                count += 1;
            }
            p -= 0.01;
        }
    }
    if count > 0 {
        (sum / count) as i32
    } else {
        1000
    }
}

// ── Fallback blob finder ───────────────────────────────────────────────────

const BLOCK_FACTOR: i32 = 5;

/// Locate the single darkest circular region via a zero-sum disk/annulus
/// kernel over a strongly downsampled image; returns the refined center in
/// working-image coordinates.
fn blob_finder(pic: &GrayImage) -> Option<[f32; 2]> {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();

    let small = mean_under_mean(pic, BLOCK_FACTOR);
    let (sw, sh) = (small.0, small.1);
    if sw < 3 || sh < 3 {
        return None;
    }
    let kernel_radius = if w > h { w / 100 + 1 } else { h / 100 + 1 };
    let (disk, disk_only) = blob_kernels(kernel_radius);

    let pos_resp = convolve2d_replicate(&small.2, sw, sh, &disk.0, disk.1);
    let neg_resp = convolve2d_replicate(&small.2, sw, sh, &disk_only.0, disk_only.1);

    let mut best = 0.0f32;
    let mut best_pos: Option<(i32, i32)> = None;
    for i in 0..sh as usize {
        for j in 0..sw as usize {
            let p = pos_resp[i * sw as usize + j].max(0.0);
            let score = (255.0 - neg_resp[i * sw as usize + j]) * p;
            if score > best {
                best = score;
                best_pos = Some((
                    (BLOCK_FACTOR + 1) + j as i32 * (BLOCK_FACTOR + 1),
                    (BLOCK_FACTOR + 1) + i as i32 * (BLOCK_FACTOR + 1),
                ));
            }
        }
    }
    let (mut px, mut py) = best_pos?;
    if px <= 0 || px >= w || py <= 0 || py >= h {
        return None;
    }

    // Refine: centroid of pixels at or below a local adaptive threshold.
    let local_mean = region_mean(pic, px - 2, px + 2, py - 2, py + 2)?;
    let center_val = raw[(w * py + px) as usize] as f32;
    let th = center_val + (local_mean - center_val).abs();
    let reach = BLOCK_FACTOR * BLOCK_FACTOR;
    let (mut sum_x, mut sum_y, mut count) = (0i64, 0i64, 0i64);
    for dy in -reach..reach {
        for dx in -reach..reach {
            let (x, y) = (px + dx, py + dy);
            if x > 0 && x < w && y > 0 && y < h && raw[(w * y + x) as usize] as f32 <= th {
                sum_x += x as i64;
                sum_y += y as i64;
                count += 1;
            }
        }
    }
    if count > 0 {
        px = (sum_x / count) as i32;
        py = (sum_y / count) as i32;
    }
    if px <= 0 || px >= w || py <= 0 || py >= h {
        return None;
    }

    // Keep the location only when it still looks like a dark blob of the
    // probe size.
    let probe = Ellipse {
        cx: px as f64,
        cy: py as f64,
        a: (reach * 2 + 1) as f64 / 2.0,
        b: (reach * 2 + 1) as f64 / 2.0,
        angle: 0.0,
    };
    interior_darker_than_surround(pic, &probe, GOOD_ELLIPSE_MARGIN)
        .then_some([px as f32, py as f32])
}

/// Block downsample where each output pixel is the mean of the
/// below-block-mean input pixels ("mean under mean"), biasing toward dark
/// structure.
fn mean_under_mean(pic: &GrayImage, factor: i32) -> (i32, i32, Vec<f32>) {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();
    let step = factor + 1;
    let (sw, sh) = (w / step, h / step);
    let mut out = vec![0.0f32; (sw * sh).max(0) as usize];

    for i in 0..sh {
        let cy = (i + 1) * step;
        for j in 0..sw {
            let cx = (j + 1) * step;
            let mut hist = [0u32; 256];
            let mut sum = 0u64;
            let mut count = 0u64;
            for dy in -factor..=factor {
                for dx in -factor..=factor {
                    let (x, y) = (cx + dx, cy + dy);
                    if x > 0 && x < w && y > 0 && y < h {
                        let v = raw[(w * y + x) as usize];
                        hist[v as usize] += 1;
                        sum += v as u64;
                        count += 1;
                    }
                }
            }
            if count == 0 {
                continue;
            }
            let mean = (sum / count) as usize;
            let mut under_sum = 0u64;
            let mut under_count = 0u64;
            for (v, &n) in hist.iter().enumerate().take(mean + 1) {
                under_sum += (v as u64) * n as u64;
                under_count += n as u64;
            }
            out[(i * sw + j) as usize] = if under_count == 0 {
                mean as f32
            } else {
                (under_sum / under_count) as f32
            };
        }
    }
    (sw, sh, out)
}

/// Zero-sum disk-vs-surround kernel and the disk-only indicator kernel,
/// both normalized by their pixel counts. Returned as (data, side).
#[allow(clippy::type_complexity)]
fn blob_kernels(radius: i32) -> ((Vec<f32>, i32), (Vec<f32>, i32)) {
    let side = 1 + 4 * radius;
    let c0 = 2 * radius;
    let mut signs = vec![1.0f32; (side * side) as usize];
    let mut positives = 0.0f32;
    let mut negatives = 0.0f32;

    for i in -c0..=c0 {
        for j in -c0..=c0 {
            let idx = ((c0 + i) * side + (c0 + j)) as usize;
            let inside_band = i >= -radius && i <= radius;
            let chord = if inside_band {
                ((radius * radius - i * i) as f32).sqrt() as i32
            } else {
                -1
            };
            if inside_band && j.abs() <= chord {
                signs[idx] = -1.0;
                negatives += 1.0;
            } else {
                positives += 1.0;
            }
        }
    }

    let mut kernel = vec![0.0f32; signs.len()];
    let mut disk_only = vec![0.0f32; signs.len()];
    for (i, &s) in signs.iter().enumerate() {
        if s > 0.0 {
            kernel[i] = 1.0 / positives;
        } else {
            kernel[i] = -1.0 / negatives;
            disk_only[i] = 1.0 / negatives;
        }
    }
    ((kernel, side), (disk_only, side))
}

fn convolve2d_replicate(src: &[f32], w: i32, h: i32, kernel: &[f32], side: i32) -> Vec<f32> {
    let half = side / 2;
    let mut out = vec![0.0f32; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for ky in 0..side {
                let sy = (y + ky - half).clamp(0, h - 1);
                for kx in 0..side {
                    let sx = (x + kx - half).clamp(0, w - 1);
                    acc += src[(sy * w + sx) as usize] * kernel[(ky * side + kx) as usize];
                }
            }
            out[(y * w + x) as usize] = acc;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::draw_filled_ellipse;

    #[test]
    fn detects_clean_synthetic_pupil() {
        let img = draw_filled_ellipse(200, 200, 100.0, 100.0, 20.0, 15.0, 0.0, 10, 245);
        let mut method = ElSe::default();
        let p = method.detect(&img);
        assert!(p.has_outline(), "expected an outline, got {:?}", p);
        assert!((p.cx - 100.0).abs() < 3.0, "cx = {}", p.cx);
        assert!((p.cy - 100.0).abs() < 3.0, "cy = {}", p.cy);
        let (maj, min) = (p.major_axis(), p.minor_axis());
        assert!((maj - 40.0).abs() < 4.0, "major = {}", maj);
        assert!((min - 30.0).abs() < 3.0, "minor = {}", min);
    }

    #[test]
    fn downscale_roundtrip_recovers_geometry() {
        // Above the working size, so the internal downscale/rescale path runs.
        let img = draw_filled_ellipse(800, 800, 400.0, 380.0, 80.0, 60.0, 0.0, 10, 245);
        let mut method = ElSe::default();
        let p = method.detect(&img);
        assert!(p.has_outline());
        assert!((p.cx - 400.0).abs() < 3.0, "cx = {}", p.cx);
        assert!((p.cy - 380.0).abs() < 3.0, "cy = {}", p.cy);
        assert!((p.major_axis() - 160.0).abs() < 16.0);
        assert!((p.minor_axis() - 120.0).abs() < 12.0);
    }

    #[test]
    fn area_gate_rejects_tiny_blob() {
        // A 4 px pupil is below the default minimum area ratio; the curve
        // path must reject it (the blob fallback may still localize it,
        // but then without an outline).
        let img = draw_filled_ellipse(200, 200, 100.0, 100.0, 2.0, 2.0, 0.0, 10, 245);
        let mut method = ElSe::default();
        let p = method.detect(&img);
        assert!(!p.has_outline(), "tiny blob must not produce an outline");
    }

    #[test]
    fn blank_frame_yields_invalid_pupil() {
        let img = GrayImage::from_pixel(200, 200, image::Luma([255]));
        let mut method = ElSe::default();
        let p = method.detect(&img);
        assert!(!p.valid(crate::pupil::NO_CONFIDENCE));
    }

    #[test]
    fn roi_result_is_roi_relative() {
        let img = draw_filled_ellipse(300, 300, 200.0, 180.0, 20.0, 15.0, 0.0, 10, 245);
        let mut method = ElSe::default();
        let roi = Roi::new(140, 120, 120, 120);
        let p = method.detect_roi(&img, roi, -1.0, -1.0);
        assert!(p.has_outline());
        assert!((p.cx - 60.0).abs() < 3.0, "roi-relative cx = {}", p.cx);
        assert!((p.cy - 60.0).abs() < 3.0, "roi-relative cy = {}", p.cy);
    }
}
