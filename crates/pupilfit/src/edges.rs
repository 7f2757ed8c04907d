//! Edge extraction shared by the edge-curve detectors.
//!
//! The stack is deliberately not the stock Canny: a fixed 16-tap
//! Gaussian/Gaussian-derivative pair produces the gradients, the high
//! threshold comes from a 64-bin magnitude histogram (≈70 % of pixels fall
//! below it), non-maximum suppression interpolates along the gradient
//! direction, and hysteresis flood-fills weak maxima from strong seeds.
//! Afterwards a set of neighbor-pattern thinning passes strips double
//! edges and branch points so that connected components become single
//! traceable curves.

use image::GrayImage;

const KERNEL_LEN: usize = 16;
// Sampled Gaussian (σ≈1.3) and its derivative; the exact taps the edge
// thresholds below are tuned against.
const GAUSSIAN: [f32; KERNEL_LEN] = [
    0.000000220358050,
    0.000007297256405,
    0.000146569312970,
    0.001785579770079,
    0.013193749090229,
    0.059130281094460,
    0.160732768610747,
    0.265003534507060,
    0.265003534507060,
    0.160732768610747,
    0.059130281094460,
    0.013193749090229,
    0.001785579770079,
    0.000146569312970,
    0.000007297256405,
    0.000000220358050,
];
const GAUSSIAN_DERIV: [f32; KERNEL_LEN] = [
    -0.000026704586264,
    -0.000276122963398,
    -0.003355163265098,
    -0.024616683775044,
    -0.108194751875585,
    -0.278368310241814,
    -0.388430056419619,
    -0.196732206873178,
    0.196732206873178,
    0.388430056419619,
    0.278368310241814,
    0.108194751875585,
    0.024616683775044,
    0.003355163265098,
    0.000276122963398,
    0.000026704586264,
];

const FLOOD_CAP: usize = 10_000;

/// Rectangular processing window inside an edge buffer.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub start_x: i32,
    pub end_x: i32,
    pub start_y: i32,
    pub end_y: i32,
}

impl Bounds {
    /// Window covering the whole `w × h` buffer.
    pub fn full(w: usize, h: usize) -> Self {
        Self {
            start_x: 0,
            end_x: w as i32,
            start_y: 0,
            end_y: h as i32,
        }
    }
}

/// A traced edge curve: its pixels and their rounded mean.
#[derive(Debug, Clone)]
pub struct Curve {
    pub points: Vec<[i32; 2]>,
    pub mean: [i32; 2],
}

/// Detect edges via the Gaussian-derivative stack; returns a 0/255 buffer
/// of the input dimensions.
pub fn gaussian_deriv_edges(pic: &GrayImage) -> Vec<u8> {
    let (w, h) = (pic.width() as usize, pic.height() as usize);
    if w < KERNEL_LEN || h < KERNEL_LEN {
        return vec![0; w * h];
    }

    let src: Vec<f32> = pic.as_raw().iter().map(|&v| v as f32).collect();

    // Separable derivative-of-Gaussian gradients.
    let smooth_y = convolve_cols(&src, w, h, &GAUSSIAN);
    let grad_x = convolve_rows(&smooth_y, w, h, &GAUSSIAN_DERIV);
    let smooth_x = convolve_rows(&src, w, h, &GAUSSIAN);
    let grad_y = convolve_cols(&smooth_x, w, h, &GAUSSIAN_DERIV);

    // Cancellation residue of the antisymmetric kernel leaves identical
    // micro-gradients across flat regions; they must read as exactly zero
    // or the suppression stage sees them as plateau maxima. A real
    // one-gray-level step responds at ~0.39, so the floor is safe.
    const MAG_FLOOR: f32 = 1e-2;
    let mut magnitude: Vec<f32> = grad_x
        .iter()
        .zip(grad_y.iter())
        .map(|(&gx, &gy)| {
            let m = gx.hypot(gy);
            if m < MAG_FLOOR {
                0.0
            } else {
                m
            }
        })
        .collect();

    // Min-max normalize the magnitude so histogram bins are comparable.
    let max_mag = magnitude.iter().cloned().fold(0.0f32, f32::max);
    if max_mag <= 0.0 || !max_mag.is_finite() {
        return vec![0; w * h];
    }
    for m in &mut magnitude {
        *m /= max_mag;
    }

    // High threshold from the 64-bin histogram: first bin edge with ~70 %
    // of the pixels below it.
    const HIST_BINS: usize = 64;
    let mut hist = [0usize; HIST_BINS];
    for &m in &magnitude {
        let bin = ((m * (HIST_BINS - 1) as f32).round() as usize).min(HIST_BINS - 1);
        hist[bin] += 1;
    }
    let below_target = (0.7 * (w * h) as f64).round() as usize;
    let mut high_th = 1.0f32;
    let mut acc = 0usize;
    for (i, &count) in hist.iter().enumerate() {
        acc += count;
        if acc > below_target {
            high_th = (i + 1) as f32 / HIST_BINS as f32;
            break;
        }
    }

    // Direction-interpolated non-maximum suppression. Weak map keeps every
    // directional maximum; strong map additionally requires the high
    // threshold.
    let mut weak = vec![0u8; w * h];
    let mut strong = vec![0u8; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let idx = y * w + x;
            let ix = grad_x[idx];
            let iy = grad_y[idx];
            let m = magnitude[idx];
            if m <= 0.0 {
                continue;
            }

            let mut keep = |g1: f32, g2: f32| {
                if m >= g1 && m >= g2 {
                    weak[idx] = 255;
                    if m > high_th {
                        strong[idx] = 255;
                    }
                }
            };

            if (iy <= 0.0 && ix > -iy) || (iy >= 0.0 && ix < -iy) {
                let d = (iy / ix).abs();
                keep(
                    magnitude[idx + 1] * (1.0 - d) + magnitude[idx - w + 1] * d,
                    magnitude[idx - 1] * (1.0 - d) + magnitude[idx + w - 1] * d,
                );
            }
            if (ix > 0.0 && -iy >= ix) || (ix < 0.0 && -iy <= ix) {
                let d = (ix / iy).abs();
                keep(
                    magnitude[idx - w] * (1.0 - d) + magnitude[idx - w + 1] * d,
                    magnitude[idx + w] * (1.0 - d) + magnitude[idx + w - 1] * d,
                );
            }
            if (ix <= 0.0 && ix > iy) || (ix >= 0.0 && ix < iy) {
                let d = (ix / iy).abs();
                keep(
                    magnitude[idx - w] * (1.0 - d) + magnitude[idx - w - 1] * d,
                    magnitude[idx + w] * (1.0 - d) + magnitude[idx + w + 1] * d,
                );
            }
            if (iy < 0.0 && ix <= iy) || (iy > 0.0 && ix >= iy) {
                let d = (iy / ix).abs();
                keep(
                    magnitude[idx - 1] * (1.0 - d) + magnitude[idx - w - 1] * d,
                    magnitude[idx + 1] * (1.0 - d) + magnitude[idx + w + 1] * d,
                );
            }
        }
    }

    hysteresis_select(&strong, &weak, w, h)
}

/// Keep weak-map pixels reachable from strong seeds (8-connected flood,
/// bounded per component).
fn hysteresis_select(strong: &[u8], weak: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut out = vec![0u8; w * h];
    let mut stack: Vec<usize> = Vec::with_capacity(FLOOD_CAP);

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let idx = y * w + x;
            if strong[idx] == 0 || out[idx] != 0 {
                continue;
            }
            out[idx] = 255;
            stack.clear();
            stack.push(idx);
            let mut head = 0;
            let mut grown = 1usize;
            while head < stack.len() && grown < FLOOD_CAP {
                let pos = stack[head];
                head += 1;
                if pos < w + 1 || pos + w + 1 >= w * h {
                    continue;
                }
                for dy in [-(w as isize), 0, w as isize] {
                    for dx in [-1isize, 0, 1] {
                        let n = (pos as isize + dy + dx) as usize;
                        if out[n] == 0 && weak[n] != 0 {
                            out[n] = 255;
                            stack.push(n);
                            grown += 1;
                        }
                    }
                }
            }
        }
    }
    out
}

fn convolve_rows(src: &[f32], w: usize, h: usize, kernel: &[f32; KERNEL_LEN]) -> Vec<f32> {
    let anchor = KERNEL_LEN as i32 / 2;
    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w as i32 {
            let mut acc = 0.0f32;
            for (k, &kv) in kernel.iter().enumerate() {
                let sx = (x + k as i32 - anchor).clamp(0, w as i32 - 1) as usize;
                acc += row[sx] * kv;
            }
            out[y * w + x as usize] = acc;
        }
    }
    out
}

fn convolve_cols(src: &[f32], w: usize, h: usize, kernel: &[f32; KERNEL_LEN]) -> Vec<f32> {
    let anchor = KERNEL_LEN as i32 / 2;
    let mut out = vec![0.0f32; w * h];
    for y in 0..h as i32 {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (k, &kv) in kernel.iter().enumerate() {
                let sy = (y + k as i32 - anchor).clamp(0, h as i32 - 1) as usize;
                acc += src[sy * w + x] * kv;
            }
            out[y as usize * w + x] = acc;
        }
    }
    out
}

#[inline]
fn shrink_bounds(b: Bounds, w: usize, h: usize, margin: i32) -> Bounds {
    Bounds {
        start_x: (b.start_x + margin).max(margin),
        end_x: (b.end_x - margin).min(w as i32 - margin),
        start_y: (b.start_y + margin).max(margin),
        end_y: (b.end_y - margin).min(h as i32 - margin),
    }
}

/// Thinning used by the ellipse-selection pipeline: orthogonal-pair
/// removal, crowded-neighborhood removal, staircase straightening and
/// diagonal branch pruning.
pub fn thin_edges(edge: &mut [u8], w: usize, h: usize, bounds: Bounds) {
    let b = shrink_bounds(bounds, w, h, 5);
    if b.start_x >= b.end_x || b.start_y >= b.end_y {
        return;
    }
    orthogonal_pair_pass(edge, w, b);
    crowded_pass(edge, w, b);
    straighten_pass(edge, w, b);
    diagonal_prune_pass(edge, w, b, DiagonalVariant::Short);
    ladder_prune_pass(edge, w, b);
}

/// Thinning used by the curve-segmentation pipeline: an extra leading pass
/// removes points whose neighbors subtend too narrow an angle (double-edge
/// responses), then the shared passes run.
pub fn thin_edges_low_angle(edge: &mut [u8], w: usize, h: usize, bounds: Bounds) {
    let b = shrink_bounds(bounds, w, h, 5);
    if b.start_x >= b.end_x || b.start_y >= b.end_y {
        return;
    }
    low_angle_pass(edge, w, b);
    orthogonal_pair_pass(edge, w, b);
    straighten_pass(edge, w, b);
    diagonal_prune_pass(edge, w, b, DiagonalVariant::Long);
}

fn low_angle_pass(edge: &mut [u8], w: usize, b: Bounds) {
    let at = |e: &[u8], x: i32, y: i32| e[(y as usize) * w + x as usize];
    for j in b.start_y..b.end_y {
        for i in b.start_x..b.end_x {
            if at(edge, i, j) == 0 {
                continue;
            }
            // 8-neighborhood in clockwise order starting top-left.
            let ring = [
                at(edge, i - 1, j - 1),
                at(edge, i, j - 1),
                at(edge, i + 1, j - 1),
                at(edge, i + 1, j),
                at(edge, i + 1, j + 1),
                at(edge, i, j + 1),
                at(edge, i - 1, j + 1),
                at(edge, i - 1, j),
            ];
            let mut valid = false;
            for k in 0..8 {
                if ring[k] != 0
                    && (2..=6).any(|off: usize| ring[(k + off) % 8] != 0)
                {
                    valid = true;
                    break;
                }
            }
            if !valid {
                edge[(j as usize) * w + i as usize] = 0;
            }
        }
    }
}

fn orthogonal_pair_pass(edge: &mut [u8], w: usize, b: Bounds) {
    for j in b.start_y..b.end_y {
        for i in b.start_x..b.end_x {
            let idx = (j as usize) * w + i as usize;
            if edge[idx] == 0 {
                continue;
            }
            let up = edge[idx - w] != 0;
            let down = edge[idx + w] != 0;
            let left = edge[idx - 1] != 0;
            let right = edge[idx + 1] != 0;
            if (right && down) || (right && up) || (left && down) || (left && up) {
                edge[idx] = 0;
            }
        }
    }
}

fn crowded_pass(edge: &mut [u8], w: usize, b: Bounds) {
    for j in b.start_y..b.end_y {
        for i in b.start_x..b.end_x {
            let idx = (j as usize) * w + i as usize;
            let mut neighbors = 0;
            for dy in [-(w as isize), 0, w as isize] {
                for dx in [-1isize, 0, 1] {
                    if edge[(idx as isize + dy + dx) as usize] != 0 {
                        neighbors += 1;
                    }
                }
            }
            if neighbors > 3 {
                edge[idx] = 0;
            }
        }
    }
}

/// Rewrite two-pixel staircases into straight runs so curves trace as
/// single strands. Neighbor states are snapshotted before any rewrite, so
/// each pixel's decision sees the pre-pass neighborhood.
fn straighten_pass(edge: &mut [u8], w: usize, b: Bounds) {
    let stride = w as i32;
    for j in b.start_y..b.end_y {
        for i in b.start_x..b.end_x {
            let idx = (j * stride + i) as usize;
            if edge[idx] == 0 {
                continue;
            }
            let off = |dx: i32, dy: i32| (idx as i32 + dy * stride + dx) as usize;
            let at = |edge: &[u8], dx: i32, dy: i32| edge[off(dx, dy)] != 0;

            let below1 = at(edge, 0, 1);
            let below2 = at(edge, 0, 2);
            let below3 = at(edge, 0, 3);
            let right1 = at(edge, 1, 0);
            let right2 = at(edge, 2, 0);
            let right3 = at(edge, 3, 0);
            let dl1 = at(edge, -1, 1);
            let dr1 = at(edge, 1, 1);
            let dl2 = at(edge, -1, 2);
            let dr2 = at(edge, 1, 2);
            let ur1 = at(edge, 1, -1);
            let r1_down = at(edge, 2, 1);
            let r1_up = at(edge, 2, -1);

            if below2 && !below1 && (dr1 || dl1) {
                edge[off(-1, 1)] = 0;
                edge[off(1, 1)] = 0;
                edge[off(0, 1)] = 255;
            }
            if below3 && !below1 && !below2 && (dr1 || dl1) && (dr2 || dl2) {
                edge[off(1, 1)] = 0;
                edge[off(-1, 1)] = 0;
                edge[off(1, 2)] = 0;
                edge[off(-1, 2)] = 0;
                edge[off(0, 1)] = 255;
                edge[off(0, 2)] = 255;
            }
            if right2 && !right1 && (dr1 || ur1) {
                edge[off(1, 1)] = 0;
                edge[off(1, -1)] = 0;
                edge[off(1, 0)] = 255;
            }
            if right3 && !right1 && !right2 && (dr1 || ur1) && (r1_down || r1_up) {
                edge[off(1, 1)] = 0;
                edge[off(1, -1)] = 0;
                edge[off(2, 1)] = 0;
                edge[off(2, -1)] = 0;
                edge[off(1, 0)] = 255;
                edge[off(2, 0)] = 255;
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum DiagonalVariant {
    /// Two-step diagonal probes.
    Short,
    /// Three-step diagonal probes.
    Long,
}

/// Remove pixels that sit on parallel double strands or diagonal branch
/// crossings in the 7×7 neighborhood.
fn diagonal_prune_pass(edge: &mut [u8], w: usize, b: Bounds, variant: DiagonalVariant) {
    let stride = w as i32;
    for j in b.start_y..b.end_y {
        for i in b.start_x..b.end_x {
            let idx = (j * stride + i) as usize;
            if edge[idx] == 0 {
                continue;
            }
            let at = |dx: i32, dy: i32| edge[(idx as i32 + dy * stride + dx) as usize] != 0;

            let mut remove = false;
            // Adjacent strand one pixel off on either side.
            remove |= at(0, 1) && at(1, -1) && at(2, -1);
            remove |= at(0, 1) && at(-1, -1) && at(-2, -1);
            remove |= at(0, -1) && at(1, 1) && at(2, 1);
            remove |= at(0, -1) && at(-1, 1) && at(-2, 1);

            // Vertical/horizontal double strands three pixels long.
            remove |= at(-1, 0) && at(-1, -2) && at(-1, -3) && at(1, 1) && at(2, 1) && at(3, 1);
            remove |= at(1, 0) && at(1, -2) && at(1, -3) && at(-1, 1) && at(-2, 1) && at(-3, 1);
            remove |= at(-1, 1) && at(-1, 2) && at(-1, 3) && at(1, -1) && at(2, -1) && at(3, -1);
            remove |= at(1, 1) && at(1, 2) && at(1, 3) && at(-1, -1) && at(-2, -1) && at(-3, -1);

            // Diagonal crossings.
            match variant {
                DiagonalVariant::Short => {
                    remove |= at(-1, -1) && at(-2, -2) && at(1, -1) && at(2, -2);
                    remove |= at(-1, -1) && at(-2, -2) && at(-1, 1) && at(-2, 2);
                    remove |= at(1, 1) && at(2, 2) && at(1, -1) && at(2, -2);
                    remove |= at(1, 1) && at(2, 2) && at(-1, 1) && at(-2, 2);
                }
                DiagonalVariant::Long => {
                    remove |= at(-1, -1) && at(-2, -2) && at(-3, -3) && at(1, -1) && at(2, -2) && at(3, -3);
                    remove |= at(-1, -1) && at(-2, -2) && at(-3, -3) && at(-1, 1) && at(-2, 2) && at(-3, 3);
                    remove |= at(1, 1) && at(2, 2) && at(3, 3) && at(1, -1) && at(2, -2) && at(3, -3);
                    remove |= at(1, 1) && at(2, 2) && at(3, 3) && at(-1, 1) && at(-2, 2) && at(-3, 3);
                }
            }

            if remove {
                edge[idx] = 0;
            }
        }
    }
}

/// Remove rungs connecting two parallel diagonal strands.
fn ladder_prune_pass(edge: &mut [u8], w: usize, b: Bounds) {
    let stride = w as i32;
    for j in b.start_y..b.end_y {
        for i in b.start_x..b.end_x {
            let idx = (j * stride + i) as usize;
            if edge[idx] == 0 {
                continue;
            }
            let at = |dx: i32, dy: i32| edge[(idx as i32 + dy * stride + dx) as usize] != 0;

            let mut remove = false;
            remove |= at(-1, 0) && at(-2, -1) && at(-3, -2) && at(1, -1) && at(2, -2);
            remove |= at(-1, 0) && at(-2, 1) && at(-3, 2) && at(1, 1) && at(2, 2);
            remove |= at(0, 1) && at(1, 2) && at(2, 3) && at(-1, 1) && at(-2, 2);
            remove |= at(0, 1) && at(-1, 2) && at(-2, 3) && at(-1, -1) && at(-2, -2);
            if remove {
                edge[idx] = 0;
            }
        }
    }
}

/// Trace 8-connected curves in a binary edge buffer; curves shorter than
/// `min_len` pixels are dropped.
pub fn trace_curves(edge: &[u8], w: usize, h: usize, bounds: Bounds, min_len: usize) -> Vec<Curve> {
    let b = Bounds {
        start_x: bounds.start_x.max(2),
        end_x: bounds.end_x.min(w as i32 - 2),
        start_y: bounds.start_y.max(2),
        end_y: bounds.end_y.min(h as i32 - 2),
    };
    if b.start_x >= b.end_x || b.start_y >= b.end_y {
        return Vec::new();
    }

    let mut seen = vec![false; w * h];
    let mut curves = Vec::new();

    for i in b.start_x..b.end_x {
        for j in b.start_y..b.end_y {
            let idx = (j as usize) * w + i as usize;
            if edge[idx] == 0 || seen[idx] {
                continue;
            }
            seen[idx] = true;

            let mut points = vec![[i, j]];
            let (mut sum_x, mut sum_y) = (i as i64, j as i64);
            let mut head = 0;
            while head < points.len() {
                let [cx, cy] = points[head];
                head += 1;
                for dx in -1..=1i32 {
                    for dy in -1..=1i32 {
                        let (nx, ny) = (cx + dx, cy + dy);
                        if nx < b.start_x || nx >= b.end_x || ny < b.start_y || ny >= b.end_y {
                            continue;
                        }
                        let nidx = (ny as usize) * w + nx as usize;
                        if !seen[nidx] && edge[nidx] != 0 {
                            seen[nidx] = true;
                            sum_x += nx as i64;
                            sum_y += ny as i64;
                            points.push([nx, ny]);
                        }
                    }
                }
            }

            if points.len() > min_len {
                let n = points.len() as f64;
                let mean = [
                    (sum_x as f64 / n + 0.5).floor() as i32,
                    (sum_y as f64 / n + 0.5).floor() as i32,
                ];
                curves.push(Curve { points, mean });
            }
        }
    }
    curves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::draw_filled_ellipse;

    #[test]
    fn edges_of_dark_disk_form_a_ring() {
        let img = draw_filled_ellipse(120, 120, 60.0, 60.0, 30.0, 30.0, 0.0, 10, 240);
        let edge = gaussian_deriv_edges(&img);
        let w = 120usize;

        let mut on_ring = 0usize;
        let mut off_ring = 0usize;
        for (idx, &v) in edge.iter().enumerate() {
            if v == 0 {
                continue;
            }
            let x = (idx % w) as f32 - 60.0;
            let y = (idx / w) as f32 - 60.0;
            let r = (x * x + y * y).sqrt();
            if (r - 30.0).abs() < 3.0 {
                on_ring += 1;
            } else {
                off_ring += 1;
            }
        }
        assert!(on_ring > 60, "expected a dense ring, got {}", on_ring);
        assert!(
            off_ring < on_ring / 4,
            "too many stray edges: {} vs {}",
            off_ring,
            on_ring
        );
    }

    #[test]
    fn flat_image_has_no_edges() {
        let img = GrayImage::from_pixel(64, 64, image::Luma([255]));
        let edge = gaussian_deriv_edges(&img);
        assert!(edge.iter().all(|&v| v == 0));
    }

    #[test]
    fn curves_traced_from_ellipse_boundary() {
        let img = draw_filled_ellipse(120, 120, 60.0, 60.0, 34.0, 22.0, 0.4, 10, 240);
        let mut edge = gaussian_deriv_edges(&img);
        thin_edges(&mut edge, 120, 120, Bounds::full(120, 120));
        let curves = trace_curves(&edge, 120, 120, Bounds::full(120, 120), 10);
        assert!(!curves.is_empty(), "boundary should survive thinning");

        // The longest traced arc still describes the drawn ellipse.
        let longest = curves.iter().max_by_key(|c| c.points.len()).unwrap();
        assert!(longest.points.len() > 30, "len = {}", longest.points.len());
        let pts: Vec<[f64; 2]> = longest
            .points
            .iter()
            .map(|&[x, y]| [x as f64, y as f64])
            .collect();
        let fitted = crate::conic::fit_ellipse_lsq(&pts).expect("arc should fit an ellipse");
        assert!((fitted.cx - 60.0).abs() < 3.0, "cx = {}", fitted.cx);
        assert!((fitted.cy - 60.0).abs() < 3.0, "cy = {}", fitted.cy);
        assert!((fitted.a - 34.0).abs() < 3.0, "a = {}", fitted.a);
        assert!((fitted.b - 22.0).abs() < 3.0, "b = {}", fitted.b);
    }

    #[test]
    fn short_fragments_are_dropped() {
        let mut edge = vec![0u8; 64 * 64];
        for k in 0..5 {
            edge[20 * 64 + 20 + k] = 255;
        }
        let curves = trace_curves(&edge, 64, 64, Bounds::full(64, 64), 10);
        assert!(curves.is_empty());
    }
}
