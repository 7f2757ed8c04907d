//! PuReST: tracking extension over the PuRe full search. A cheap outline
//! re-localization runs against the previous frame's pupil; only when it
//! fails does the greedy candidate search or the full PuRe pass run.

use image::GrayImage;
use tracing::debug;

use crate::confidence::{
    angular_spread_confidence, aspect_ratio_confidence, outline_contrast_confidence,
};
use crate::conic::{fit_ellipse_lsq, Ellipse};
use crate::edges::gaussian_deriv_edges;
use crate::imgproc::crop;
use crate::method::{PupilDetectionMethod, MIN_ROI_AREA};
use crate::pupil::{Pupil, Roi};

use super::pure::PuRe;

/// Band half-width around the previous outline accepted during tracking,
/// as a fraction of the minor semi-axis.
const TRACK_BAND_RATIO: f32 = 0.3;
/// Tracked ellipses may not grow or shrink beyond this factor per frame.
const MAX_SIZE_DRIFT: f32 = 1.5;
/// Acceptance score for a greedy candidate combination.
const GREEDY_MIN_CONFIDENCE: f32 = 0.5;
/// Seed combinations are bounded: at most this many seeds pooled together,
/// and at most this many combinations scored per frame.
const MAX_COMBINATION_LEN: usize = 3;
const MAX_COMBINATIONS: usize = 64;

/// A connected dark-edge component considered by the greedy search.
struct GreedyCandidate {
    points: Vec<[f32; 2]>,
    /// Largest pairwise distance between convex hull points.
    max_gap: f32,
    mean: [f32; 2],
}

impl GreedyCandidate {
    fn new(points: Vec<[f32; 2]>) -> Self {
        let hull = convex_hull(&points);
        let mut max_gap = 0.0f32;
        for (i, a) in hull.iter().enumerate() {
            for b in hull.iter().skip(i + 1) {
                let gap = (a[0] - b[0]).hypot(a[1] - b[1]);
                if gap > max_gap {
                    max_gap = gap;
                }
            }
        }
        let n = points.len().max(1) as f32;
        let mean = [
            points.iter().map(|p| p[0]).sum::<f32>() / n,
            points.iter().map(|p| p[1]).sum::<f32>() / n,
        ];
        Self {
            points,
            max_gap,
            mean,
        }
    }
}

/// Tracking-first pupil detector composing a [`PuRe`] full search.
#[derive(Debug, Clone)]
pub struct PuReST {
    /// Full-search routine and its physical-unit parameters.
    pub pure: PuRe,
    /// Minimum outline confidence for accepting a tracked update.
    pub min_outline_confidence: f32,
    previous_pupil: Option<Pupil>,
}

impl Default for PuReST {
    fn default() -> Self {
        Self::new()
    }
}

impl PuReST {
    pub fn new() -> Self {
        Self {
            pure: PuRe::default(),
            min_outline_confidence: 0.65,
            previous_pupil: None,
        }
    }

    /// Drop the previous pupil, forcing a full search on the next frame.
    pub fn reset_tracking(&mut self) {
        self.previous_pupil = None;
    }

    /// Fast path: re-sample the outline near the previous pupil and accept
    /// the refit when its contrast confidence is high enough.
    fn track_outline(&self, frame: &GrayImage, previous: &Pupil) -> Option<Pupil> {
        let (fw, fh) = frame.dimensions();
        let reach_x = previous.width.max(16.0);
        let reach_y = previous.height.max(16.0);
        let x0 = (previous.cx - reach_x).floor().max(0.0) as u32;
        let y0 = (previous.cy - reach_y).floor().max(0.0) as u32;
        let x1 = ((previous.cx + reach_x).ceil() as u32).min(fw);
        let y1 = ((previous.cy + reach_y).ceil() as u32).min(fh);
        if x1 <= x0 + 16 || y1 <= y0 + 16 {
            return None;
        }
        let local = crop(frame, x0, y0, x1 - x0, y1 - y0);
        let lw = local.width() as usize;
        let edge = gaussian_deriv_edges(&local);

        let prev_local = Ellipse {
            cx: (previous.cx - x0 as f32) as f64,
            cy: (previous.cy - y0 as f32) as f64,
            a: previous.width as f64 / 2.0,
            b: previous.height as f64 / 2.0,
            angle: previous.angle as f64,
        };
        let band = (TRACK_BAND_RATIO * 0.5 * previous.minor_axis() + 2.0).max(3.0) as f64;

        let mut band_points: Vec<[f64; 2]> = Vec::new();
        for (idx, &v) in edge.iter().enumerate() {
            if v == 0 {
                continue;
            }
            let (x, y) = ((idx % lw) as f64, (idx / lw) as f64);
            if prev_local.boundary_distance(x, y) <= band {
                band_points.push([x, y]);
            }
        }
        if band_points.len() < 6 {
            return None;
        }

        let fitted = fit_ellipse_lsq(&band_points)?;
        let drift = (fitted.a / prev_local.a) as f32;
        if !(1.0 / MAX_SIZE_DRIFT..=MAX_SIZE_DRIFT).contains(&drift) {
            return None;
        }

        let mut pupil = Pupil::from_outline(
            fitted.cx as f32,
            fitted.cy as f32,
            (2.0 * fitted.a) as f32,
            (2.0 * fitted.b) as f32,
            fitted.angle as f32,
        );
        let confidence = outline_contrast_confidence(&local, &pupil, 5);
        if confidence < self.min_outline_confidence {
            return None;
        }
        pupil.confidence = confidence;
        pupil.shift(x0 as f32, y0 as f32);
        Some(pupil)
    }

    /// Greedy fallback: group dark-adjacent edge components near the
    /// previous pupil, pool bounded combinations of them, and keep the
    /// best-scoring ellipse fit.
    fn greedy_search(&self, frame: &GrayImage, previous: &Pupil) -> Option<Pupil> {
        let (fw, fh) = frame.dimensions();
        let reach = 1.25 * previous.major_axis().max(16.0);
        let x0 = (previous.cx - reach).floor().max(0.0) as u32;
        let y0 = (previous.cy - reach).floor().max(0.0) as u32;
        let x1 = ((previous.cx + reach).ceil() as u32).min(fw);
        let y1 = ((previous.cy + reach).ceil() as u32).min(fh);
        if x1 <= x0 + 16 || y1 <= y0 + 16 {
            return None;
        }
        let local = crop(frame, x0, y0, x1 - x0, y1 - y0);
        let (lw, lh) = (local.width() as usize, local.height() as usize);

        // Edge pixels adjacent to previously-dark intensities.
        let dark_th = pupil_interior_mean(&local, previous, [x0 as f32, y0 as f32]) + 25.0;
        let edge = gaussian_deriv_edges(&local);
        let raw = local.as_raw();
        let mut dark_edge = vec![0u8; lw * lh];
        for (idx, &e) in edge.iter().enumerate() {
            if e == 0 {
                continue;
            }
            let (x, y) = (idx % lw, idx / lw);
            let near_dark = neighborhood_min(raw, lw, lh, x, y, 2) as f32 <= dark_th;
            if near_dark {
                dark_edge[idx] = 255;
            }
        }

        let components = crate::imgproc::connected_components(&dark_edge, lw, lh);
        let min_gap = 0.3 * previous.minor_axis();
        let max_gap = 1.6 * previous.major_axis();
        let mut seeds: Vec<GreedyCandidate> = components
            .into_iter()
            .filter(|c| c.len() >= 5)
            .map(|c| {
                GreedyCandidate::new(
                    c.into_iter().map(|[x, y]| [x as f32, y as f32]).collect(),
                )
            })
            .filter(|c| c.max_gap >= min_gap && c.max_gap <= max_gap)
            .collect();
        if seeds.is_empty() {
            return None;
        }
        // Nearest seeds to the previous center first, so the bounded
        // combination budget is spent where the pupil likely is.
        let prev_local = [previous.cx - x0 as f32, previous.cy - y0 as f32];
        seeds.sort_by(|a, b| {
            let da = (a.mean[0] - prev_local[0]).hypot(a.mean[1] - prev_local[1]);
            let db = (b.mean[0] - prev_local[0]).hypot(b.mean[1] - prev_local[1]);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        seeds.truncate(8);

        let combos = seed_combinations(seeds.len(), MAX_COMBINATION_LEN, MAX_COMBINATIONS);
        let mut best: Option<(Pupil, f32)> = None;
        for combo in combos {
            let mut pool: Vec<[f64; 2]> = Vec::new();
            let mut pool_f32: Vec<[f32; 2]> = Vec::new();
            for &s in &combo {
                for &[x, y] in &seeds[s].points {
                    pool.push([x as f64, y as f64]);
                    pool_f32.push([x, y]);
                }
            }
            if pool.len() < 6 {
                continue;
            }
            let Some(ellipse) = fit_ellipse_lsq(&pool) else {
                continue;
            };
            if ellipse.aspect_ratio() > 3.0
                || ellipse.cx < 0.0
                || ellipse.cy < 0.0
                || ellipse.cx > lw as f64
                || ellipse.cy > lh as f64
            {
                continue;
            }
            let mut candidate = Pupil::from_outline(
                ellipse.cx as f32,
                ellipse.cy as f32,
                (2.0 * ellipse.a) as f32,
                (2.0 * ellipse.b) as f32,
                ellipse.angle as f32,
            );
            let confidence = (outline_contrast_confidence(&local, &candidate, 5)
                + angular_spread_confidence(&pool_f32, [candidate.cx, candidate.cy])
                + aspect_ratio_confidence(&candidate))
                / 3.0;
            if confidence < GREEDY_MIN_CONFIDENCE {
                continue;
            }
            candidate.confidence = confidence;
            if best.as_ref().map_or(true, |(_, c)| confidence > *c) {
                best = Some((candidate, confidence));
            }
        }

        best.map(|(mut pupil, _)| {
            pupil.shift(x0 as f32, y0 as f32);
            pupil
        })
    }
}

impl PupilDetectionMethod for PuReST {
    fn title(&self) -> &'static str {
        "PuReST"
    }

    fn description(&self) -> &'static str {
        "PuReST (Santini et al. 2018)"
    }

    fn has_confidence(&self) -> bool {
        true
    }

    fn detect(&mut self, frame: &GrayImage) -> Pupil {
        if let Some(previous) = self.previous_pupil.clone() {
            if previous.has_outline() {
                if let Some(tracked) = self.track_outline(frame, &previous) {
                    self.previous_pupil = Some(tracked.clone());
                    return tracked;
                }
                debug!("outline tracking failed, trying greedy candidates");
                if let Some(found) = self.greedy_search(frame, &previous) {
                    self.previous_pupil = Some(found.clone());
                    return found;
                }
                debug!("greedy search failed, falling back to full search");
            }
        }

        let pupil = self.pure.detect(frame);
        if pupil.valid(crate::pupil::NO_CONFIDENCE) {
            self.previous_pupil = Some(pupil.clone());
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
        let cropped = crop(frame, roi.x, roi.y, roi.width, roi.height);
        let _ = (min_pupil_diameter_px, max_pupil_diameter_px);
        self.detect(&cropped)
    }

    fn reset(&mut self) {
        self.reset_tracking();
    }
}

/// Mean intensity inside the previous outline (frame coords shifted by
/// `origin` into the local crop).
fn pupil_interior_mean(local: &GrayImage, previous: &Pupil, origin: [f32; 2]) -> f32 {
    let (w, h) = (local.width() as i32, local.height() as i32);
    let raw = local.as_raw();
    let cx = previous.cx - origin[0];
    let cy = previous.cy - origin[1];
    let a = (0.5 * previous.width).max(1.0);
    let b = (0.5 * previous.height).max(1.0);
    let mut sum = 0.0f64;
    let mut count = 0u32;
    for y in 0..h {
        for x in 0..w {
            let u = (x as f32 - cx) / a;
            let v = (y as f32 - cy) / b;
            if u * u + v * v <= 0.64 {
                sum += raw[(w * y + x) as usize] as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        127.0
    } else {
        (sum / count as f64) as f32
    }
}

fn neighborhood_min(raw: &[u8], w: usize, h: usize, x: usize, y: usize, r: usize) -> u8 {
    let mut min = u8::MAX;
    for j in y.saturating_sub(r)..(y + r + 1).min(h) {
        for i in x.saturating_sub(r)..(x + r + 1).min(w) {
            min = min.min(raw[j * w + i]);
        }
    }
    min
}

/// Index combinations of sizes 1..=`max_len`, lexicographic within each
/// size, capped at `cap` total.
fn seed_combinations(n: usize, max_len: usize, cap: usize) -> Vec<Vec<usize>> {
    fn advance(combo: &mut [usize], n: usize) -> bool {
        let len = combo.len();
        let mut i = len;
        while i > 0 {
            i -= 1;
            if combo[i] < n - len + i {
                combo[i] += 1;
                for j in i + 1..len {
                    combo[j] = combo[j - 1] + 1;
                }
                return true;
            }
        }
        false
    }

    let mut out = Vec::new();
    for len in 1..=max_len.min(n) {
        let mut combo: Vec<usize> = (0..len).collect();
        loop {
            out.push(combo.clone());
            if out.len() >= cap {
                return out;
            }
            if !advance(&mut combo, n) {
                break;
            }
        }
    }
    out
}

/// Andrew monotone-chain convex hull.
fn convex_hull(points: &[[f32; 2]]) -> Vec<[f32; 2]> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| {
        a[0].partial_cmp(&b[0])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a[1].partial_cmp(&b[1]).unwrap_or(std::cmp::Ordering::Equal))
    });
    let cross = |o: [f32; 2], a: [f32; 2], b: [f32; 2]| {
        (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
    };
    let mut hull: Vec<[f32; 2]> = Vec::with_capacity(pts.len() * 2);
    for &p in pts.iter().chain(pts.iter().rev().skip(1)) {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pupil::NO_CONFIDENCE;
    use crate::test_utils::draw_filled_ellipse;

    #[test]
    fn tracks_small_shift_between_frames() {
        let frame1 = draw_filled_ellipse(200, 200, 100.0, 100.0, 20.0, 15.0, 0.0, 10, 245);
        let frame2 = draw_filled_ellipse(200, 200, 105.0, 105.0, 20.0, 15.0, 0.0, 10, 245);

        let mut method = PuReST::new();
        method.reset();
        let p1 = method.detect(&frame1);
        assert!(p1.valid(NO_CONFIDENCE), "first frame full search: {:?}", p1);
        assert!((p1.cx - 100.0).abs() < 3.0 && (p1.cy - 100.0).abs() < 3.0);

        let p2 = method.detect(&frame2);
        assert!(p2.valid(NO_CONFIDENCE), "tracked frame: {:?}", p2);
        assert!((p2.cx - 105.0).abs() < 3.0, "cx = {}", p2.cx);
        assert!((p2.cy - 105.0).abs() < 3.0, "cy = {}", p2.cy);
    }

    #[test]
    fn reset_clears_previous_pupil() {
        let frame = draw_filled_ellipse(200, 200, 100.0, 100.0, 20.0, 15.0, 0.0, 10, 245);
        let mut method = PuReST::new();
        method.detect(&frame);
        assert!(method.previous_pupil.is_some());
        method.reset();
        assert!(method.previous_pupil.is_none());
    }

    #[test]
    fn lost_pupil_degrades_to_full_search() {
        let frame1 = draw_filled_ellipse(200, 200, 100.0, 100.0, 20.0, 15.0, 0.0, 10, 245);
        // Pupil jumps across the frame, far outside the tracking band.
        let frame2 = draw_filled_ellipse(200, 200, 40.0, 160.0, 20.0, 15.0, 0.0, 10, 245);
        let mut method = PuReST::new();
        method.detect(&frame1);
        let p = method.detect(&frame2);
        assert!(p.valid(NO_CONFIDENCE), "{:?}", p);
        assert!((p.cx - 40.0).abs() < 4.0 && (p.cy - 160.0).abs() < 4.0);
    }

    #[test]
    fn convex_hull_of_square_with_interior_point() {
        let pts = vec![
            [0.0, 0.0],
            [4.0, 0.0],
            [4.0, 4.0],
            [0.0, 4.0],
            [2.0, 2.0],
        ];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&[2.0, 2.0]));
    }

    #[test]
    fn combinations_are_bounded() {
        let combos = seed_combinations(8, 3, 64);
        assert!(combos.len() <= 64);
        assert!(combos.iter().all(|c| c.len() <= 3));
        // Singles come first.
        assert_eq!(combos[0], vec![0]);
    }
}
