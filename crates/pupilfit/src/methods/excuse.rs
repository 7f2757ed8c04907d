//! ExCuSe: curve selection when a bright reflection dominates the image,
//! otherwise an angular-projection threshold search refined by ray-cast
//! curve pooling.

use image::GrayImage;
use tracing::debug;

use crate::conic::{fit_ellipse_lsq, Ellipse};
use crate::edges::{gaussian_deriv_edges, thin_edges_low_angle, trace_curves, Bounds, Curve};
use crate::imgproc::{crop, downscale_to, normalize_minmax, region_mean};
use crate::method::{PupilDetectionMethod, MIN_ROI_AREA};
use crate::pupil::{Pupil, Roi};

const WORKING_SIZE: u32 = 640;
const BORDER: f32 = 0.1;
const PEEK_DETECTOR_FACTOR: u32 = 10;
const BRIGHT_REGION_TH: usize = 199;
const MEAN_DIST: i32 = 3;
const INNER_COLOR_RANGE: i32 = 5;
const TH_HISTO: f32 = 0.5;
const MAX_REGION_HOLE: i32 = 5;
const MIN_REGION_SIZE: i32 = 7;
const AREA_OPT: f32 = 0.1;
const AREA_EDGES: f32 = 0.2;
const EDGE_TO_TH: i32 = 5;

/// Edge-curve and angular-histogram pupil detector.
#[derive(Debug, Clone)]
pub struct ExCuSe {
    /// Largest radius probed when growing a sizeless candidate, px.
    pub max_ellipse_radi: i32,
    /// Required interior-vs-surround contrast margin, gray levels.
    pub good_ellipse_threshold: f32,
}

impl Default for ExCuSe {
    fn default() -> Self {
        Self {
            max_ellipse_radi: 50,
            good_ellipse_threshold: 15.0,
        }
    }
}

impl PupilDetectionMethod for ExCuSe {
    fn title(&self) -> &'static str {
        "ExCuSe"
    }

    fn description(&self) -> &'static str {
        "ExCuSe (Fuhl et al. 2015)"
    }

    fn detect(&mut self, frame: &GrayImage) -> Pupil {
        let (downscaled, ratio) = downscale_to(frame, WORKING_SIZE);
        let pic = normalize_minmax(&downscaled);
        let (w, h) = (pic.width() as usize, pic.height() as usize);
        if w < 32 || h < 32 {
            return Pupil::cleared();
        }

        let mut pupil = match run_excuse(&pic, self.good_ellipse_threshold, self.max_ellipse_radi)
        {
            Some(e) => Pupil::from_outline(
                e.cx as f32,
                e.cy as f32,
                (2.0 * e.a) as f32,
                (2.0 * e.b) as f32,
                e.angle as f32,
            ),
            None => Pupil::cleared(),
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
        _min_pupil_diameter_px: f32,
        _max_pupil_diameter_px: f32,
    ) -> Pupil {
        let roi = roi.clamped_to(frame.width(), frame.height());
        if roi.area() < MIN_ROI_AREA {
            debug!("degenerate ROI, falling back to full frame");
            return self.detect(frame);
        }
        self.detect(&crop(frame, roi.x, roi.y, roi.width, roi.height))
    }
}

fn run_excuse(pic: &GrayImage, good_threshold: f32, max_radi: i32) -> Option<Ellipse> {
    let (w, h) = (pic.width() as usize, pic.height() as usize);
    let bounds = Bounds {
        start_x: (w as f32 * BORDER).floor() as i32,
        end_x: w as i32 - (w as f32 * BORDER).floor() as i32,
        start_y: (h as f32 * BORDER).floor() as i32,
        end_y: h as i32 - (h as f32 * BORDER).floor() as i32,
    };

    let (mut peek_found, stddev) = peek(pic, bounds);
    let threshold_up = ((stddev / 2.0).ceil() as i32 - 1).max(0);

    // Edges are computed on the interior window and pasted back so that
    // all downstream coordinates stay in image space.
    let window = crop(
        pic,
        bounds.start_x as u32,
        bounds.start_y as u32,
        (bounds.end_x - bounds.start_x) as u32,
        (bounds.end_y - bounds.start_y) as u32,
    );
    let window_edges = gaussian_deriv_edges(&window);
    let mut edge = vec![0u8; w * h];
    let ww = window.width() as usize;
    for (idx, &v) in window_edges.iter().enumerate() {
        let x = idx % ww + bounds.start_x as usize;
        let y = idx / ww + bounds.start_y as usize;
        edge[y * w + x] = v;
    }
    thin_edges_low_angle(&mut edge, w, h, bounds);

    let mut edges_only_tried = false;
    let mut candidate: Option<Ellipse> = None;
    let mut coarse: Option<[i32; 2]> = None;

    if peek_found {
        debug!("bright reflection present, trying edge curves first");
        edges_only_tried = true;
        candidate = find_best_curve(pic, &edge, w, h, bounds);
        if candidate.is_none() {
            peek_found = false;
        }
    }

    if !peek_found {
        let pos = angular_histogram_position(pic, bounds, threshold_up);
        if pos == [0, 0] && !edges_only_tried {
            candidate = find_best_curve(pic, &edge, w, h, bounds);
            peek_found = true;
        } else {
            coarse = Some(pos);
        }
    }

    if let Some(mut pos) = coarse {
        if pos[0] > 0 && pos[1] > 0 && (pos[0] as usize) < w && (pos[1] as usize) < h && !peek_found
        {
            optimize_position(pic, AREA_OPT, &mut pos);
            candidate = refit_from_thresholded_edges(pic, &edge, threshold_up, pos).or(Some(
                Ellipse {
                    cx: pos[0] as f64,
                    cy: pos[1] as f64,
                    a: 0.0,
                    b: 0.0,
                    angle: 0.0,
                },
            ));
        }
    }

    let mut ellipse = candidate?;
    if ellipse.a <= 0.0 || ellipse.b <= 0.0 {
        let radius = grow_region(pic, [ellipse.cx as i32, ellipse.cy as i32], max_radi);
        ellipse.a = radius as f64 / 2.0;
        ellipse.b = radius as f64 / 2.0;
    }
    is_good_ellipse(pic, &ellipse, good_threshold).then_some(ellipse)
}

/// Histogram spike detector for bright reflections; also reports the mean
/// columnwise standard deviation used as the dark threshold scale.
fn peek(pic: &GrayImage, b: Bounds) -> (bool, f32) {
    let w = pic.width() as i32;
    let raw = pic.as_raw();
    let cols = (b.end_x - b.start_x).max(1);
    let rows = (b.end_y - b.start_y).max(1);

    let mut gray_hist = [0u32; 256];
    let mut col_mean = vec![0.0f64; cols as usize];
    for (ci, i) in (b.start_x..b.end_x).enumerate() {
        for j in b.start_y..b.end_y {
            let v = raw[(w * j + i) as usize];
            gray_hist[v as usize] += 1;
            col_mean[ci] += v as f64;
        }
    }
    for m in &mut col_mean {
        *m /= rows as f64;
    }

    let mut stddev = 0.0f64;
    for (ci, i) in (b.start_x..b.end_x).enumerate() {
        let mut acc = 0.0f64;
        for j in b.start_y..b.end_y {
            let v = raw[(w * j + i) as usize] as f64;
            acc += (col_mean[ci] - v) * (col_mean[ci] - v);
        }
        stddev += (acc / rows as f64).sqrt();
    }
    stddev /= cols as f64;

    let mut max_count = 0u32;
    let mut max_pos = 0usize;
    let mut total = 0u64;
    let mut occupied = 0u64;
    for (i, &count) in gray_hist.iter().enumerate() {
        if count == 0 {
            continue;
        }
        total += count as u64;
        occupied += 1;
        if count > max_count {
            max_count = count;
            max_pos = i;
        }
    }
    let mean_count = (total as f64 / occupied.max(1) as f64).ceil() as u32;
    let peeked = max_count > mean_count * PEEK_DETECTOR_FACTOR && max_pos > BRIGHT_REGION_TH;
    (peeked, stddev as f32)
}

/// Single-winner curve selection: darkest interior within a ±gray-level
/// band, longer curve breaking ties; exactly one survivor is required.
fn find_best_curve(
    pic: &GrayImage,
    edge: &[u8],
    w: usize,
    h: usize,
    bounds: Bounds,
) -> Option<Ellipse> {
    let curves = trace_curves(edge, w, h, bounds, 1);
    let mut best: Option<(Curve, i32)> = None;

    for curve in curves {
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
            || ellipse.aspect_ratio() > 2.0
        {
            continue;
        }

        let inner = inner_gray_toward_mean(pic, &curve);
        let replace = match &best {
            None => true,
            Some((best_curve, best_inner)) => {
                *best_inner > inner + INNER_COLOR_RANGE
                    || ((inner - *best_inner).abs() <= INNER_COLOR_RANGE
                        && curve.points.len() > best_curve.points.len())
            }
        };
        if replace {
            best = Some((curve, inner));
        }
    }

    let (curve, _) = best?;
    let pts: Vec<[f64; 2]> = curve
        .points
        .iter()
        .map(|&[x, y]| [x as f64, y as f64])
        .collect();
    let ellipse = fit_ellipse_lsq(&pts)?;
    (ellipse.cx >= 0.0 && ellipse.cy >= 0.0 && ellipse.cx <= w as f64 && ellipse.cy <= h as f64)
        .then_some(ellipse)
}

/// Mean intensity two pixels inward (toward the curve mean) of every curve
/// point.
fn inner_gray_toward_mean(pic: &GrayImage, curve: &Curve) -> i32 {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();
    let mut sum = 0i64;
    for &[x, y] in &curve.points {
        let dx = (curve.mean[0] - x) as f32;
        let dy = (curve.mean[1] - y) as f32;
        let norm = (dx * dx + dy * dy).sqrt().max(1e-3);
        let sx = (x as f32 + 2.0 * dx / norm).round() as i32;
        let sy = (y as f32 + 2.0 * dy / norm).round() as i32;
        if sx >= 0 && sx < w && sy >= 0 && sy < h {
            sum += raw[(w * sy + sx) as usize] as i64;
        }
    }
    ((sum as f64 / curve.points.len() as f64) + 0.5).floor() as i32
}

/// Intersect four angular projection histograms of below-threshold pixels
/// (rows, columns, both diagonals) into a position estimate.
fn angular_histogram_position(pic: &GrayImage, b: Bounds, th: i32) -> [i32; 2] {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();
    let diag_len = (w + h) as usize + 2;

    let mut hist_l = vec![0i32; h as usize];
    let mut hist_b = vec![0i32; w as usize];
    let mut hist_lb = vec![0i32; diag_len];
    let mut hist_br = vec![0i32; diag_len];

    for i in b.start_x.max(0)..b.end_x.min(w) {
        for j in b.start_y.max(0)..b.end_y.min(h) {
            if (raw[(w * j + i) as usize] as i32) < th {
                hist_l[j as usize] += 1;
                hist_b[i as usize] += 1;
                hist_lb[(i + j) as usize] += 1;
                hist_br[(i + (h - j)) as usize] += 1;
            }
        }
    }

    let floor_of = |hist: &[i32]| {
        let max = hist.iter().copied().max().unwrap_or(0);
        max - (max as f32 * TH_HISTO).floor() as i32
    };
    let pos_l = region_scan(&hist_l, floor_of(&hist_l), h);
    let pos_b = region_scan(&hist_b, floor_of(&hist_b), w);
    let pos_lb = region_scan(&hist_lb, floor_of(&hist_lb), w + h);
    let pos_br = region_scan(&hist_br, floor_of(&hist_br), w + h);

    let mut pos = [0i32; 2];
    if pos_l > 0 && pos_lb > 0 && pos_b > 0 && pos_br > 0 {
        let diag = ((((pos_br + h) - pos_lb) as f32 / 2.0) + 0.5).floor() as i32;
        pos[0] = (((pos_b + (diag + pos_lb - h)) as f32 / 2.0) + 0.5).floor() as i32;
        pos[1] = (((pos_l + (h - diag)) as f32 / 2.0) + 0.5).floor() as i32;
    } else if pos_l > 0 && pos_b > 0 {
        pos = [pos_b, pos_l];
    } else if pos_lb > 0 && pos_br > 0 {
        let diag = ((((pos_br + h) - pos_lb) as f32 / 2.0) + 0.5).floor() as i32;
        pos = [diag + pos_lb - h, h - diag];
    }

    if pos[0] < 0 || pos[0] >= w || pos[1] < 0 || pos[1] >= h {
        return [0, 0];
    }
    pos
}

/// Scan a projection histogram for above-floor regions (holes tolerated up
/// to [`MAX_REGION_HOLE`]); among regions of at least [`MIN_REGION_SIZE`]
/// bins, keep the one closest to the histogram midpoint.
fn region_scan(hist: &[i32], floor: i32, real_size: i32) -> i32 {
    let mut pos = 0i32;
    let mut mean_pos = 0i32;
    let mut pos_hole = 0i32;
    let mut count = 0i32;
    let mut hole = 0i32;
    let mut in_region = false;
    let center = real_size / 2;

    for (i, &v) in hist.iter().enumerate() {
        let i = i as i32;
        if v > floor && !in_region {
            in_region = true;
            count = 1;
            mean_pos = i;
        } else if v > floor && in_region {
            count += 1 + hole;
            mean_pos += i + pos_hole;
            hole = 0;
            pos_hole = 0;
        } else if v <= floor && in_region && hole < MAX_REGION_HOLE {
            hole += 1;
            pos_hole += i;
        } else if v <= floor && in_region {
            if count >= MIN_REGION_SIZE {
                let mean = mean_pos / count.max(1);
                if (center - mean).pow(2) < (center - pos).pow(2) {
                    pos = mean;
                }
            }
            in_region = false;
            count = 0;
            mean_pos = 0;
            hole = 0;
            pos_hole = 0;
        }
    }
    pos
}

/// Shift a coarse position to the centroid of the locally darkest windows.
fn optimize_position(pic: &GrayImage, area: f32, pos: &mut [i32; 2]) {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();

    let half_w = (area * w as f32) as i32;
    let half_h = (area * h as f32) as i32;
    let reg_size = (((half_w * 2).pow(2) as f32 + (half_h * 2).pow(2) as f32).sqrt().sqrt()) as i32;

    let start_x = (pos[0] - half_w).max(reg_size);
    let end_x = (pos[0] + half_w).min(w - reg_size - 1);
    let start_y = (pos[1] - half_h).max(reg_size);
    let end_y = (pos[1] + half_h).min(h - reg_size - 1);

    let mut min_val = i64::MAX;
    let (mut sum_x, mut sum_y, mut n) = (0i64, 0i64, 0i64);
    for i in start_x..end_x {
        for j in start_y..end_y {
            let center = raw[(w * j + i) as usize] as i64;
            let mut excess = 0i64;
            for k1 in -reg_size..reg_size {
                for k2 in -reg_size..reg_size {
                    let (x, y) = (i + k1, j + k2);
                    if x > 0 && x < w && y > 0 && y < h {
                        let d = center - raw[(w * y + x) as usize] as i64;
                        if d > 0 {
                            excess += d;
                        }
                    }
                }
            }
            if excess < min_val {
                min_val = excess;
                sum_x = i as i64;
                sum_y = j as i64;
                n = 1;
            } else if excess == min_val {
                sum_x += i as i64;
                sum_y += j as i64;
                n += 1;
            }
        }
    }
    if n > 0 {
        pos[0] = (sum_x / n) as i32;
        pos[1] = (sum_y / n) as i32;
    }
}

/// Collect edge curves adjacent to below-threshold pixels around `pos`,
/// shoot eight axis/diagonal rays to pick the curves bounding the dark
/// region, and fit an ellipse to their pooled points.
fn refit_from_thresholded_edges(
    pic: &GrayImage,
    edge: &[u8],
    th: i32,
    pos: [i32; 2],
) -> Option<Ellipse> {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();

    let mut start_x = pos[0] - (AREA_EDGES * w as f32) as i32;
    let mut end_x = pos[0] + (AREA_EDGES * w as f32) as i32;
    let mut start_y = pos[1] - (AREA_EDGES * h as f32) as i32;
    let mut end_y = pos[1] + (AREA_EDGES * h as f32) as i32;
    if start_x < 0 {
        start_x = EDGE_TO_TH;
    }
    if start_y < 0 {
        start_y = EDGE_TO_TH;
    }
    if end_x > w {
        end_x = w - (EDGE_TO_TH + 1);
    }
    if end_y > h {
        end_y = h - (EDGE_TO_TH + 1);
    }

    let dark_th = th + th + 1;
    let mut th_edges = vec![0u8; (w * h) as usize];
    for i in start_x..end_x {
        for j in start_y..end_y {
            if (raw[(w * j + i) as usize] as i32) >= dark_th {
                continue;
            }
            for k1 in -EDGE_TO_TH..EDGE_TO_TH {
                for k2 in -EDGE_TO_TH..EDGE_TO_TH {
                    let (x, y) = (i + k1, j + k2);
                    if x >= 0 && x < w && y > 0 && y < h && edge[(w * y + x) as usize] != 0 {
                        th_edges[(w * y + x) as usize] = 255;
                    }
                }
            }
        }
    }

    let bounds = Bounds {
        start_x,
        end_x,
        start_y,
        end_y,
    };
    let curves = collect_open_curves(pic, &th_edges, w as usize, h as usize, bounds);
    if curves.is_empty() {
        return None;
    }

    // Re-draw curves as labels and let rays from the position pick which
    // ones bound the dark region.
    let mut labels = vec![0u16; (w * h) as usize];
    for (li, curve) in curves.iter().enumerate() {
        for &[x, y] in &curve.points {
            if x >= 0 && x < w && y >= 0 && y < h {
                labels[(w * y + x) as usize] = li as u16 + 1;
            }
        }
    }

    let reach_x = (end_x - start_x) / 2;
    let reach_y = (end_y - start_y) / 2;
    let dirs: [(i32, i32, i32); 8] = [
        (1, 0, reach_x),
        (-1, 0, reach_x),
        (0, 1, reach_y),
        (0, -1, reach_y),
        (1, 1, reach_x.min(reach_y)),
        (-1, -1, reach_x.min(reach_y)),
        (1, -1, reach_x.min(reach_y)),
        (-1, 1, reach_x.min(reach_y)),
    ];
    let mut selected = std::collections::BTreeSet::new();
    for &(dx, dy, reach) in &dirs {
        for t in 0..reach {
            let (x, y) = (pos[0] + dx * t, pos[1] + dy * t);
            if x <= 0 || y <= 0 || x >= w || y >= h {
                break;
            }
            let label = labels[(w * y + x) as usize];
            if label != 0 {
                selected.insert(label - 1);
                break;
            }
        }
    }

    let mut points: Vec<[f64; 2]> = Vec::new();
    for label in selected {
        for &[x, y] in &curves[label as usize].points {
            points.push([x as f64, y as f64]);
        }
    }
    if points.len() <= 5 {
        return None;
    }
    fit_ellipse_lsq(&points)
}

/// Curve collection without the single-winner selection: every curve that
/// passes the centroid and aspect gates is kept.
fn collect_open_curves(
    pic: &GrayImage,
    edge: &[u8],
    w: usize,
    h: usize,
    bounds: Bounds,
) -> Vec<Curve> {
    trace_curves(edge, w, h, bounds, 1)
        .into_iter()
        .filter(|curve| {
            if curve.points.iter().any(|&[x, y]| {
                (curve.mean[0] - x).abs() <= MEAN_DIST && (curve.mean[1] - y).abs() <= MEAN_DIST
            }) {
                return false;
            }
            let pts: Vec<[f64; 2]> = curve
                .points
                .iter()
                .map(|&[x, y]| [x as f64, y as f64])
                .collect();
            match fit_ellipse_lsq(&pts) {
                Some(e) => {
                    e.cx >= 0.0
                        && e.cy >= 0.0
                        && e.cx <= pic.width() as f64
                        && e.cy <= pic.height() as f64
                        && e.aspect_ratio() <= 2.0
                }
                None => false,
            }
        })
        .collect()
}

/// Probe outward in an expanding square until the fraction of pixels close
/// to the seed intensity drops, giving a size estimate for sizeless
/// candidates.
fn grow_region(pic: &GrayImage, pos: [i32; 2], max_radius: i32) -> i32 {
    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();
    let (x0, y0) = (pos[0], pos[1]);

    let Some(mean) = region_mean(pic, x0 - 2, x0 + 3, y0 - 2, y0 + 3) else {
        return 0;
    };
    let center = if x0 > 0 && x0 < w && y0 > 0 && y0 < h {
        raw[(w * y0 + x0) as usize] as f32
    } else {
        return 0;
    };
    let diff = (mean - center).abs();
    let th_up = (mean + diff).ceil() + 1.0;
    let th_down = (mean - diff).floor() - 1.0;

    let mut radius = 0;
    for i in 1..max_radius.max(2) {
        radius = i;
        let (mut left, mut right, mut top, mut bottom) = (0, 0, 0, 0);
        for j in -i..=(1 + i * 2) {
            let in_band = |x: i32, y: i32| {
                x > 0 && x < w && y > 0 && y < h && {
                    let v = raw[(w * y + x) as usize] as f32;
                    v > th_down && v < th_up
                }
            };
            if in_band(x0 + i, y0 + j) {
                left += 1;
            }
            if in_band(x0 - i, y0 + j) {
                right += 1;
            }
            if in_band(x0 + j, y0 - i) {
                top += 1;
            }
            if in_band(x0 + j, y0 + i) {
                bottom += 1;
            }
        }
        let side = (1 + 2 * i) as f32;
        let (pl, pr, pt, pb) = (
            left as f32 / side,
            right as f32 / side,
            top as f32 / side,
            bottom as f32 / side,
        );
        if (pt < 0.2 && pb < 0.2) || (pl < 0.2 && pr < 0.2) {
            break;
        }
    }
    radius
}

/// Interior-vs-surround contrast acceptance gate.
fn is_good_ellipse(pic: &GrayImage, ellipse: &Ellipse, threshold: f32) -> bool {
    if ellipse.cx == 0.0 && ellipse.cy == 0.0 {
        return false;
    }
    if ellipse.a <= 0.0 || ellipse.b <= 0.0 {
        return false;
    }
    let (x0, y0) = (ellipse.cx as f32, ellipse.cy as f32);
    let (width, height) = ((2.0 * ellipse.a) as f32, (2.0 * ellipse.b) as f32);

    let inner = region_mean(
        pic,
        (x0 - width / 4.0) as i32,
        (x0 + width / 4.0) as i32,
        (y0 - height / 4.0) as i32,
        (y0 + height / 4.0) as i32,
    );
    let Some(inner) = inner else { return false };

    let (w, h) = (pic.width() as i32, pic.height() as i32);
    let raw = pic.as_raw();
    let (st_x, st_y) = (
        (x0 - width * 0.75).ceil() as i32,
        (y0 - height * 0.75).ceil() as i32,
    );
    let (en_x, en_y) = (
        (x0 + width * 0.75).floor() as i32,
        (y0 + height * 0.75).floor() as i32,
    );
    let (in_st_x, in_st_y) = ((x0 - width / 2.0) as i32, (y0 - height / 2.0) as i32);
    let (in_en_x, in_en_y) = ((x0 + width / 2.0) as i32, (y0 + height / 2.0) as i32);

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
    if count == 0 {
        return false;
    }
    (sum / count as f64) as f32 - inner > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::draw_filled_ellipse;

    #[test]
    fn detects_pupil_via_angular_path() {
        let img = draw_filled_ellipse(200, 200, 100.0, 100.0, 20.0, 15.0, 0.0, 10, 200);
        let mut method = ExCuSe::default();
        let p = method.detect(&img);
        assert!(p.valid(crate::pupil::NO_CONFIDENCE) || p.has_outline(), "{:?}", p);
        assert!((p.cx - 100.0).abs() < 6.0, "cx = {}", p.cx);
        assert!((p.cy - 100.0).abs() < 6.0, "cy = {}", p.cy);
    }

    #[test]
    fn blank_frame_yields_invalid_pupil() {
        let img = GrayImage::from_pixel(120, 120, image::Luma([255]));
        let mut method = ExCuSe::default();
        assert!(!method.detect(&img).valid(crate::pupil::NO_CONFIDENCE));
    }

    #[test]
    fn region_scan_prefers_central_region() {
        let mut hist = vec![0i32; 100];
        for v in hist.iter_mut().take(20).skip(10) {
            *v = 10;
        }
        for v in hist.iter_mut().take(60).skip(45) {
            *v = 10;
        }
        let pos = region_scan(&hist, 5, 100);
        assert!((45..60).contains(&pos), "central region expected, got {}", pos);
    }

    #[test]
    fn grow_region_estimates_disk_radius() {
        let img = draw_filled_ellipse(120, 120, 60.0, 60.0, 18.0, 18.0, 0.0, 10, 230);
        let r = grow_region(&img, [60, 60], 50);
        assert!((15..=22).contains(&r), "radius estimate {}", r);
    }

    #[test]
    fn peek_fires_only_with_bright_spike() {
        // Textured background spreads the histogram over many bins; the
        // spike detector compares the dominant bin against the mean count
        // per occupied bin.
        let mut img = GrayImage::new(200, 200);
        for y in 0..200u32 {
            for x in 0..200u32 {
                let v = 100 + ((x * 7 + y * 13) % 40) as u8;
                img.put_pixel(x, y, image::Luma([v]));
            }
        }
        let bounds = Bounds {
            start_x: 20,
            end_x: 180,
            start_y: 20,
            end_y: 180,
        };
        let (found, _) = peek(&img, bounds);
        assert!(!found, "no reflection, peek must not fire");

        // A large saturated blob dominates the histogram.
        crate::test_utils::stamp_bright_disk(&mut img, 60.0, 60.0, 50.0, 255);
        let (found, _) = peek(&img, bounds);
        assert!(found, "saturated blob should fire the peek detector");
    }
}
