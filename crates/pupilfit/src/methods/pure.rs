//! PuRe: full-frame pupil search parameterized in physical units, so size
//! gates track the acquisition resolution.

use image::GrayImage;
use tracing::debug;

use crate::confidence::{angular_spread_confidence, aspect_ratio_confidence, outline_contrast_confidence};
use crate::conic::fit_ellipse_lsq;
use crate::edges::{gaussian_deriv_edges, thin_edges_low_angle, trace_curves, Bounds};
use crate::imgproc::{crop, downscale_to, normalize_minmax};
use crate::method::{PupilDetectionMethod, MIN_ROI_AREA};
use crate::pupil::{Pupil, Roi};

const MIN_CURVE_LEN: usize = 10;
const MAX_ASPECT: f64 = 3.0;

/// Physical-unit edge-curve detector; candidates are scored by a combined
/// outline/spread/roundness confidence.
#[derive(Debug, Clone)]
pub struct PuRe {
    /// Working-image size cap in pixels; larger frames are downscaled.
    pub base_size: u32,
    /// Mean human inter-canthi distance, mm; anchors the mm→px ratio.
    pub mean_canthi_distance_mm: f32,
    /// Smallest plausible pupil diameter, mm.
    pub min_pupil_diameter_mm: f32,
    /// Largest plausible pupil diameter, mm.
    pub max_pupil_diameter_mm: f32,
    /// Pixel diameter window (input scale) overriding the mm bounds.
    diameter_override: Option<(f32, f32)>,
}

impl Default for PuRe {
    fn default() -> Self {
        Self {
            base_size: 320,
            mean_canthi_distance_mm: 27.6,
            min_pupil_diameter_mm: 2.0,
            max_pupil_diameter_mm: 8.0,
            diameter_override: None,
        }
    }
}

impl PuRe {
    /// Pixel diameter bounds in working-image scale.
    fn diameter_bounds(&self, working_width: u32, ratio: f32) -> (f32, f32) {
        if let Some((lo, hi)) = self.diameter_override {
            return (lo * ratio, hi * ratio);
        }
        let px_per_mm = working_width as f32 / self.mean_canthi_distance_mm;
        (
            self.min_pupil_diameter_mm * px_per_mm,
            self.max_pupil_diameter_mm * px_per_mm,
        )
    }

    pub(crate) fn detect_with_hints(
        &mut self,
        frame: &GrayImage,
        min_diameter_px: f32,
        max_diameter_px: f32,
    ) -> Pupil {
        self.diameter_override =
            (min_diameter_px > 0.0 && max_diameter_px > 0.0).then_some((min_diameter_px, max_diameter_px));
        let pupil = self.detect(frame);
        self.diameter_override = None;
        pupil
    }
}

impl PupilDetectionMethod for PuRe {
    fn title(&self) -> &'static str {
        "PuRe"
    }

    fn description(&self) -> &'static str {
        "PuRe (Santini et al. 2018)"
    }

    fn has_confidence(&self) -> bool {
        true
    }

    fn detect(&mut self, frame: &GrayImage) -> Pupil {
        let (work, ratio) = downscale_to(frame, self.base_size);
        let pic = normalize_minmax(&work);
        let (w, h) = (pic.width() as usize, pic.height() as usize);
        if w < 32 || h < 32 {
            return Pupil::cleared();
        }
        let (min_d, max_d) = self.diameter_bounds(pic.width(), ratio);

        let bounds = Bounds::full(w, h);
        let mut edge = gaussian_deriv_edges(&pic);
        thin_edges_low_angle(&mut edge, w, h, bounds);
        let curves = trace_curves(&edge, w, h, bounds, MIN_CURVE_LEN);

        let mut best: Option<(Pupil, f32)> = None;
        for curve in &curves {
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
                || ellipse.aspect_ratio() > MAX_ASPECT
            {
                continue;
            }
            let diameter = (2.0 * ellipse.a) as f32;
            if diameter < min_d || diameter > max_d {
                continue;
            }

            let mut candidate = Pupil::from_outline(
                ellipse.cx as f32,
                ellipse.cy as f32,
                (2.0 * ellipse.a) as f32,
                (2.0 * ellipse.b) as f32,
                ellipse.angle as f32,
            );
            let curve_pts: Vec<[f32; 2]> = curve
                .points
                .iter()
                .map(|&[x, y]| [x as f32, y as f32])
                .collect();
            let confidence = (outline_contrast_confidence(&pic, &candidate, 5)
                + angular_spread_confidence(&curve_pts, [candidate.cx, candidate.cy])
                + aspect_ratio_confidence(&candidate))
                / 3.0;
            candidate.confidence = confidence;

            if best.as_ref().map_or(true, |(_, c)| confidence > *c) {
                best = Some((candidate, confidence));
            }
        }

        match best {
            Some((mut pupil, _)) => {
                pupil.rescale(1.0 / ratio);
                pupil
            }
            None => {
                debug!("no pupil candidate within physical size bounds");
                Pupil::cleared()
            }
        }
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
        self.detect_with_hints(&cropped, min_pupil_diameter_px, max_pupil_diameter_px)
    }
}
