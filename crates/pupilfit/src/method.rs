//! The capability contract every pupil detection method implements.

use image::GrayImage;
use tracing::debug;

use crate::confidence::outline_contrast_confidence;
use crate::imgproc::crop;
use crate::pupil::{Pupil, Roi};

/// An ROI below this area is meaningless for detection and falls back to
/// the full frame.
pub const MIN_ROI_AREA: u64 = 10;

/// Contract shared by all detection algorithms.
///
/// Implementations take `&mut self` because some methods carry tracking
/// state between frames; distinct instances are independent and may run
/// concurrently. A detection call never fails: every internal error path
/// reports a cleared [`Pupil`].
pub trait PupilDetectionMethod {
    /// Stable identifier used for dispatch-by-name. Persisted
    /// configurations reference this string, so it never changes.
    fn title(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Whether `detect` fills in an algorithm-specific confidence.
    fn has_confidence(&self) -> bool {
        false
    }

    /// Whether the method reports a coarse location when no full outline
    /// was found.
    fn has_coarse_location(&self) -> bool {
        false
    }

    /// Whether [`PupilDetectionMethod::inliers`] is populated after a run.
    fn has_inliers(&self) -> bool {
        false
    }

    /// Full-frame detection with no prior.
    fn detect(&mut self, frame: &GrayImage) -> Pupil;

    /// ROI-scoped detection with optional pixel size hints (negative =
    /// unspecified). The result stays in ROI-relative coordinates; the
    /// dispatch layer shifts by the ROI origin. ROIs with area below
    /// [`MIN_ROI_AREA`] fall back to full-frame detection (frame
    /// coordinates, no shift expected).
    fn detect_roi(
        &mut self,
        frame: &GrayImage,
        roi: Roi,
        min_pupil_diameter_px: f32,
        max_pupil_diameter_px: f32,
    ) -> Pupil {
        let _ = (min_pupil_diameter_px, max_pupil_diameter_px);
        let roi = roi.clamped_to(frame.width(), frame.height());
        if roi.area() < MIN_ROI_AREA {
            debug!(title = self.title(), "degenerate ROI, falling back to full frame");
            return self.detect(frame);
        }
        self.detect(&crop(frame, roi.x, roi.y, roi.width, roi.height))
    }

    /// Like [`PupilDetectionMethod::detect_roi`], but additionally sets the
    /// uniform outline-contrast confidence. Evaluated against the same
    /// sub-image the result is expressed in.
    fn detect_with_confidence(
        &mut self,
        frame: &GrayImage,
        roi: Option<Roi>,
        min_pupil_diameter_px: f32,
        max_pupil_diameter_px: f32,
    ) -> Pupil {
        let roi = roi
            .map(|r| r.clamped_to(frame.width(), frame.height()))
            .filter(|r| r.area() >= MIN_ROI_AREA);
        let mut pupil = match roi {
            Some(r) => self.detect_roi(frame, r, min_pupil_diameter_px, max_pupil_diameter_px),
            None => self.detect(frame),
        };
        let scoped;
        let eval = match roi {
            Some(r) => {
                scoped = crop(frame, r.x, r.y, r.width, r.height);
                &scoped
            }
            None => frame,
        };
        pupil.outline_confidence = outline_contrast_confidence(eval, &pupil, 5);
        pupil
    }

    /// Inlier boundary points from the last run, for methods that expose
    /// them (`has_inliers`).
    fn inliers(&self) -> &[[f32; 2]] {
        &[]
    }

    /// Drop any cross-frame tracking state, forcing the next call onto the
    /// full search path.
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::ElSe;
    use crate::test_utils::draw_filled_ellipse;

    #[test]
    fn detect_with_confidence_scores_the_outline() {
        let img = draw_filled_ellipse(200, 200, 100.0, 100.0, 20.0, 15.0, 0.0, 10, 245);
        let mut method = ElSe::default();
        let p = method.detect_with_confidence(&img, None, -1.0, -1.0);
        assert!(p.has_outline());
        assert!(p.outline_confidence > 0.5, "outline = {}", p.outline_confidence);
        // The method itself reports no algorithm confidence.
        assert_eq!(p.confidence, crate::pupil::NO_CONFIDENCE);
    }

    #[test]
    fn detect_with_confidence_stays_roi_relative() {
        let img = draw_filled_ellipse(300, 300, 200.0, 180.0, 20.0, 15.0, 0.0, 10, 245);
        let roi = Roi::new(140, 120, 120, 120);
        let mut method = ElSe::default();
        let p = method.detect_with_confidence(&img, Some(roi), -1.0, -1.0);
        assert!(p.has_outline());
        assert!((p.cx - 60.0).abs() < 3.0, "roi-relative cx = {}", p.cx);
        assert!(p.outline_confidence > 0.5);
    }
}
