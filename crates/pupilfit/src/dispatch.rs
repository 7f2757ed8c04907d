//! Dispatch layer: per-slot detector instances, selection by name, and the
//! uniform post-processing (fault boundary, ROI shift, outline confidence,
//! algorithm tagging) around whichever method is active.

use std::panic::{catch_unwind, AssertUnwindSafe};

use image::GrayImage;
use tracing::{debug, warn};

use crate::confidence::outline_contrast_confidence;
use crate::method::{PupilDetectionMethod, MIN_ROI_AREA};
use crate::methods::{ElSe, ExCuSe, PuRe, PuReST, Starburst, Swirski2D};
use crate::pupil::{Pupil, Roi};

/// Boxed detection method, one per algorithm per slot.
pub type BoxedMethod = Box<dyn PupilDetectionMethod + Send>;

/// Fresh instances of every available algorithm, in registry order.
pub fn method_registry() -> Vec<BoxedMethod> {
    vec![
        Box::new(ElSe::default()),
        Box::new(ExCuSe::default()),
        Box::new(PuRe::default()),
        Box::new(PuReST::new()),
        Box::new(Starburst::default()),
        Box::new(Swirski2D::default()),
    ]
}

/// Selecting an algorithm that no registry entry answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethodError {
    /// The name that failed to resolve.
    pub requested: String,
}

impl std::fmt::Display for UnknownMethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown pupil detection method: {:?}", self.requested)
    }
}

impl std::error::Error for UnknownMethodError {}

/// Detection front-end owning one instance set per concurrently-processed
/// viewpoint. Each slot's instances are private to that slot, so worker
/// tasks can drive different slots without sharing detector state.
pub struct PupilDetection {
    slots: Vec<Vec<BoxedMethod>>,
    active: usize,
    compute_outline_confidence: bool,
}

impl PupilDetection {
    /// Create `num_slots` independent instance sets with every algorithm.
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: (0..num_slots.max(1)).map(|_| method_registry()).collect(),
            active: 0,
            compute_outline_confidence: true,
        }
    }

    /// Number of viewpoint slots.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Title of the currently selected algorithm.
    pub fn active_method(&self) -> &'static str {
        self.slots[0][self.active].title()
    }

    /// Titles of all available algorithms, in registry order.
    pub fn available_methods(&self) -> Vec<&'static str> {
        self.slots[0].iter().map(|m| m.title()).collect()
    }

    /// Enable or disable the uniform outline-confidence computation.
    pub fn set_outline_confidence(&mut self, enabled: bool) {
        self.compute_outline_confidence = enabled;
    }

    /// Select the active algorithm by title. Persisted configurations use
    /// this name, so matching is case-insensitive but otherwise exact.
    pub fn select_method(&mut self, name: &str) -> Result<(), UnknownMethodError> {
        let wanted = name.to_ascii_lowercase();
        match self.slots[0]
            .iter()
            .position(|m| m.title().to_ascii_lowercase() == wanted)
        {
            Some(index) => {
                self.active = index;
                debug!(method = self.slots[0][index].title(), "method selected");
                Ok(())
            }
            None => Err(UnknownMethodError {
                requested: name.to_string(),
            }),
        }
    }

    /// Run the active detector for one slot.
    ///
    /// The optional ROI is clamped to the frame; ROIs below the minimum
    /// area run the full frame instead. The returned pupil is always in
    /// full-frame coordinates, tagged with the algorithm name, and carries
    /// the uniform outline confidence when enabled. Detector panics are
    /// absorbed into a cleared result.
    pub fn detect(
        &mut self,
        slot: usize,
        frame: &GrayImage,
        roi: Option<Roi>,
        min_pupil_diameter_px: f32,
        max_pupil_diameter_px: f32,
    ) -> Pupil {
        let Some(methods) = self.slots.get_mut(slot) else {
            warn!(slot, "detection requested for unknown slot");
            return Pupil::cleared();
        };
        let method = &mut methods[self.active];
        let roi = roi
            .map(|r| r.clamped_to(frame.width(), frame.height()))
            .filter(|r| r.area() >= MIN_ROI_AREA);

        let outcome = catch_unwind(AssertUnwindSafe(|| match roi {
            Some(r) => method.detect_roi(frame, r, min_pupil_diameter_px, max_pupil_diameter_px),
            None => method.detect(frame),
        }));
        let mut pupil = match outcome {
            Ok(p) => p,
            Err(_) => {
                warn!(method = method.title(), "detector panicked; reporting an empty result");
                Pupil::cleared()
            }
        };

        if let Some(r) = roi {
            if pupil.cx > 0.0 && pupil.cy > 0.0 {
                let (tx, ty) = r.top_left();
                pupil.shift(tx as f32, ty as f32);
            }
        }
        if self.compute_outline_confidence {
            pupil.outline_confidence = outline_contrast_confidence(frame, &pupil, 5);
        }
        pupil.algorithm = method.title().to_string();
        pupil
    }

    /// Reset tracking state of every instance in one slot (e.g. after an
    /// ROI change).
    pub fn reset_slot(&mut self, slot: usize) {
        if let Some(methods) = self.slots.get_mut(slot) {
            for method in methods {
                method.reset();
            }
        }
    }

    /// Mutable access to one slot's instance of the active method, for
    /// parameter configuration.
    pub fn active_method_mut(&mut self, slot: usize) -> Option<&mut BoxedMethod> {
        let active = self.active;
        self.slots.get_mut(slot).map(|m| &mut m[active])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pupil::NO_CONFIDENCE;
    use crate::test_utils::draw_filled_ellipse;

    #[test]
    fn selection_is_case_insensitive() {
        let mut detection = PupilDetection::new(1);
        detection.select_method("else").unwrap();
        assert_eq!(detection.active_method(), "ElSe");
        detection.select_method("PURest").unwrap();
        assert_eq!(detection.active_method(), "PuReST");
        let err = detection.select_method("nonexistent").unwrap_err();
        assert_eq!(err.requested, "nonexistent");
    }

    #[test]
    fn registry_exposes_all_titles() {
        let detection = PupilDetection::new(2);
        assert_eq!(
            detection.available_methods(),
            vec!["ElSe", "ExCuSe", "PuRe", "PuReST", "Starburst", "Swirski2D"]
        );
        assert_eq!(detection.num_slots(), 2);
    }

    #[test]
    fn result_is_tagged_and_frame_relative() {
        let img = draw_filled_ellipse(300, 300, 200.0, 180.0, 20.0, 15.0, 0.0, 10, 245);
        let mut detection = PupilDetection::new(1);
        detection.select_method("ElSe").unwrap();

        let roi = Roi::new(140, 120, 120, 120);
        let p = detection.detect(0, &img, Some(roi), -1.0, -1.0);
        assert!(p.valid(NO_CONFIDENCE), "{:?}", p);
        assert_eq!(p.algorithm, "ElSe");
        assert!((p.cx - 200.0).abs() < 3.0, "frame-relative cx = {}", p.cx);
        assert!((p.cy - 180.0).abs() < 3.0, "frame-relative cy = {}", p.cy);
        assert!(p.outline_confidence > 0.5, "outline = {}", p.outline_confidence);
    }

    #[test]
    fn unknown_slot_reports_cleared_pupil() {
        let img = draw_filled_ellipse(100, 100, 50.0, 50.0, 15.0, 12.0, 0.0, 10, 245);
        let mut detection = PupilDetection::new(1);
        let p = detection.detect(3, &img, None, -1.0, -1.0);
        assert!(!p.valid(NO_CONFIDENCE));
    }

    #[test]
    fn slots_do_not_share_tracking_state() {
        let frame_a = draw_filled_ellipse(200, 200, 100.0, 100.0, 20.0, 15.0, 0.0, 10, 245);
        let frame_b = draw_filled_ellipse(200, 200, 60.0, 140.0, 20.0, 15.0, 0.0, 10, 245);
        let mut detection = PupilDetection::new(2);
        detection.select_method("PuReST").unwrap();

        let pa = detection.detect(0, &frame_a, None, -1.0, -1.0);
        let pb = detection.detect(1, &frame_b, None, -1.0, -1.0);
        assert!((pa.cx - 100.0).abs() < 3.0);
        assert!((pb.cx - 60.0).abs() < 3.0, "slot 1 must track its own frame");
    }
}
