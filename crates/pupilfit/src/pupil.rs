//! Pupil result type and region-of-interest rectangle.

use serde::{Deserialize, Serialize};

/// Sentinel for "no confidence reported".
pub const NO_CONFIDENCE: f32 = -1.0;

/// A detected pupil: rotated ellipse plus detection metadata.
///
/// Geometry is expressed in the coordinate space of whatever image was
/// handed to the detector. ROI-relative results are shifted into
/// full-frame coordinates by the dispatch layer, not by detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pupil {
    /// Center x in pixels.
    pub cx: f32,
    /// Center y in pixels.
    pub cy: f32,
    /// Full axis length along the ellipse x direction, in pixels.
    pub width: f32,
    /// Full axis length along the ellipse y direction, in pixels.
    pub height: f32,
    /// Rotation of the ellipse in radians.
    pub angle: f32,
    /// Algorithm-reported quality in [0, 1], or [`NO_CONFIDENCE`].
    pub confidence: f32,
    /// Boundary-contrast quality in [0, 1], or [`NO_CONFIDENCE`].
    ///
    /// Computed uniformly across algorithms by the dispatch layer.
    pub outline_confidence: f32,
    /// Eyelid measurement filled in by downstream stages; zero here.
    pub eyelid: f32,
    /// Physical diameter (mm) filled in by calibration stages; −1 here.
    pub physical_diameter: f32,
    /// Lens-undistorted diameter filled in by calibration stages; −1 here.
    pub undistorted_diameter: f32,
    /// Title of the algorithm that produced this result (tagged by the
    /// dispatch layer; empty until then).
    pub algorithm: String,
}

impl Pupil {
    /// A pupil in the cleared "nothing found" state.
    pub fn cleared() -> Self {
        Self {
            cx: -1.0,
            cy: -1.0,
            width: -1.0,
            height: -1.0,
            angle: -1.0,
            confidence: NO_CONFIDENCE,
            outline_confidence: NO_CONFIDENCE,
            eyelid: 0.0,
            physical_diameter: -1.0,
            undistorted_diameter: -1.0,
            algorithm: String::new(),
        }
    }

    /// Construct from outline geometry with an explicit confidence.
    pub fn from_outline(cx: f32, cy: f32, width: f32, height: f32, angle: f32) -> Self {
        Self {
            cx,
            cy,
            width,
            height,
            angle,
            ..Self::cleared()
        }
    }

    /// Reset to the cleared state, dropping all measurements.
    pub fn clear(&mut self) {
        *self = Self::cleared();
    }

    /// A pupil is valid iff its center and size are strictly positive and
    /// at least one confidence exceeds `threshold`.
    pub fn valid(&self, threshold: f32) -> bool {
        self.cx > 0.0
            && self.cy > 0.0
            && self.width > 0.0
            && self.height > 0.0
            && (self.confidence > threshold || self.outline_confidence > threshold)
    }

    /// Whether an outline (nonzero size) was produced. Coarse-location-only
    /// results have a center but no outline.
    pub fn has_outline(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    /// Translate the center, e.g. from ROI-relative into frame coordinates.
    pub fn shift(&mut self, dx: f32, dy: f32) {
        self.cx += dx;
        self.cy += dy;
    }

    /// Scale center and size uniformly.
    pub fn rescale(&mut self, f: f32) {
        self.rescale_xy(f, f);
    }

    /// Scale center and size per axis.
    pub fn rescale_xy(&mut self, fx: f32, fy: f32) {
        self.cx *= fx;
        self.cy *= fy;
        self.width *= fx;
        self.height *= fy;
    }

    /// Longer full axis in pixels.
    pub fn major_axis(&self) -> f32 {
        self.width.max(self.height)
    }

    /// Shorter full axis in pixels.
    pub fn minor_axis(&self) -> f32 {
        self.width.min(self.height)
    }

    /// Diameter, defined as the major axis.
    pub fn diameter(&self) -> f32 {
        self.major_axis()
    }

    /// Ellipse circumference (Ramanujan approximation), or −1 without an
    /// outline.
    pub fn circumference(&self) -> f32 {
        if !self.has_outline() {
            return -1.0;
        }
        let a = 0.5 * self.major_axis();
        let b = 0.5 * self.minor_axis();
        std::f32::consts::PI
            * (3.0 * (a + b) - (10.0 * a * b + 3.0 * (a * a + b * b)).sqrt()).abs()
    }

    /// Sample `n` points on the outline, evenly spaced in parametric angle.
    pub fn boundary_points(&self, n: usize) -> Vec<[f32; 2]> {
        let (sin_t, cos_t) = self.angle.sin_cos();
        let a = 0.5 * self.width;
        let b = 0.5 * self.height;
        (0..n)
            .map(|i| {
                let t = 2.0 * std::f32::consts::PI * (i as f32) / (n as f32);
                let px = a * t.cos();
                let py = b * t.sin();
                [
                    self.cx + cos_t * px - sin_t * py,
                    self.cy + sin_t * px + cos_t * py,
                ]
            })
            .collect()
    }
}

impl Default for Pupil {
    fn default() -> Self {
        Self::cleared()
    }
}

/// Axis-aligned region of interest inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Roi {
    /// Construct from position and size.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// ROI covering a full `w × h` frame.
    pub fn full(w: u32, h: u32) -> Self {
        Self::new(0, 0, w, h)
    }

    /// Area in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Top-left corner.
    pub fn top_left(&self) -> (u32, u32) {
        (self.x, self.y)
    }

    /// Intersection with a `w × h` frame. Degenerates to zero size when the
    /// ROI lies fully outside.
    pub fn clamped_to(&self, w: u32, h: u32) -> Self {
        let x = self.x.min(w);
        let y = self.y.min(h);
        Self {
            x,
            y,
            width: self.width.min(w - x),
            height: self.height.min(h - y),
        }
    }
}
