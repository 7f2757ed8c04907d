//! pupilfit — pupil detection core for real-time eye tracking.
//!
//! A set of independent, interchangeable pipelines that each take a
//! single-channel 8-bit eye image (or ROI sub-image) and return a
//! best-estimate pupil ellipse with a confidence score:
//!
//! 1. **ElSe** – edge-curve selection with a convolution blob fallback.
//! 2. **ExCuSe** – curve selection plus angular-projection heuristics.
//! 3. **PuRe** – physical-unit full search with combined confidence.
//! 4. **PuReST** – outline tracking over a PuRe full search.
//! 5. **Starburst** – radial ray casting with iterative conic RANSAC.
//! 6. **Swirski2D** – Haar coarse search, K-means split, parallel RANSAC.
//!
//! All methods implement the [`PupilDetectionMethod`] contract; the
//! [`PupilDetection`] front-end holds per-viewpoint instance sets, selects
//! a method by name and normalizes results (full-frame coordinates,
//! outline confidence, algorithm tag). Detection never fails: every error
//! path yields an invalid [`Pupil`] that callers must check with
//! [`Pupil::valid`].
//!
//! The core performs no I/O and owns no configuration format; tunables are
//! plain fields on the method types.

mod confidence;
mod conic;
mod dispatch;
mod edges;
mod imgproc;
mod method;
mod methods;
mod pupil;
#[cfg(test)]
mod test_utils;

pub use confidence::{
    angular_spread_confidence, aspect_ratio_confidence, coarse_pupil_detection,
    edge_ratio_confidence, outline_contrast_confidence,
};
pub use dispatch::{method_registry, BoxedMethod, PupilDetection, UnknownMethodError};
pub use method::{PupilDetectionMethod, MIN_ROI_AREA};
pub use methods::{ElSe, ExCuSe, PuRe, PuReST, Starburst, Swirski2D, TrackerParams};
pub use pupil::{Pupil, Roi, NO_CONFIDENCE};
