//! The interchangeable detection pipelines.

mod el_se;
mod excuse;
mod pure;
mod purest;
mod starburst;
mod swirski;

pub use el_se::ElSe;
pub use excuse::ExCuSe;
pub use pure::PuRe;
pub use purest::PuReST;
pub use starburst::Starburst;
pub use swirski::{Swirski2D, TrackerParams};
