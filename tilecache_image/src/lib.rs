//! Image compositing used to generate tile overviews (§4.E "addOverviews").
//!
//! Builds on `image::DynamicImage` with a small set of trait extensions for
//! scaling, overlaying and alpha introspection.

pub mod traits;

pub use image::{DynamicImage, GenericImageView};
pub use traits::*;
