mod info;
mod operation;

pub use info::DynamicImageTraitInfo;
pub use operation::{DynamicImageTraitOperation, composite_overview};
