use anyhow::{Result, ensure};
use image::{DynamicImage, GenericImageView};

/// Alpha-aware metadata queries used by the overview compositor to decide
/// whether a generated tile is empty and should be skipped.
pub trait DynamicImageTraitInfo {
	/// `true` iff the image has an alpha channel and every pixel's alpha is 0.
	fn is_empty(&self) -> bool;
	/// `true` iff the image has no alpha channel, or every pixel's alpha is 255.
	fn is_opaque(&self) -> bool;
	fn ensure_same_size(&self, other: &DynamicImage) -> Result<()>;
}

impl DynamicImageTraitInfo for DynamicImage {
	fn is_empty(&self) -> bool {
		if !self.color().has_alpha() {
			return false;
		}
		let alpha_channel = (self.color().channel_count() - 1) as usize;
		self.pixels().all(|(_, _, p)| p.0[alpha_channel] == 0)
	}

	fn is_opaque(&self) -> bool {
		if !self.color().has_alpha() {
			return true;
		}
		let alpha_channel = (self.color().channel_count() - 1) as usize;
		self.pixels().all(|(_, _, p)| p.0[alpha_channel] == 255)
	}

	fn ensure_same_size(&self, other: &DynamicImage) -> Result<()> {
		ensure!(
			self.width() == other.width() && self.height() == other.height(),
			"image size mismatch: {}x{} vs {}x{}",
			self.width(),
			self.height(),
			other.width(),
			other.height()
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::{Rgba, RgbaImage};

	#[test]
	fn empty_requires_all_alpha_zero() {
		let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 0])));
		assert!(img.is_empty());
		assert!(!img.is_opaque());
	}

	#[test]
	fn opaque_without_alpha_channel() {
		let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3])));
		assert!(img.is_opaque());
		assert!(!img.is_empty());
	}
}
