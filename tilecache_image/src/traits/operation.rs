use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::{DynamicImage, GenericImage, GenericImageView, Rgba, RgbaImage};

/// Transformations used to build a parent tile from its four children
/// (§4.E "addOverviews").
pub trait DynamicImageTraitOperation {
	/// Downscales the image by `factor` on both axes using a box filter.
	fn get_scaled_down(&self, factor: u32) -> Result<DynamicImage>;
	/// Draws `top` over `self` at `(x, y)`, composing alpha.
	fn overlay(&mut self, top: &DynamicImage, x: i64, y: i64);
}

impl DynamicImageTraitOperation for DynamicImage {
	fn get_scaled_down(&self, factor: u32) -> Result<DynamicImage> {
		let dst_width = (self.width() / factor).max(1);
		let dst_height = (self.height() / factor).max(1);
		let src_image = fr::images::Image::from_vec_u8(
			self.width(),
			self.height(),
			self.to_rgba8().into_raw(),
			fr::PixelType::U8x4,
		)
		.context("building source image for resize")?;
		let mut dst_image = fr::images::Image::new(dst_width, dst_height, fr::PixelType::U8x4);
		let mut resizer = fr::Resizer::new();
		let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box));
		resizer.resize(&src_image, &mut dst_image, Some(&options)).context("resizing image")?;
		let buffer = RgbaImage::from_raw(dst_width, dst_height, dst_image.into_vec()).context("rebuilding resized image buffer")?;
		Ok(DynamicImage::ImageRgba8(buffer))
	}

	fn overlay(&mut self, top: &DynamicImage, x: i64, y: i64) {
		image::imageops::overlay(self, top, x, y);
	}
}

/// Builds a parent tile from up to four children (some may be missing, in
/// which case that quadrant stays transparent): composites the available
/// children into a `2w x 2h` canvas with a transparent background, then
/// downscales to `(w, h)`. Returns `None` when all four children are absent.
pub fn composite_overview(children: [Option<DynamicImage>; 4], tile_size: u32) -> Result<Option<DynamicImage>> {
	if children.iter().all(Option::is_none) {
		return Ok(None);
	}
	let canvas_size = tile_size * 2;
	let mut canvas = DynamicImage::ImageRgba8(RgbaImage::from_pixel(canvas_size, canvas_size, Rgba([0, 0, 0, 0])));
	// Quadrant order matches the child coordinate order (z+1, 2x..2x+1, 2y..2y+1):
	// index 0 = (2x, 2y), 1 = (2x+1, 2y), 2 = (2x, 2y+1), 3 = (2x+1, 2y+1).
	let offsets = [(0i64, 0i64), (tile_size as i64, 0), (0, tile_size as i64), (tile_size as i64, tile_size as i64)];
	for (child, (ox, oy)) in children.into_iter().zip(offsets) {
		if let Some(child) = child {
			canvas.overlay(&child, ox, oy);
		}
	}
	Ok(Some(canvas.get_scaled_down(2)?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::traits::info::DynamicImageTraitInfo;

	fn solid(size: u32, color: [u8; 4]) -> DynamicImage {
		DynamicImage::ImageRgba8(RgbaImage::from_pixel(size, size, Rgba(color)))
	}

	#[test]
	fn scales_down_by_factor() {
		let img = solid(8, [10, 20, 30, 255]);
		let scaled = img.get_scaled_down(2).unwrap();
		assert_eq!(scaled.width(), 4);
		assert_eq!(scaled.height(), 4);
	}

	#[test]
	fn composite_all_missing_is_none() {
		assert!(composite_overview([None, None, None, None], 256).unwrap().is_none());
	}

	#[test]
	fn composite_of_opaque_children_is_opaque() {
		let child = solid(4, [5, 5, 5, 255]);
		let result = composite_overview([Some(child.clone()), Some(child.clone()), Some(child.clone()), Some(child)], 4)
			.unwrap()
			.unwrap();
		assert_eq!(result.width(), 4);
		assert!(result.is_opaque());
	}

	#[test]
	fn composite_with_missing_quadrant_has_alpha() {
		let child = solid(4, [5, 5, 5, 255]);
		let result = composite_overview([Some(child), None, None, None], 4).unwrap().unwrap();
		assert!(!result.is_opaque());
	}
}
