use image::GenericImageView;

/// Full-transparent-PNG test (§4.C): decodes the image and checks whether
/// every pixel's alpha channel is zero. Only PNG is ever considered
/// transparent; other formats return `false` without decoding.
pub fn is_fully_transparent_png(format_is_png: bool, bytes: &[u8]) -> bool {
	if !format_is_png {
		return false;
	}
	let Ok(img) = image::load_from_memory_with_format(bytes, image::ImageFormat::Png) else {
		return false;
	};
	if !img.color().has_alpha() {
		return false;
	}
	img.pixels().all(|(_, _, px)| px.0[3] == 0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::{DynamicImage, RgbaImage};

	#[test]
	fn non_png_is_never_transparent() {
		assert!(!is_fully_transparent_png(false, b"anything"));
	}

	#[test]
	fn fully_transparent_png_detected() {
		let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 0, 0])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		assert!(is_fully_transparent_png(true, &bytes));
	}

	#[test]
	fn opaque_png_is_not_transparent() {
		let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, image::Rgba([10, 20, 30, 255])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		assert!(!is_fully_transparent_png(true, &bytes));
	}
}
