//! Shared "add overviews" implementation (§4.E) used by every backend whose
//! `add_overviews` just reads/writes tiles through the common
//! [`StorageBackend`] capability set — MBTiles, XYZ and PostgreSQL all share
//! this walk; only PMTiles (read-only) never calls it.
//!
//! Grounded on `tilecache_image::composite_overview` for the 2x2 mosaic and
//! downscale step, and on `versatiles_container`'s `buffer_unordered`
//! traversal pattern for driving the per-tile work concurrently.

use crate::traits::{MetadataPatch, StorageBackend, StorageError};
use anyhow::Result;
use futures::{StreamExt, stream};
use image::ImageFormat;
use tilecache_core::types::{TileCoord, TileFormat};
use tilecache_image::composite_overview;

/// Walks from the source's current `maxzoom` down, compositing each parent
/// tile from its (up to four) children, until the remaining footprint fits
/// within roughly one tile (§4.E "Stop when the source footprint in pixels
/// is ≤ 95% of one tile"). Writes the resulting `minzoom` into metadata.
pub async fn add_overviews_generic(backend: &(impl StorageBackend + ?Sized), concurrency: usize, tile_size: u32) -> Result<()> {
	let meta = backend.get_metadata().await?;
	let format = meta.format.unwrap_or(TileFormat::Png);
	let Some(bounds) = meta.bounds else {
		return Ok(());
	};
	let mut zoom = meta.maxzoom;
	let mut last_written_minzoom = meta.maxzoom;

	while zoom > 0 {
		let parent_zoom = zoom - 1;

		// Footprint in fractional "tile units" at this zoom, from the real
		// bbox (not the tile-aligned rectangle, which is always >= 1x1):
		// stop once the bbox covers no more area than a single tile, with a
		// 5% margin (§4.E "stop when the source footprint in pixels is <=
		// 95% of one tile").
		let (fx, fy) = fractional_tile_span(bounds, parent_zoom);
		if fx * fy <= 0.95 {
			break;
		}

		let coverage = tilecache_core::types::Coverage::single(parent_zoom, tilecache_core::types::BBox(bounds[0], bounds[1], bounds[2], bounds[3]));
		let expanded = tilecache_core::types::tile_bounds(&coverage, backend.scheme())?;
		let Some(rect) = expanded.tile_bounds.first() else { break };

		let coords: Vec<TileCoord> = rect.iter_coords().collect();
		stream::iter(coords)
			.for_each_concurrent(concurrency.max(1), |coord| async move {
				if let Err(err) = generate_parent_tile(backend, coord, format, tile_size).await {
					log::warn!("overview generation failed for {coord:?}: {err:#}");
				}
			})
			.await;

		last_written_minzoom = parent_zoom;
		zoom = parent_zoom;
	}

	backend.update_metadata(MetadataPatch { minzoom: Some(last_written_minzoom), ..Default::default() }).await
}

/// The bbox's width/height in fractional tile units at `zoom`, via forward
/// Web-Mercator projection (unlike the tile-aligned rectangle from
/// `tile_bounds`, which always rounds up to at least one whole tile).
fn fractional_tile_span(bounds: [f64; 4], zoom: u8) -> (f64, f64) {
	let n = 2f64.powi(i32::from(zoom));
	let x_frac = |lon: f64| (lon / 360.0 + 0.5) * n;
	let y_frac = |lat: f64| {
		let lat_rad = lat.to_radians();
		(1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n
	};
	let fx = (x_frac(bounds[2]) - x_frac(bounds[0])).abs();
	let fy = (y_frac(bounds[1]) - y_frac(bounds[3])).abs();
	(fx, fy)
}

async fn generate_parent_tile(backend: &(impl StorageBackend + ?Sized), parent: TileCoord, format: TileFormat, tile_size: u32) -> Result<()> {
	let mut children = [None, None, None, None];
	let child_coords =
		[(2 * parent.x, 2 * parent.y), (2 * parent.x + 1, 2 * parent.y), (2 * parent.x, 2 * parent.y + 1), (2 * parent.x + 1, 2 * parent.y + 1)];
	for (slot, (cx, cy)) in children.iter_mut().zip(child_coords) {
		let Ok(coord) = TileCoord::new(parent.z + 1, cx, cy) else { continue };
		match backend.get_tile(coord).await {
			Ok(bytes) => {
				if let Ok(image) = image::load_from_memory(&bytes) {
					*slot = Some(image);
				}
			}
			Err(StorageError::NotFound) => {}
			Err(StorageError::Other(err)) => return Err(err),
		}
	}

	let Some(composited) = composite_overview(children, tile_size)? else {
		return Ok(());
	};

	let image_format = match format {
		TileFormat::Jpeg => ImageFormat::Jpeg,
		TileFormat::Webp => ImageFormat::WebP,
		TileFormat::Gif => ImageFormat::Gif,
		_ => ImageFormat::Png,
	};
	let mut bytes = Vec::new();
	composited.write_to(&mut std::io::Cursor::new(&mut bytes), image_format)?;
	backend.put_tile(parent, &bytes, true).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fractional_span_shrinks_one_tile_per_zoom_level() {
		// A single whole-world tile's bbox spans exactly 1x1 tile units at
		// every zoom, regardless of z, since it's always "the whole world".
		let world = [-180.0, -85.051_129, 180.0, 85.051_129];
		let (fx, fy) = fractional_tile_span(world, 0);
		assert!((fx - 1.0).abs() < 1e-9);
		assert!((fy - 1.0).abs() < 1e-9);
	}

	#[test]
	fn fractional_span_below_one_tile_stops_the_walk() {
		// A bbox covering a quarter of the world's longitude span and roughly
		// half its useful latitude span covers well under one z=0 tile.
		let quadrant = [0.0, 0.0, 90.0, 66.0];
		let (fx, fy) = fractional_tile_span(quadrant, 0);
		assert!(fx * fy < 0.95);
	}
}
