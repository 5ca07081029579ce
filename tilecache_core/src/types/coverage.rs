use super::{BBox, TileCoord, TileScheme};
use anyhow::Result;

/// One entry of a coverage: a bbox valid at a single zoom level.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CoverageZoom {
	pub zoom: u8,
	pub bbox: BBox,
}

/// An ordered sequence of `{zoom, bbox}` describing a tile set (§3).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Coverage(pub Vec<CoverageZoom>);

impl Coverage {
	pub fn single(zoom: u8, bbox: BBox) -> Self {
		Coverage(vec![CoverageZoom { zoom, bbox }])
	}

	/// Builds a coverage tiling one bbox across an inclusive zoom range.
	pub fn from_bbox_zoom_range(bbox: BBox, min_zoom: u8, max_zoom: u8) -> Self {
		Coverage((min_zoom..=max_zoom).map(|zoom| CoverageZoom { zoom, bbox }).collect())
	}
}

/// A tile-aligned rectangle at one zoom level: `x` and `y` ranges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
	pub zoom: u8,
	pub x: [u32; 2],
	pub y: [u32; 2],
}

impl TileBounds {
	pub fn count(&self) -> u64 {
		(self.x[1] - self.x[0] + 1) as u64 * (self.y[1] - self.y[0] + 1) as u64
	}

	/// Iterates tiles in `(x asc, y asc)` order, matching the exporter's
	/// required iteration order within one rectangle.
	pub fn iter_coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
		let zoom = self.zoom;
		(self.x[0]..=self.x[1]).flat_map(move |x| (self.y[0]..=self.y[1]).map(move |y| TileCoord { z: zoom, x, y }))
	}

	pub fn real_bbox(&self) -> Result<BBox> {
		let top_left = TileCoord::new(self.zoom, self.x[0], self.y[0])?.as_geo_bbox()?;
		let bottom_right = TileCoord::new(self.zoom, self.x[1], self.y[1])?.as_geo_bbox()?;
		Ok(BBox::cover(&top_left, &bottom_right))
	}
}

/// Result of expanding a coverage: total tile count, the tile-aligned union
/// bbox, and one `TileBounds` rectangle per coverage entry (§4.B).
#[derive(Debug, Clone)]
pub struct ExpandedCoverage {
	pub total: u64,
	pub real_bbox: Option<BBox>,
	pub tile_bounds: Vec<TileBounds>,
}

/// `getBBoxFromTiles`: the geographic bbox covering tiles `[x_min..=x_max] x
/// [y_min..=y_max]` at zoom `z`. `scheme` only matters insofar as the caller
/// is expected to have already converted TMS y values to XYZ before calling.
pub fn bbox_from_tiles(x_min: u32, y_min: u32, x_max: u32, y_max: u32, z: u8, scheme: TileScheme) -> Result<BBox> {
	debug_assert_eq!(scheme, TileScheme::Xyz, "bbox_from_tiles expects XYZ-normalized y values");
	let tb = TileBounds { zoom: z, x: [x_min, x_max], y: [y_min, y_max] };
	tb.real_bbox()
}

/// `getTileBounds`: expands a coverage (or a single bbox + zoom range) into
/// per-zoom tile-bound rectangles and their union bbox. Empty coverage
/// yields `total = 0` with no rectangles.
pub fn tile_bounds(coverage: &Coverage, scheme: TileScheme) -> Result<ExpandedCoverage> {
	let _ = scheme; // scheme conversion happens at the backend boundary only (§4.B)
	let mut total = 0u64;
	let mut real_bbox: Option<BBox> = None;
	let mut tile_bounds = Vec::with_capacity(coverage.0.len());

	for entry in &coverage.0 {
		let top_left = TileCoord::from_lon_lat_zoom(entry.bbox.0, entry.bbox.3, entry.zoom)?;
		let bottom_right = TileCoord::from_lon_lat_zoom(entry.bbox.2, entry.bbox.1, entry.zoom)?;
		let tb = TileBounds {
			zoom: entry.zoom,
			x: [top_left.x, bottom_right.x],
			y: [top_left.y, bottom_right.y],
		};
		total += tb.count();
		let bbox = tb.real_bbox()?;
		real_bbox = Some(match real_bbox {
			Some(existing) => BBox::cover(&existing, &bbox),
			None => bbox,
		});
		tile_bounds.push(tb);
	}

	Ok(ExpandedCoverage { total, real_bbox, tile_bounds })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_coverage_has_no_tiles() {
		let expanded = tile_bounds(&Coverage::default(), TileScheme::Xyz).unwrap();
		assert_eq!(expanded.total, 0);
		assert!(expanded.real_bbox.is_none());
	}

	#[test]
	fn single_bbox_zoom_range_tiles_each_level() {
		let bbox = BBox::new(-10.0, -10.0, 10.0, 10.0).unwrap();
		let coverage = Coverage::from_bbox_zoom_range(bbox, 0, 2);
		let expanded = tile_bounds(&coverage, TileScheme::Xyz).unwrap();
		assert_eq!(expanded.tile_bounds.len(), 3);
		assert!(expanded.total > 0);
	}

	#[test]
	fn tile_count_matches_rectangle_area() {
		let tb = TileBounds { zoom: 4, x: [1, 3], y: [2, 2] };
		assert_eq!(tb.count(), 3);
		assert_eq!(tb.iter_coords().count(), 3);
	}

	#[test]
	fn iteration_order_is_x_then_y() {
		let tb = TileBounds { zoom: 1, x: [0, 1], y: [0, 1] };
		let coords: Vec<_> = tb.iter_coords().map(|c| (c.x, c.y)).collect();
		assert_eq!(coords, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
	}
}
