use super::{BBox, TileScheme};
use anyhow::{Result, ensure};
use std::f64::consts::PI;

/// A tile address, always expressed in XYZ (y = 0 at the top). Conversion to
/// TMS happens only at a storage backend's I/O boundary (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
	pub z: u8,
	pub x: u32,
	pub y: u32,
}

impl TileCoord {
	pub fn new(z: u8, x: u32, y: u32) -> Result<Self> {
		ensure!(z <= 22, "BadRequest: zoom {z} exceeds maximum of 22");
		let coord = TileCoord { z, x, y };
		ensure!(coord.is_valid(), "BadRequest: tile ({z},{x},{y}) out of range");
		Ok(coord)
	}

	pub fn is_valid(&self) -> bool {
		let max = 1u32 << self.z;
		self.x < max && self.y < max
	}

	/// The y coordinate as seen by a TMS-native backend (MBTiles).
	pub fn y_in_scheme(&self, scheme: TileScheme) -> u32 {
		match scheme {
			TileScheme::Xyz => self.y,
			TileScheme::Tms => TileScheme::flip_y(self.y, self.z),
		}
	}

	/// Inverse Web-Mercator projection of this tile's top-left corner.
	pub fn as_geo(&self) -> [f64; 2] {
		let n = 2f64.powi(self.z as i32);
		[
			(self.x as f64 / n - 0.5) * 360.0,
			((PI * (1.0 - 2.0 * self.y as f64 / n)).exp().atan() / PI - 0.25) * 360.0,
		]
	}

	pub fn as_geo_bbox(&self) -> Result<BBox> {
		let n = 2f64.powi(self.z as i32);
		let lon = |x: u32| (x as f64 / n - 0.5) * 360.0;
		let lat = |y: u32| ((PI * (1.0 - 2.0 * y as f64 / n)).exp().atan() / PI - 0.25) * 360.0;
		BBox::new(lon(self.x), lat(self.y + 1), lon(self.x + 1), lat(self.y))
	}

	/// Forward Web-Mercator projection: the tile containing `(lon, lat)` at zoom `z`.
	pub fn from_lon_lat_zoom(lon: f64, lat: f64, z: u8) -> Result<Self> {
		let n = 2f64.powi(z as i32);
		let lat = lat.clamp(-super::bbox::MAX_LAT, super::bbox::MAX_LAT);
		let lon = lon.clamp(-super::bbox::MAX_LON, super::bbox::MAX_LON);
		let x = ((lon / 360.0 + 0.5) * n).floor() as u32;
		let lat_rad = lat.to_radians();
		let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor() as u32;
		TileCoord::new(z, x.min((1u32 << z) - 1), y.min((1u32 << z) - 1))
	}

	/// Quad-ordered sort index, used to iterate tiles in a stable, cache-friendly order.
	pub fn sort_index(&self) -> u64 {
		let size = 1u64 << self.z;
		let offset = (size * size - 1) / 3;
		offset + size * self.y as u64 + self.x as u64
	}
}

impl PartialOrd for TileCoord {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TileCoord {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.z, self.x, self.y).cmp(&(other.z, other.x, other.y))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn z0_is_sole_tile() {
		let c = TileCoord::new(0, 0, 0).unwrap();
		assert_eq!(c.y_in_scheme(TileScheme::Tms), 0);
	}

	#[test]
	fn rejects_out_of_range() {
		assert!(TileCoord::new(2, 4, 0).is_err());
		assert!(TileCoord::new(23, 0, 0).is_err());
	}

	#[test]
	fn tms_roundtrip_matches_mbtiles_convention() {
		let c = TileCoord::new(2, 1, 1).unwrap();
		// XYZ y=1 at z=2 <=> TMS y=2 (distilled-spec scenario #2).
		assert_eq!(c.y_in_scheme(TileScheme::Tms), 2);
	}

	#[test]
	fn ordering_is_z_then_x_then_y() {
		let a = TileCoord::new(1, 0, 0).unwrap();
		let b = TileCoord::new(1, 0, 1).unwrap();
		assert!(a < b);
	}

	#[test]
	fn sort_index_matches_known_value() {
		let c = TileCoord::new(5, 3, 4).unwrap();
		assert_eq!(c.sort_index(), 472);
	}
}
