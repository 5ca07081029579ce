use anyhow::{Result, bail, ensure};

/// Maximum Web-Mercator latitude; beyond this the projection diverges.
pub const MAX_LAT: f64 = 85.051_129;
pub const MAX_LON: f64 = 180.0;

/// `[min_lon, min_lat, max_lon, max_lat]`, clamped to the Web-Mercator world.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BBox(pub f64, pub f64, pub f64, pub f64);

impl BBox {
	/// Builds a bbox, clamping latitude/longitude and rejecting antimeridian
	/// crossings and degenerate (min >= max) ranges.
	pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self> {
		if min_lon > max_lon {
			bail!("BadRequest: bbox crosses the antimeridian (min_lon {min_lon} > max_lon {max_lon})");
		}
		let min_lon = min_lon.clamp(-MAX_LON, MAX_LON);
		let max_lon = max_lon.clamp(-MAX_LON, MAX_LON);
		let min_lat = min_lat.clamp(-MAX_LAT, MAX_LAT);
		let max_lat = max_lat.clamp(-MAX_LAT, MAX_LAT);
		ensure!(min_lon < max_lon, "BadRequest: bbox min_lon >= max_lon after clamping");
		ensure!(min_lat < max_lat, "BadRequest: bbox min_lat >= max_lat after clamping");
		Ok(BBox(min_lon, min_lat, max_lon, max_lat))
	}

	pub fn as_array(&self) -> [f64; 4] {
		[self.0, self.1, self.2, self.3]
	}

	/// The smallest bbox containing both inputs.
	pub fn cover(a: &BBox, b: &BBox) -> BBox {
		BBox(a.0.min(b.0), a.1.min(b.1), a.2.max(b.2), a.3.max(b.3))
	}

	/// `getCenterFromBBox`: midpoint of the bbox; `z` is carried through
	/// unchanged by the caller (it only affects neighboring metadata, not
	/// the center computation itself).
	pub fn center(&self) -> [f64; 2] {
		[(self.0 + self.2) / 2.0, (self.1 + self.3) / 2.0]
	}

	pub fn approx_eq(&self, other: &BBox, eps: f64) -> bool {
		(self.0 - other.0).abs() < eps
			&& (self.1 - other.1).abs() < eps
			&& (self.2 - other.2).abs() < eps
			&& (self.3 - other.3).abs() < eps
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_antimeridian_crossing() {
		assert!(BBox::new(170.0, -10.0, -170.0, 10.0).is_err());
	}

	#[test]
	fn clamps_latitude() {
		let b = BBox::new(-10.0, -89.0, 10.0, 89.0).unwrap();
		assert_eq!(b.1, -MAX_LAT);
		assert_eq!(b.3, MAX_LAT);
	}

	#[test]
	fn cover_is_union() {
		let a = BBox::new(0.0, 0.0, 10.0, 10.0).unwrap();
		let b = BBox::new(5.0, 5.0, 20.0, 20.0).unwrap();
		assert_eq!(BBox::cover(&a, &b).as_array(), [0.0, 0.0, 20.0, 20.0]);
	}

	#[test]
	fn center_is_midpoint() {
		let b = BBox::new(0.0, 0.0, 10.0, 20.0).unwrap();
		assert_eq!(b.center(), [5.0, 10.0]);
	}
}
