use super::{BBox, TileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileJsonType {
	Baselayer,
	Overlay,
}

/// A tile source's metadata document (§3), as served at `/datas/:id.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileJson {
	pub tilejson: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub attribution: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<TileJsonType>,
	pub format: Option<TileFormat>,
	pub minzoom: u8,
	pub maxzoom: u8,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bounds: Option<[f64; 4]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub center: Option<[f64; 2]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub vector_layers: Option<Vec<String>>,
	pub tiles: Vec<String>,
}

impl Default for TileJson {
	fn default() -> Self {
		TileJson {
			tilejson: "2.2.0".to_string(),
			name: None,
			description: None,
			attribution: None,
			version: None,
			kind: None,
			format: None,
			minzoom: 0,
			maxzoom: 22,
			bounds: None,
			center: None,
			vector_layers: None,
			tiles: Vec::new(),
		}
	}
}

impl TileJson {
	/// `center` derivation follows `getCenterFromBBox` everywhere (Open
	/// Question #5 in the distilled spec's §9): arithmetic midpoint of
	/// `bounds` is never used as an alternate path.
	pub fn fill_missing_center(&mut self) {
		if self.center.is_none() {
			if let Some(bounds) = self.bounds {
				let bbox = BBox(bounds[0], bounds[1], bounds[2], bounds[3]);
				self.center = Some(bbox.center());
			}
		}
	}

	pub fn mid_zoom(&self) -> u8 {
		(self.minzoom as u16 + self.maxzoom as u16).div_euclid(2) as u8
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fills_center_from_bounds_via_bbox_center() {
		let mut tj = TileJson { bounds: Some([0.0, 0.0, 10.0, 20.0]), minzoom: 0, maxzoom: 10, ..Default::default() };
		tj.fill_missing_center();
		assert_eq!(tj.center, Some([5.0, 10.0]));
	}

	#[test]
	fn mid_zoom_floors() {
		let tj = TileJson { minzoom: 3, maxzoom: 8, ..Default::default() };
		assert_eq!(tj.mid_zoom(), 5);
	}
}
