/// A tile's payload format, shared by TileJSON metadata and format sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
	Jpeg,
	Png,
	Webp,
	Gif,
	Pbf,
}

impl TileFormat {
	pub fn content_type(self) -> &'static str {
		match self {
			TileFormat::Jpeg => "image/jpeg",
			TileFormat::Png => "image/png",
			TileFormat::Webp => "image/webp",
			TileFormat::Gif => "image/gif",
			TileFormat::Pbf => "application/x-protobuf",
		}
	}

	pub fn extension(self) -> &'static str {
		match self {
			TileFormat::Jpeg => "jpeg",
			TileFormat::Png => "png",
			TileFormat::Webp => "webp",
			TileFormat::Gif => "gif",
			TileFormat::Pbf => "pbf",
		}
	}

	pub fn from_extension(ext: &str) -> Option<Self> {
		match ext.to_ascii_lowercase().as_str() {
			"jpeg" | "jpg" => Some(TileFormat::Jpeg),
			"png" => Some(TileFormat::Png),
			"webp" => Some(TileFormat::Webp),
			"gif" => Some(TileFormat::Gif),
			"pbf" | "mvt" => Some(TileFormat::Pbf),
			_ => None,
		}
	}
}
