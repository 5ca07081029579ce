mod bbox;
mod coverage;
mod tile_coord;
mod tile_format;
mod tile_scheme;
mod tilejson;

pub use bbox::BBox;
pub use coverage::{Coverage, CoverageZoom, ExpandedCoverage, TileBounds, bbox_from_tiles, tile_bounds};
pub use tile_coord::TileCoord;
pub use tile_format::TileFormat;
pub use tile_scheme::TileScheme;
pub use tilejson::{TileJson, TileJsonType};
