//! Minimal hand-rolled protobuf reading, in the spirit of this crate's other
//! small byte-level parsers: just enough to sniff Mapbox Vector Tile layer
//! names and to merge glyph ranges, without depending on a full protobuf
//! codegen stack for formats this crate never needs to write from a
//! `.proto` schema.

mod glyphs;
mod mvt;
mod varint;

pub use glyphs::merge_glyph_ranges;
pub use mvt::sniff_vector_layer_names;
pub use varint::ProtoReader;
