use super::varint::ProtoReader;
use anyhow::Result;

const TILE_LAYER_FIELD: u64 = 3;
const LAYER_NAME_FIELD: u64 = 1;

/// Decodes a Mapbox Vector Tile v2 buffer far enough to collect each layer's
/// `name` field (1), without parsing features/keys/values/extents. Used to
/// derive `vector_layers` for `pbf` tiles that lack the metadata (§3, §4.E).
pub fn sniff_vector_layer_names(tile_bytes: &[u8]) -> Result<Vec<String>> {
	let mut names = Vec::new();
	let mut reader = ProtoReader::new(tile_bytes);
	while let Some((field_number, field)) = reader.next_field()? {
		if field_number != TILE_LAYER_FIELD {
			continue;
		}
		let Some(layer_bytes) = field.as_bytes() else { continue };
		if let Some(name) = read_layer_name(layer_bytes)? {
			names.push(name);
		}
	}
	Ok(names)
}

fn read_layer_name(layer_bytes: &[u8]) -> Result<Option<String>> {
	let mut reader = ProtoReader::new(layer_bytes);
	while let Some((field_number, field)) = reader.next_field()? {
		if field_number == LAYER_NAME_FIELD {
			if let Some(bytes) = field.as_bytes() {
				return Ok(Some(String::from_utf8_lossy(bytes).into_owned()));
			}
		}
	}
	Ok(None)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn encode_varint(mut v: u64, out: &mut Vec<u8>) {
		loop {
			let mut byte = (v & 0x7F) as u8;
			v >>= 7;
			if v != 0 {
				byte |= 0x80;
			}
			out.push(byte);
			if v == 0 {
				break;
			}
		}
	}

	fn encode_layer(name: &str) -> Vec<u8> {
		let mut layer = Vec::new();
		encode_varint((LAYER_NAME_FIELD << 3) | 2, &mut layer);
		encode_varint(name.len() as u64, &mut layer);
		layer.extend_from_slice(name.as_bytes());
		layer
	}

	fn encode_tile(layers: &[&str]) -> Vec<u8> {
		let mut tile = Vec::new();
		for name in layers {
			let layer = encode_layer(name);
			encode_varint((TILE_LAYER_FIELD << 3) | 2, &mut tile);
			encode_varint(layer.len() as u64, &mut tile);
			tile.extend_from_slice(&layer);
		}
		tile
	}

	#[test]
	fn extracts_all_layer_names() {
		let tile = encode_tile(&["water", "roads", "buildings"]);
		let names = sniff_vector_layer_names(&tile).unwrap();
		assert_eq!(names, vec!["water", "roads", "buildings"]);
	}

	#[test]
	fn empty_tile_has_no_layers() {
		assert!(sniff_vector_layer_names(&[]).unwrap().is_empty());
	}
}
