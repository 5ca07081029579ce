use super::varint::ProtoReader;
use anyhow::Result;

const STACKS_FIELD: u64 = 1;
const NAME_FIELD: u64 = 1;
const GLYPHS_FIELD: u64 = 2;
const GLYPH_ID_FIELD: u64 = 1;

struct Fontstack<'a> {
	name: String,
	glyphs: Vec<(u32, &'a [u8])>,
}

fn parse_glyphs_pbf(bytes: &[u8]) -> Result<Vec<Fontstack<'_>>> {
	let mut stacks = Vec::new();
	let mut reader = ProtoReader::new(bytes);
	while let Some((field_number, field)) = reader.next_field()? {
		if field_number != STACKS_FIELD {
			continue;
		}
		let Some(stack_bytes) = field.as_bytes() else { continue };
		stacks.push(parse_fontstack(stack_bytes)?);
	}
	Ok(stacks)
}

fn parse_fontstack(bytes: &[u8]) -> Result<Fontstack<'_>> {
	let mut name = String::new();
	let mut glyphs = Vec::new();
	let mut reader = ProtoReader::new(bytes);
	while let Some((field_number, field)) = reader.next_field()? {
		match field_number {
			NAME_FIELD => {
				if let Some(bytes) = field.as_bytes() {
					name = String::from_utf8_lossy(bytes).into_owned();
				}
			}
			GLYPHS_FIELD => {
				if let Some(glyph_bytes) = field.as_bytes() {
					if let Some(id) = parse_glyph_id(glyph_bytes)? {
						glyphs.push((id, glyph_bytes));
					}
				}
			}
			_ => {}
		}
	}
	Ok(Fontstack { name, glyphs })
}

fn parse_glyph_id(bytes: &[u8]) -> Result<Option<u32>> {
	let mut reader = ProtoReader::new(bytes);
	while let Some((field_number, field)) = reader.next_field()? {
		if field_number == GLYPH_ID_FIELD {
			return Ok(field.as_varint().map(|v| v as u32));
		}
	}
	Ok(None)
}

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

fn encode_length_delimited(field_number: u64, bytes: &[u8], out: &mut Vec<u8>) {
	encode_varint((field_number << 3) | 2, out);
	encode_varint(bytes.len() as u64, out);
	out.extend_from_slice(bytes);
}

/// Merges a list of per-font glyph-range PBFs into a single response PBF,
/// by glyph id, first writer wins (§4.F / §8 testable property). Stack
/// names are concatenated with `,` in input order.
pub fn merge_glyph_ranges(pbfs: &[Vec<u8>]) -> Result<Vec<u8>> {
	let mut seen = std::collections::HashSet::new();
	let mut merged_glyphs: Vec<&[u8]> = Vec::new();
	let mut names = Vec::new();

	// Keep the parsed fontstacks alive for the lifetime of `merged_glyphs`.
	let parsed: Vec<Vec<Fontstack>> = pbfs.iter().map(|bytes| parse_glyphs_pbf(bytes)).collect::<Result<_>>()?;

	for stacks in &parsed {
		for stack in stacks {
			if !stack.name.is_empty() {
				names.push(stack.name.clone());
			}
			for &(id, raw) in &stack.glyphs {
				if seen.insert(id) {
					merged_glyphs.push(raw);
				}
			}
		}
	}

	let mut fontstack = Vec::new();
	encode_length_delimited(NAME_FIELD, names.join(",").as_bytes(), &mut fontstack);
	for raw in merged_glyphs {
		encode_length_delimited(GLYPHS_FIELD, raw, &mut fontstack);
	}

	let mut out = Vec::new();
	encode_length_delimited(STACKS_FIELD, &fontstack, &mut out);
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn encode_glyph(id: u32) -> Vec<u8> {
		let mut out = Vec::new();
		encode_varint((GLYPH_ID_FIELD << 3) | 0, &mut out);
		encode_varint(id as u64, &mut out);
		out
	}

	fn encode_stack(name: &str, ids: &[u32]) -> Vec<u8> {
		let mut stack = Vec::new();
		encode_length_delimited(NAME_FIELD, name.as_bytes(), &mut stack);
		for &id in ids {
			let glyph = encode_glyph(id);
			encode_length_delimited(GLYPHS_FIELD, &glyph, &mut stack);
		}
		let mut out = Vec::new();
		encode_length_delimited(STACKS_FIELD, &stack, &mut out);
		out
	}

	#[test]
	fn merges_by_id_first_writer_wins() {
		let a = encode_stack("FamilyA", &[65, 66]);
		let b = encode_stack("FamilyB", &[66, 67]);
		let merged = merge_glyph_ranges(&[a, b]).unwrap();

		let stacks = parse_glyphs_pbf(&merged).unwrap();
		assert_eq!(stacks.len(), 1);
		let ids: std::collections::HashSet<u32> = stacks[0].glyphs.iter().map(|(id, _)| *id).collect();
		assert_eq!(ids, [65u32, 66, 67].into_iter().collect());
		assert_eq!(stacks[0].name, "FamilyA,FamilyB");
	}
}
