//! PMTiles directory (header/root/leaf) binary format, per the teacher's
//! `EntriesV3`: a column-oriented, delta/varint-encoded list of
//! `(tile_id, run_length, length, offset)` tuples, binary-searched by
//! `tile_id`.

use anyhow::{Result, ensure};
use tilecache_core::protobuf::ProtoReader;

use super::header::Compression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
	pub tile_id: u64,
	pub run_length: u32,
	pub length: u64,
	pub offset: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
	entries: Vec<Entry>,
}

impl Directory {
	pub fn parse(bytes: &[u8]) -> Result<Self> {
		let mut reader = ProtoReader::new(bytes);
		let num_entries = reader.read_varint()? as usize;

		let mut tile_ids = Vec::with_capacity(num_entries);
		let mut tile_id = 0u64;
		for _ in 0..num_entries {
			tile_id += reader.read_varint()?;
			tile_ids.push(tile_id);
		}

		let mut run_lengths = Vec::with_capacity(num_entries);
		for _ in 0..num_entries {
			run_lengths.push(reader.read_varint()? as u32);
		}

		let mut lengths = Vec::with_capacity(num_entries);
		for _ in 0..num_entries {
			lengths.push(reader.read_varint()?);
		}

		let mut offsets = Vec::with_capacity(num_entries);
		let mut prev_offset_end: Option<u64> = None;
		for i in 0..num_entries {
			let raw = reader.read_varint()?;
			let offset = if raw == 0 {
				prev_offset_end.ok_or_else(|| anyhow::anyhow!("pmtiles: directory entry 0 cannot use implicit offset"))?
			} else {
				raw - 1
			};
			prev_offset_end = Some(offset + lengths[i]);
			offsets.push(offset);
		}

		let entries = (0..num_entries)
			.map(|i| Entry { tile_id: tile_ids[i], run_length: run_lengths[i], length: lengths[i], offset: offsets[i] })
			.collect();
		Ok(Directory { entries })
	}

	/// Binary searches for the entry covering `tile_id`: either an exact
	/// match, or (for a leaf pointer) the last entry whose `tile_id` is
	/// `<=` the target (teacher's `find_tile` semantics).
	pub fn find(&self, tile_id: u64) -> Option<Entry> {
		match self.entries.binary_search_by_key(&tile_id, |e| e.tile_id) {
			Ok(idx) => Some(self.entries[idx]),
			Err(0) => None,
			Err(idx) => {
				let candidate = self.entries[idx - 1];
				if candidate.run_length == 0 {
					// Leaf-directory pointer: covers every tile_id >= its own.
					Some(candidate)
				} else if tile_id < candidate.tile_id + candidate.run_length as u64 {
					Some(candidate)
				} else {
					None
				}
			}
		}
	}

	#[cfg(test)]
	pub fn from_entries(entries: Vec<Entry>) -> Self {
		Directory { entries }
	}
}

pub fn decompress_gzip(bytes: Vec<u8>, compression: Compression) -> Result<Vec<u8>> {
	match compression {
		Compression::Gzip => {
			use std::io::Read;
			let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
			let mut out = Vec::new();
			decoder.read_to_end(&mut out)?;
			Ok(out)
		}
		Compression::None | Compression::Unknown => Ok(bytes),
		Compression::Brotli | Compression::Zstd => {
			ensure!(false, "pmtiles: directory/metadata compression {compression:?} is not supported");
			unreachable!()
		}
	}
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

	fn encode_directory(entries: &[(u64, u32, u64, u64)]) -> Vec<u8> {
		let mut buf = Vec::new();
		encode_varint(entries.len() as u64, &mut buf);
		let mut prev_id = 0u64;
		for (id, _, _, _) in entries {
			encode_varint(id - prev_id, &mut buf);
			prev_id = *id;
		}
		for (_, run, _, _) in entries {
			encode_varint(*run as u64, &mut buf);
		}
		for (_, _, len, _) in entries {
			encode_varint(*len, &mut buf);
		}
		let mut prev_end: Option<u64> = None;
		for (_, _, len, offset) in entries {
			let raw = match prev_end {
				Some(end) if end == *offset => 0,
				_ => offset + 1,
			};
			encode_varint(raw, &mut buf);
			prev_end = Some(offset + len);
		}
		buf
	}

	#[test]
	fn roundtrips_simple_directory() {
		let entries = [(0u64, 1u32, 100u64, 0u64), (1, 1, 50, 100), (5, 0, 30, 150)];
		let bytes = encode_directory(&entries);
		let dir = Directory::parse(&bytes).unwrap();
		assert_eq!(dir.find(0).unwrap().offset, 0);
		assert_eq!(dir.find(1).unwrap().offset, 100);
	}

	#[test]
	fn find_covers_run_length_ranges() {
		let entries = [(10u64, 5u32, 100u64, 0u64)];
		let dir = Directory::from_entries(entries.iter().map(|&(tile_id, run_length, length, offset)| Entry { tile_id, run_length, length, offset }).collect());
		assert!(dir.find(12).is_some());
		assert!(dir.find(15).is_none());
		assert!(dir.find(9).is_none());
	}

	#[test]
	fn leaf_pointer_matches_any_tile_id_at_or_above() {
		let entries = [(10u64, 0u32, 64u64, 0u64)];
		let dir = Directory::from_entries(entries.iter().map(|&(tile_id, run_length, length, offset)| Entry { tile_id, run_length, length, offset }).collect());
		assert_eq!(dir.find(10_000).unwrap().tile_id, 10);
	}
}
