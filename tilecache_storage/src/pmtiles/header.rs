//! PMTiles v3 127-byte header, byte-for-byte per the teacher's
//! `versatiles_container::container::pmtiles::types::header_v3::HeaderV3`.
//! Only v3 is supported; v1/v2 (distinct magic bytes) are rejected.

use anyhow::{Result, bail, ensure};
use tilecache_core::types::TileFormat;

const MAGIC: &[u8; 7] = b"PMTiles";
const VERSION: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
	Unknown,
	None,
	Gzip,
	Brotli,
	Zstd,
}

impl Compression {
	fn from_byte(byte: u8) -> Result<Self> {
		Ok(match byte {
			0 => Compression::Unknown,
			1 => Compression::None,
			2 => Compression::Gzip,
			3 => Compression::Brotli,
			4 => Compression::Zstd,
			other => bail!("pmtiles: unrecognized compression byte {other}"),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmTileType {
	Unknown,
	Mvt,
	Png,
	Jpeg,
	Webp,
	Avif,
}

impl PmTileType {
	fn from_byte(byte: u8) -> Result<Self> {
		Ok(match byte {
			0 => PmTileType::Unknown,
			1 => PmTileType::Mvt,
			2 => PmTileType::Png,
			3 => PmTileType::Jpeg,
			4 => PmTileType::Webp,
			5 => PmTileType::Avif,
			other => bail!("pmtiles: unrecognized tile type byte {other}"),
		})
	}

	pub fn to_tile_format(self) -> Option<TileFormat> {
		match self {
			PmTileType::Mvt => Some(TileFormat::Pbf),
			PmTileType::Png => Some(TileFormat::Png),
			PmTileType::Jpeg => Some(TileFormat::Jpeg),
			PmTileType::Webp => Some(TileFormat::Webp),
			PmTileType::Avif | PmTileType::Unknown => None,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
	pub root_dir_offset: u64,
	pub root_dir_length: u64,
	pub metadata_offset: u64,
	pub metadata_length: u64,
	pub leaf_dirs_offset: u64,
	pub leaf_dirs_length: u64,
	pub tile_data_offset: u64,
	pub tile_data_length: u64,
	pub addressed_tiles_count: u64,
	pub tile_entries_count: u64,
	pub tile_contents_count: u64,
	pub clustered: bool,
	pub internal_compression: Compression,
	pub tile_compression: Compression,
	pub tile_type: PmTileType,
	pub min_zoom: u8,
	pub max_zoom: u8,
	pub min_lon_e7: i32,
	pub min_lat_e7: i32,
	pub max_lon_e7: i32,
	pub max_lat_e7: i32,
	pub center_zoom: u8,
	pub center_lon_e7: i32,
	pub center_lat_e7: i32,
}

impl Header {
	pub const LEN: u64 = 127;

	pub fn parse(bytes: &[u8]) -> Result<Self> {
		ensure!(bytes.len() as u64 >= Self::LEN, "pmtiles: header shorter than 127 bytes");
		ensure!(&bytes[0..7] == MAGIC, "pmtiles: bad magic bytes");
		ensure!(bytes[7] == VERSION, "pmtiles: only spec version 3 is supported, found {}", bytes[7]);

		let u64_at = |offset: usize| u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
		let i32_at = |offset: usize| i32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());

		Ok(Header {
			root_dir_offset: u64_at(8),
			root_dir_length: u64_at(16),
			metadata_offset: u64_at(24),
			metadata_length: u64_at(32),
			leaf_dirs_offset: u64_at(40),
			leaf_dirs_length: u64_at(48),
			tile_data_offset: u64_at(56),
			tile_data_length: u64_at(64),
			addressed_tiles_count: u64_at(72),
			tile_entries_count: u64_at(80),
			tile_contents_count: u64_at(88),
			clustered: bytes[96] == 1,
			internal_compression: Compression::from_byte(bytes[97])?,
			tile_compression: Compression::from_byte(bytes[98])?,
			tile_type: PmTileType::from_byte(bytes[99])?,
			min_zoom: bytes[100],
			max_zoom: bytes[101],
			min_lon_e7: i32_at(102),
			min_lat_e7: i32_at(106),
			max_lon_e7: i32_at(110),
			max_lat_e7: i32_at(114),
			center_zoom: bytes[118],
			center_lon_e7: i32_at(119),
			center_lat_e7: i32_at(123),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_header_bytes() -> Vec<u8> {
		let mut bytes = vec![0u8; Header::LEN as usize];
		bytes[0..7].copy_from_slice(MAGIC);
		bytes[7] = VERSION;
		bytes[97] = 2; // internal compression: gzip
		bytes[98] = 2; // tile compression: gzip
		bytes[99] = 1; // tile type: mvt
		bytes[100] = 0;
		bytes[101] = 14;
		bytes
	}

	#[test]
	fn parses_magic_and_version() {
		let header = Header::parse(&sample_header_bytes()).unwrap();
		assert_eq!(header.max_zoom, 14);
		assert_eq!(header.tile_type, PmTileType::Mvt);
		assert_eq!(header.internal_compression, Compression::Gzip);
	}

	#[test]
	fn rejects_bad_magic() {
		let mut bytes = sample_header_bytes();
		bytes[0] = b'X';
		assert!(Header::parse(&bytes).is_err());
	}

	#[test]
	fn rejects_unsupported_version() {
		let mut bytes = sample_header_bytes();
		bytes[7] = 1;
		assert!(Header::parse(&bytes).is_err());
	}
}
