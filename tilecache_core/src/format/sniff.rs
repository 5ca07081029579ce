use crate::types::TileFormat;
use anyhow::{Result, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;

/// The outcome of sniffing a tile buffer's magic bytes (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffedTile {
	pub format: TileFormat,
	pub content_type: &'static str,
	pub content_encoding: Option<&'static str>,
}

/// Sniffs `bytes` by magic number. Raw (non-gzipped) `pbf` is flagged with
/// `content-encoding: gzip` since it is gzipped before being placed on the
/// wire (§4.C) — callers that forward this buffer to the wire must run it
/// through [`gzip_encode`] first, or the header is a lie. An already-gzipped
/// buffer is recognized as `pbf` too, since gzip is otherwise only ever used
/// to wrap vector tiles in this system, and is passed through unchanged.
pub fn sniff(bytes: &[u8]) -> Result<SniffedTile> {
	if bytes.is_empty() {
		bail!("BadRequest: cannot sniff an empty buffer");
	}

	if bytes.len() >= 2 && bytes[0] == 0x1F && bytes[1] == 0x8B {
		return Ok(SniffedTile { format: TileFormat::Pbf, content_type: TileFormat::Pbf.content_type(), content_encoding: Some("gzip") });
	}
	if bytes.len() >= 8 && bytes[0..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
		return Ok(SniffedTile { format: TileFormat::Png, content_type: TileFormat::Png.content_type(), content_encoding: None });
	}
	if bytes.len() >= 3 && bytes[0..3] == [0xFF, 0xD8, 0xFF] {
		return Ok(SniffedTile { format: TileFormat::Jpeg, content_type: TileFormat::Jpeg.content_type(), content_encoding: None });
	}
	if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
		return Ok(SniffedTile { format: TileFormat::Webp, content_type: TileFormat::Webp.content_type(), content_encoding: None });
	}
	if bytes.len() >= 4 && &bytes[0..4] == b"GIF8" {
		return Ok(SniffedTile { format: TileFormat::Gif, content_type: TileFormat::Gif.content_type(), content_encoding: None });
	}

	// Falls through to raw varint-framed protobuf: a valid MVT tile starts
	// with a field tag whose wire type is 2 (length-delimited), i.e. the low
	// 3 bits of the first byte are 0b010.
	if bytes[0] & 0x07 == 2 {
		return Ok(SniffedTile { format: TileFormat::Pbf, content_type: TileFormat::Pbf.content_type(), content_encoding: Some("gzip") });
	}

	bail!("BadRequest: unrecognized tile format (unknown magic bytes)")
}

/// Gzip-compresses `bytes` at the default compression level, honoring the
/// `content-encoding: gzip` promise [`sniff`] makes for raw (non-gzip-magic)
/// `pbf` buffers. A no-op in spirit for bytes that are already gzip-magic —
/// callers should check that first, since double-gzipping would still
/// round-trip but is wasted work.
pub fn gzip_encode(bytes: &[u8]) -> Result<Vec<u8>> {
	let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
	encoder.write_all(bytes)?;
	Ok(encoder.finish()?)
}

/// Whether `bytes` already carries the gzip magic header.
pub fn is_gzip_magic(bytes: &[u8]) -> bool {
	bytes.len() >= 2 && bytes[0] == 0x1F && bytes[1] == 0x8B
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sniffs_png() {
		let bytes = [0x89u8, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
		assert_eq!(sniff(&bytes).unwrap().format, TileFormat::Png);
	}

	#[test]
	fn sniffs_jpeg() {
		let bytes = [0xFFu8, 0xD8, 0xFF, 0xE0];
		assert_eq!(sniff(&bytes).unwrap().format, TileFormat::Jpeg);
	}

	#[test]
	fn sniffs_webp() {
		let mut bytes = b"RIFF".to_vec();
		bytes.extend_from_slice(&[0, 0, 0, 0]);
		bytes.extend_from_slice(b"WEBP");
		assert_eq!(sniff(&bytes).unwrap().format, TileFormat::Webp);
	}

	#[test]
	fn sniffs_gzipped_pbf_with_gzip_encoding() {
		let bytes = [0x1Fu8, 0x8B, 0x08, 0x00];
		let sniffed = sniff(&bytes).unwrap();
		assert_eq!(sniffed.format, TileFormat::Pbf);
		assert_eq!(sniffed.content_encoding, Some("gzip"));
	}

	#[test]
	fn empty_buffer_errors() {
		assert!(sniff(&[]).is_err());
	}

	#[test]
	fn gzip_encode_produces_gzip_magic_and_decompresses_back() {
		let raw = b"\x1a\x02key".to_vec(); // a field-2 length-delimited tag, not real MVT but enough to round-trip
		let compressed = gzip_encode(&raw).unwrap();
		assert!(is_gzip_magic(&compressed));
		let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
		let mut back = Vec::new();
		std::io::Read::read_to_end(&mut decoder, &mut back).unwrap();
		assert_eq!(back, raw);
	}

	#[test]
	fn already_gzipped_bytes_are_recognized() {
		let bytes = [0x1Fu8, 0x8B, 0x08, 0x00];
		assert!(is_gzip_magic(&bytes));
	}
}
