//! Resolver / cache-forward policy (§4.F): for a registered source, try
//! storage; on miss, if a cache-forward is configured, fetch upstream with
//! a 30s timeout, write through in the background, and return the fetched
//! bytes either way. The resolver never calls itself recursively (§9
//! "cyclic / recursive resolve") — forward fetches go straight to
//! `reqwest`, never back through another storage backend.

use crate::registry::{FileResource, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tilecache_core::error::CoreError;
use tilecache_core::filelock::create_file_with_lock;
use tilecache_core::format::{gzip_encode, is_gzip_magic, sniff};
use tilecache_core::protobuf::{merge_glyph_ranges, sniff_vector_layer_names};
use tilecache_core::types::{TileCoord, TileFormat, TileScheme};
use tilecache_storage::{StorageBackend, StorageError};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// What a resolved request hands back to the HTTP layer: raw bytes plus
/// enough to set `Content-Type`/`Content-Encoding`.
#[derive(Debug, Clone)]
pub struct ResolvedBytes {
	pub data: Vec<u8>,
	pub content_type: String,
	pub content_encoding: Option<&'static str>,
}

impl ResolvedBytes {
	/// Sniffs `data` and, when the result claims `content-encoding: gzip`
	/// for bytes that aren't already gzip-magic (the raw varint-framed `pbf`
	/// fallback, §4.C), actually gzip-compresses them so the header matches
	/// what's on the wire (spec.md "content-encoding: gzip for raw pbf that
	/// will be gzipped before response").
	fn from_sniffed(data: Vec<u8>) -> Self {
		match sniff(&data) {
			Ok(sniffed) => {
				let data = if sniffed.content_encoding == Some("gzip") && !is_gzip_magic(&data) {
					gzip_encode(&data).unwrap_or(data)
				} else {
					data
				};
				ResolvedBytes { data, content_type: sniffed.content_type.to_string(), content_encoding: sniffed.content_encoding }
			}
			Err(_) => ResolvedBytes { data, content_type: "application/octet-stream".to_string(), content_encoding: None },
		}
	}
}

/// §4.F steps 1-7 for the tile route. `requested_format` is `None` when the
/// caller (e.g. the exporter) doesn't need the format-mismatch check.
pub async fn resolve_tile(registry: &Registry, id: &str, coord: TileCoord, requested_format: Option<TileFormat>) -> Result<ResolvedBytes, CoreError> {
	let entry = registry.datas.get(id).map(|e| e.value().clone()).ok_or_else(|| CoreError::not_found(format!("Tile source {id:?} does not exist")))?;

	match entry.source.get_tile(coord).await {
		Ok(bytes) => return check_format(bytes, requested_format),
		Err(StorageError::NotFound) => {}
		Err(StorageError::Other(err)) => return Err(CoreError::from_anyhow(&err)),
	}

	let Some(cache) = &entry.cache else {
		return Err(CoreError::not_found("Tile does not exist"));
	};

	let y_upstream = if cache.scheme == TileScheme::Tms { TileScheme::flip_y(coord.y, coord.z) } else { coord.y };
	let url = cache
		.source_url
		.replace("{z}", &coord.z.to_string())
		.replace("{x}", &coord.x.to_string())
		.replace("{y}", &y_upstream.to_string());

	let bytes = fetch_upstream(&url, &cache.headers).await?;

	if cache.store_cache {
		let entry = entry.clone();
		let store_transparent = cache.store_transparent;
		let bytes_for_write = bytes.clone();
		tokio::spawn(async move {
			if let Err(err) = entry.source.put_tile(coord, &bytes_for_write, store_transparent).await {
				log::warn!("write-through for {coord:?} failed: {err:#}");
			}
		});
	}

	check_format(bytes, requested_format)
}

fn check_format(bytes: Vec<u8>, requested_format: Option<TileFormat>) -> Result<ResolvedBytes, CoreError> {
	if let Some(requested) = requested_format {
		let sniffed = sniff(&bytes).map_err(|err| CoreError::bad_request(err.to_string()))?;
		if sniffed.format != requested {
			return Err(CoreError::bad_request(format!("Unsupported format: expected {requested:?}, got {:?}", sniffed.format)));
		}
	}
	Ok(ResolvedBytes::from_sniffed(bytes))
}

/// Ensures `pbf` tile metadata always carries `vector_layers`, sampling and
/// decoding one tile when the backend's own metadata lacks it (§3).
pub fn derive_vector_layers_if_missing(format: TileFormat, vector_layers: &mut Option<Vec<String>>, sample: &[u8]) {
	if format == TileFormat::Pbf && vector_layers.is_none() {
		*vector_layers = sniff_vector_layer_names(sample).ok().filter(|v| !v.is_empty());
	}
}

async fn fetch_upstream(url: &str, headers: &HashMap<String, String>) -> Result<Vec<u8>, CoreError> {
	let client = reqwest::Client::new();
	let mut req = client.get(url).timeout(FORWARD_TIMEOUT);
	for (k, v) in headers {
		req = req.header(k.as_str(), v.as_str());
	}
	let resp = req.send().await.map_err(|err| CoreError::timeout(format!("fetching {url}: {err}")))?;
	let status = resp.status();
	// §7 "upstream 204 or 404 during forward is treated as 'no tile available'".
	if status.as_u16() == 204 || status.as_u16() == 404 {
		return Err(CoreError::not_found(format!("upstream {url} has no tile")));
	}
	if !status.is_success() {
		return Err(CoreError::upstream(status.as_u16(), format!("upstream {url} returned {status}")));
	}
	resp.bytes().await.map(|b| b.to_vec()).map_err(|err| CoreError::internal(err.to_string()))
}

/// Resolves a single named file resource (sprites/geojson/style) under the
/// same cache/forward contract as tiles (§4.F "the same contract applies").
/// `relative_name` is the file's path under `resource.root` and, for
/// templates containing `{name}`, also the substitution value.
pub async fn resolve_file(resource: &FileResource, relative_name: &str) -> Result<ResolvedBytes, CoreError> {
	let path = resource.root.join(relative_name);
	if let Ok(bytes) = tokio::fs::read(&path).await {
		return Ok(ResolvedBytes::from_sniffed(bytes));
	}

	let Some(cache) = &resource.cache else {
		return Err(CoreError::not_found(format!("{path:?} does not exist")));
	};

	let url = cache.source_url.replace("{name}", relative_name);
	let bytes = fetch_upstream(&url, &cache.headers).await?;

	if cache.store_cache {
		let path = path.clone();
		let bytes_for_write = bytes.clone();
		tokio::spawn(async move {
			if let Err(err) = create_file_with_lock(&path, &bytes_for_write, LOCK_TIMEOUT).await {
				log::warn!("write-through for {path:?} failed: {err:#}");
			}
		});
	}

	Ok(ResolvedBytes::from_sniffed(bytes))
}

/// Font merge (§4.F "Font merge"): fetches `{range}.pbf` for each
/// comma-separated font id, falling back to a bundled `Open Sans` family
/// chosen by substring match when an id has no registered font, then
/// merges by glyph id (first writer wins, §8).
pub async fn resolve_font_merge(registry: &Registry, ids_csv: &str, range: &str) -> Result<ResolvedBytes, CoreError> {
	let file_name = format!("{range}.pbf");
	let mut pbfs = Vec::new();
	for id in ids_csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
		let resource = registry.fonts.get(id).map(|e| e.value().clone()).or_else(|| pick_fallback_font(registry, id));
		let Some(resource) = resource else {
			continue; // no registered font and no bundled fallback; skip this id.
		};
		match resolve_file(&resource, &file_name).await {
			Ok(resolved) => pbfs.push(resolved.data),
			Err(err) => log::warn!("font range fetch failed for {id:?}: {err}"),
		}
	}
	if pbfs.is_empty() {
		return Err(CoreError::not_found(format!("no font data available for {ids_csv:?}/{range}")));
	}
	let merged = merge_glyph_ranges(&pbfs).map_err(|err| CoreError::internal(err.to_string()))?;
	Ok(ResolvedBytes { data: merged, content_type: "application/x-protobuf".to_string(), content_encoding: None })
}

/// Bundled-family fallback: a requested id missing from the registry
/// substitutes an `Open Sans <weight> <italic>` entry chosen by substring
/// match on weight/style keywords, falling back to plain `Open Sans`.
fn pick_fallback_font(registry: &Registry, requested_id: &str) -> Option<Arc<FileResource>> {
	let lower = requested_id.to_ascii_lowercase();
	let keywords = ["bold", "italic", "light", "medium", "semibold", "black", "condensed"];
	let wanted: Vec<&str> = keywords.iter().copied().filter(|k| lower.contains(k)).collect();

	let candidates: Vec<Arc<FileResource>> = registry.fonts.iter().filter(|e| e.key().to_ascii_lowercase().contains("open sans")).map(|e| e.value().clone()).collect();

	candidates
		.iter()
		.find(|c| {
			let cl = c.id.to_ascii_lowercase();
			!wanted.is_empty() && wanted.iter().all(|w| cl.contains(w))
		})
		.or_else(|| candidates.iter().find(|c| c.id.eq_ignore_ascii_case("open sans regular")))
		.or_else(|| candidates.first())
		.cloned()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn format_mismatch_is_bad_request() {
		let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		let result = check_format(bytes, Some(TileFormat::Jpeg));
		assert!(matches!(result, Err(CoreError::BadRequest(_))));
	}

	#[test]
	fn matching_format_passes_through() {
		let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		let resolved = check_format(bytes, Some(TileFormat::Png)).unwrap();
		assert_eq!(resolved.content_type, "image/png");
	}

	#[test]
	fn raw_pbf_is_actually_gzipped_to_match_its_content_encoding_header() {
		let raw = vec![0x1A, 0x02, 0x01, 0x02]; // field-2 length-delimited tag; sniffs as raw pbf
		let resolved = ResolvedBytes::from_sniffed(raw.clone());
		assert_eq!(resolved.content_encoding, Some("gzip"));
		assert_ne!(resolved.data, raw, "the response body must actually be gzip-compressed, not the raw bytes");
		let mut decoder = flate2::read::GzDecoder::new(resolved.data.as_slice());
		let mut decompressed = Vec::new();
		std::io::Read::read_to_end(&mut decoder, &mut decompressed).unwrap();
		assert_eq!(decompressed, raw);
	}

	#[test]
	fn already_gzipped_pbf_is_passed_through_unchanged() {
		let gzipped = tilecache_core::format::gzip_encode(&[0x1A, 0x02, 0x01, 0x02]).unwrap();
		let resolved = ResolvedBytes::from_sniffed(gzipped.clone());
		assert_eq!(resolved.content_encoding, Some("gzip"));
		assert_eq!(resolved.data, gzipped);
	}
}
