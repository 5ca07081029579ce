//! Seed / cleanup driver (§4.H): bulk population and pruning jobs declared
//! in a seed document, run either from the CLI's `seed` subcommand or
//! dispatched programmatically by an external scheduler collaborator (cron,
//! IPC). Single-flight per source id is enforced through the same
//! [`crate::cancel::RunSlot`] an export uses, so a running seed and a
//! running export for the same id conflict with each other, not just with
//! themselves.

use crate::exporter::{ExportConfig, RefreshPolicy, run_export};
use crate::registry::Registry;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tilecache_core::concurrency::{Progress, run_bounded};
use tilecache_core::error::CoreError;
use tilecache_core::types::{Coverage, tile_bounds};
use tilecache_storage::{SourceType, StorageBackend};

/// Loosely typed `refreshBefore` as it appears in the seed document, mapped
/// to [`RefreshPolicy`] once at entry-construction time, the same resolution
/// §4.G applies to the exporter's own `refreshBefore` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RefreshBeforeRaw {
	Date(chrono::DateTime<chrono::Utc>),
	Days(u32),
	Bool(bool),
}

impl RefreshBeforeRaw {
	fn into_policy(self) -> RefreshPolicy {
		match self {
			RefreshBeforeRaw::Date(dt) => RefreshPolicy::Before(dt),
			RefreshBeforeRaw::Days(days) => RefreshPolicy::OlderThanDays(days),
			RefreshBeforeRaw::Bool(true) => RefreshPolicy::Md5Compare,
			RefreshBeforeRaw::Bool(false) => RefreshPolicy::Always,
		}
	}
}

/// One declared seed job: export `id`'s own resolver output into a target
/// backend across `coverage` (§4.H "invokes exporters").
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
	pub id: String,
	pub target_type: SourceType,
	pub target_path: String,
	pub coverage: Coverage,
	#[serde(default = "default_concurrency")]
	pub concurrency: usize,
	#[serde(default = "default_true")]
	pub store_transparent: bool,
	#[serde(default)]
	pub refresh_before: Option<RefreshBeforeRaw>,
}

fn default_concurrency() -> usize {
	4
}
fn default_true() -> bool {
	true
}

/// One declared cleanup job: remove every tile in `coverage` from `id`'s
/// own storage (§4.H "invokes... removeTile").
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupEntry {
	pub id: String,
	pub coverage: Coverage,
	#[serde(default = "default_concurrency")]
	pub concurrency: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedDoc {
	#[serde(default)]
	pub seeds: Vec<SeedEntry>,
	#[serde(default)]
	pub cleanups: Vec<CleanupEntry>,
}

impl SeedDoc {
	pub fn from_path(path: &std::path::Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).with_context(|| format!("reading seed document {path:?}"))?;
		Ok(serde_yaml_ng::from_str(&text)?)
	}
}

/// Runs one seed entry, rejecting with `CoreError::Conflict` if `id` already
/// has an export or seed running (§7 `Conflict`, §4.H single-flight).
pub async fn run_seed_entry(registry: Arc<Registry>, entry: &SeedEntry) -> Result<crate::exporter::ExportSummary> {
	let data_source = registry.datas.get(&entry.id).map(|e| e.value().clone()).with_context(|| format!("Tile source {:?} does not exist", entry.id))?;
	let Some(cancel) = data_source.run_slot.try_start() else {
		return Err(CoreError::conflict(format!("seed/export already running for {:?}", entry.id)).into());
	};

	let config = ExportConfig {
		target_type: entry.target_type,
		target_path: entry.target_path.clone(),
		metadata_patch: tilecache_storage::MetadataPatch::default(),
		coverage: entry.coverage.clone(),
		concurrency: entry.concurrency,
		store_transparent: entry.store_transparent,
		refresh: entry.refresh_before.clone().map(RefreshBeforeRaw::into_policy).unwrap_or(RefreshPolicy::Always),
	};

	let result = run_export(registry, &entry.id, config, cancel).await;
	data_source.run_slot.finish();
	result
}

/// Runs one cleanup entry, single-flighted the same way as a seed (§4.H).
pub async fn run_cleanup_entry(registry: Arc<Registry>, entry: &CleanupEntry) -> Result<u64> {
	let data_source = registry.datas.get(&entry.id).map(|e| e.value().clone()).with_context(|| format!("Tile source {:?} does not exist", entry.id))?;
	let Some(cancel) = data_source.run_slot.try_start() else {
		return Err(CoreError::conflict(format!("seed/export already running for {:?}", entry.id)).into());
	};

	let expanded = tile_bounds(&entry.coverage, data_source.source.scheme())?;
	let coords: Vec<_> = expanded.tile_bounds.iter().flat_map(|rect| rect.iter_coords()).collect();
	let total = coords.len() as u64;
	let progress = Arc::new(Progress::default());

	run_bounded(coords, entry.concurrency, cancel.clone(), progress.clone(), {
		let data_source = data_source.clone();
		move |coord, _progress| {
			let data_source = data_source.clone();
			async move { data_source.source.remove_tile(coord).await }
		}
	})
	.await;

	data_source.run_slot.finish();
	log::info!("cleanup {}: removed up to {total} tiles", entry.id);
	Ok(total)
}

/// One driver pass: runs every seed then every cleanup in the document,
/// continuing past individual failures (logged) the same way the exporter
/// continues past a single bad tile (§7 "a single bad tile does not abort
/// the batch").
pub async fn run_all(registry: Arc<Registry>, doc: &SeedDoc) {
	for entry in &doc.seeds {
		match run_seed_entry(registry.clone(), entry).await {
			Ok(summary) => log::info!("seed {} done: {summary:?}", entry.id),
			Err(err) => log::error!("seed {} failed: {err:#}", entry.id),
		}
	}
	for entry in &doc.cleanups {
		match run_cleanup_entry(registry.clone(), entry).await {
			Ok(count) => log::info!("cleanup {} done: {count} tiles", entry.id),
			Err(err) => log::error!("cleanup {} failed: {err:#}", entry.id),
		}
	}
}

/// Cancels a running seed/export for `id`, mirroring `/datas/:id/export?cancel=true`
/// (§6) for the CLI/driver path.
pub fn request_cancel(registry: &Registry, id: &str) -> bool {
	registry.datas.get(id).map(|e| e.run_slot.request_cancel()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::registry::{DataEntry, RegistryDoc};

	async fn registry_with_source(dir: &std::path::Path, id: &str) -> Arc<Registry> {
		let config = Config { data_dir: dir.to_path_buf(), postgresql_base_uri: None, serve_front_page: true, serve_swagger: true, service_name: "t".into() };
		let doc = RegistryDoc {
			datas: vec![DataEntry { id: id.into(), mbtiles: Some(format!("{id}.mbtiles")), pmtiles: None, xyz: None, pg: None, cache: None }],
			..Default::default()
		};
		Arc::new(Registry::load(config, &doc).await.unwrap())
	}

	#[test]
	fn refresh_before_bool_true_is_md5_compare() {
		assert!(matches!(RefreshBeforeRaw::Bool(true).into_policy(), RefreshPolicy::Md5Compare));
	}

	#[test]
	fn refresh_before_bool_false_is_always() {
		assert!(matches!(RefreshBeforeRaw::Bool(false).into_policy(), RefreshPolicy::Always));
	}

	#[tokio::test]
	async fn cleanup_removes_tiles_in_coverage() {
		let dir = tempfile::tempdir().unwrap();
		let registry = registry_with_source(dir.path(), "osm").await;
		let coord = tilecache_core::types::TileCoord::new(2, 1, 1).unwrap();
		let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		registry.datas.get("osm").unwrap().source.put_tile(coord, &bytes, true).await.unwrap();

		let entry = CleanupEntry {
			id: "osm".into(),
			coverage: Coverage::single(2, tilecache_core::types::BBox::new(-180.0, -85.0, 180.0, 85.0).unwrap()),
			concurrency: 2,
		};
		run_cleanup_entry(registry.clone(), &entry).await.unwrap();
		assert!(matches!(registry.datas.get("osm").unwrap().source.get_tile(coord).await, Err(tilecache_storage::StorageError::NotFound)));
	}

	#[tokio::test]
	async fn second_seed_for_same_id_conflicts() {
		let dir = tempfile::tempdir().unwrap();
		let registry = registry_with_source(dir.path(), "osm").await;
		let data_source = registry.datas.get("osm").unwrap().value().clone();
		let held = data_source.run_slot.try_start().unwrap();

		let entry = SeedEntry {
			id: "osm".into(),
			target_type: SourceType::Mbtiles,
			target_path: dir.path().join("target.mbtiles").to_string_lossy().into_owned(),
			coverage: Coverage::single(2, tilecache_core::types::BBox::new(-1.0, -1.0, 1.0, 1.0).unwrap()),
			concurrency: 2,
			store_transparent: true,
			refresh_before: None,
		};
		let result = run_seed_entry(registry.clone(), &entry).await;
		assert!(result.is_err());
		data_source.run_slot.finish();
		let _ = held;
	}
}
