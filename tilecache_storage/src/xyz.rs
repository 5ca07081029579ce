//! XYZ-on-disk backend (§4.E): tiles live at `<root>/<z>/<x>/<y>.<format>`;
//! a companion SQLite `md5s` index supports hash/created extra-info queries
//! without scanning millions of files. Grounded on the MBTiles reader/
//! writer's r2d2/SQLite conventions applied to a slimmer index table, and
//! on `tilecache_core::filelock` for the on-disk writes themselves.

use crate::sqlite_support::{open_pool, spawn_blocking};
use crate::traits::{ExtraInfoKind, ExtraInfoValue, MetadataPatch, StorageBackend, StorageError};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use r2d2_sqlite::rusqlite::{OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tilecache_core::filelock::{create_file_with_lock, remove_file_with_lock};
use tilecache_core::format::{calculate_md5, is_fully_transparent_png, sniff};
use tilecache_core::protobuf::sniff_vector_layer_names;
use tilecache_core::types::{BBox, Coverage, TileCoord, TileFormat, TileJson, TileScheme};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct XyzBackend {
	root: PathBuf,
	index_pool: Pool<SqliteConnectionManager>,
}

impl XyzBackend {
	/// `root` is the tile directory; the sibling index lives at
	/// `<root's parent>/<root's file name>.sqlite`, matching §6's persisted
	/// state layout (`<id>.sqlite` beside `<z>/<x>/<y>.<format>`).
	pub async fn open(root: PathBuf, create_if_missing: bool, timeout: Duration) -> Result<Self> {
		if !create_if_missing {
			anyhow::ensure!(root.exists(), "NotFound: xyz root {root:?} does not exist");
		}
		tokio::fs::create_dir_all(&root).await.with_context(|| format!("creating xyz root {root:?}"))?;
		let index_path = index_path_for(&root);
		let index_pool = open_pool(&index_path, timeout)?;
		spawn_blocking(move || -> Result<Pool<SqliteConnectionManager>> {
			let conn = index_pool.get()?;
			conn.execute_batch(
				"CREATE TABLE IF NOT EXISTS md5s (
					zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER,
					hash TEXT, created BIGINT,
					UNIQUE (zoom_level, tile_column, tile_row)
				 );",
			)?;
			Ok(index_pool)
		})
		.await
		.map(|index_pool| XyzBackend { root, index_pool })
	}

	fn tile_path(&self, coord: TileCoord, ext: &str) -> PathBuf {
		self.root.join(coord.z.to_string()).join(coord.x.to_string()).join(format!("{}.{ext}", coord.y))
	}

	/// The path this tile is stored at is not known ahead of format
	/// detection; tries every recognized extension in turn.
	fn existing_tile_path(&self, coord: TileCoord) -> Option<PathBuf> {
		for ext in ["png", "jpeg", "jpg", "webp", "gif", "pbf"] {
			let path = self.tile_path(coord, ext);
			if path.exists() {
				return Some(path);
			}
		}
		None
	}

	fn metadata_path(&self) -> PathBuf {
		self.root.join("metadata.json")
	}

	/// The root tile directory (§6 `/datas/:id/download` streams the whole
	/// tree as a zip for XYZ sources; `/md5` has no single file to hash).
	pub fn root(&self) -> &Path {
		&self.root
	}
}

fn index_path_for(root: &Path) -> PathBuf {
	let file_name = root.file_name().and_then(|s| s.to_str()).unwrap_or("xyz");
	let parent = root.parent().unwrap_or(root);
	parent.join(format!("{file_name}.sqlite"))
}

#[async_trait]
impl StorageBackend for XyzBackend {
	fn scheme(&self) -> TileScheme {
		TileScheme::Xyz
	}

	async fn get_tile(&self, coord: TileCoord) -> Result<Vec<u8>, StorageError> {
		let Some(path) = self.existing_tile_path(coord) else {
			return Err(StorageError::NotFound);
		};
		tokio::fs::read(&path).await.map_err(|err| StorageError::Other(anyhow!(err).context(format!("reading {path:?}"))))
	}

	async fn put_tile(&self, coord: TileCoord, bytes: &[u8], store_transparent: bool) -> Result<()> {
		let sniffed = sniff(bytes)?;
		if !store_transparent && is_fully_transparent_png(sniffed.format == TileFormat::Png, bytes) {
			return Ok(());
		}
		let path = self.tile_path(coord, sniffed.format.extension());
		create_file_with_lock(&path, bytes, LOCK_TIMEOUT).await?;

		let hash = calculate_md5(bytes);
		let created = now_millis();
		let pool = self.index_pool.clone();
		spawn_blocking(move || -> Result<()> {
			let conn = pool.get()?;
			conn.execute(
				"INSERT INTO md5s (zoom_level, tile_column, tile_row, hash, created) VALUES (?1, ?2, ?3, ?4, ?5)
				 ON CONFLICT (zoom_level, tile_column, tile_row) DO UPDATE SET hash = excluded.hash, created = excluded.created",
				params![coord.z, coord.x, coord.y, hash, created],
			)?;
			Ok(())
		})
		.await
	}

	async fn remove_tile(&self, coord: TileCoord) -> Result<()> {
		// File and index row are removed in parallel (§4.E).
		let file_removal = async {
			if let Some(path) = self.existing_tile_path(coord) {
				remove_file_with_lock(&path, LOCK_TIMEOUT).await?;
			}
			Ok::<(), anyhow::Error>(())
		};
		let pool = self.index_pool.clone();
		let index_removal = spawn_blocking(move || -> Result<()> {
			let conn = pool.get()?;
			conn.execute(
				"DELETE FROM md5s WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
				params![coord.z, coord.x, coord.y],
			)?;
			Ok(())
		});
		let (a, b) = tokio::join!(file_removal, index_removal);
		a?;
		b?;
		Ok(())
	}

	async fn get_metadata(&self) -> Result<TileJson> {
		let mut tile_json = match tokio::fs::read(self.metadata_path()).await {
			Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
			Err(_) => TileJson::default(),
		};

		let pool = self.index_pool.clone();
		let (z0, z1): (Option<u8>, Option<u8>) = spawn_blocking(move || -> Result<(Option<u8>, Option<u8>)> {
			let conn = pool.get()?;
			Ok(conn.query_row("SELECT MIN(zoom_level), MAX(zoom_level) FROM md5s", [], |row| {
				Ok((row.get(0)?, row.get(1)?))
			})?)
		})
		.await?;

		if tile_json.bounds.is_none() {
			if let (Some(z0), Some(z1)) = (z0, z1) {
				tile_json.minzoom = z0;
				tile_json.maxzoom = z1;
				if let Some(bbox) = self.derive_bounds(z0).await.ok() {
					tile_json.bounds = Some(bbox.as_array());
				}
			}
		}

		if tile_json.format.is_none() || (tile_json.format == Some(TileFormat::Pbf) && tile_json.vector_layers.is_none()) {
			if let Some(zoom) = z0.filter(|_| z1.is_some()) {
				if let Some(sample) = self.sample_tile(zoom).await {
					if tile_json.format.is_none() {
						if let Ok(sniffed) = sniff(&sample) {
							tile_json.format = Some(sniffed.format);
						}
					}
					if tile_json.format == Some(TileFormat::Pbf) && tile_json.vector_layers.is_none() {
						tile_json.vector_layers = sniff_vector_layer_names(&sample).ok().filter(|v| !v.is_empty());
					}
				}
			}
		}

		tile_json.fill_missing_center();
		Ok(tile_json)
	}

	async fn update_metadata(&self, patch: MetadataPatch) -> Result<()> {
		let mut tile_json: TileJson = match tokio::fs::read(self.metadata_path()).await {
			Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
			Err(_) => TileJson::default(),
		};
		if let Some(v) = patch.name {
			tile_json.name = Some(v);
		}
		if let Some(v) = patch.description {
			tile_json.description = Some(v);
		}
		if let Some(v) = patch.attribution {
			tile_json.attribution = Some(v);
		}
		if let Some(v) = patch.version {
			tile_json.version = Some(v);
		}
		if let Some(v) = patch.format {
			tile_json.format = Some(v);
		}
		if let Some(v) = patch.minzoom {
			tile_json.minzoom = v;
		}
		if let Some(v) = patch.maxzoom {
			tile_json.maxzoom = v;
		}
		if let Some(v) = patch.bounds {
			tile_json.bounds = Some(v);
		}
		if let Some(v) = patch.center {
			tile_json.center = Some(v);
		}
		if let Some(v) = patch.vector_layers {
			tile_json.vector_layers = Some(v);
		}
		let bytes = serde_json::to_vec_pretty(&tile_json)?;
		create_file_with_lock(&self.metadata_path(), &bytes, LOCK_TIMEOUT).await
	}

	async fn count_tiles(&self) -> Result<u64> {
		let pool = self.index_pool.clone();
		spawn_blocking(move || -> Result<u64> {
			let conn = pool.get()?;
			Ok(conn.query_row("SELECT COUNT(*) FROM md5s", [], |row| row.get::<_, i64>(0))? as u64)
		})
		.await
	}

	async fn size_bytes(&self) -> Result<u64> {
		let mut total = 0u64;
		let mut stack = vec![self.root.clone()];
		while let Some(dir) = stack.pop() {
			let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { continue };
			while let Ok(Some(entry)) = entries.next_entry().await {
				let Ok(metadata) = entry.metadata().await else { continue };
				if metadata.is_dir() {
					stack.push(entry.path());
				} else {
					total += metadata.len();
				}
			}
		}
		Ok(total)
	}

	async fn get_extra_info_for_coverages(&self, coverage: &Coverage, kind: ExtraInfoKind) -> Result<HashMap<String, ExtraInfoValue>> {
		let pool = self.index_pool.clone();
		let expanded = tilecache_core::types::tile_bounds(coverage, TileScheme::Xyz)?;
		let rects = expanded.tile_bounds.clone();
		let column = match kind {
			ExtraInfoKind::Hash => "hash",
			ExtraInfoKind::Created => "created",
		};
		spawn_blocking(move || -> Result<HashMap<String, ExtraInfoValue>> {
			let conn = pool.get()?;
			let mut result = HashMap::new();
			for rect in rects {
				let sql = format!(
					"SELECT zoom_level, tile_column, tile_row, {column} FROM md5s
					 WHERE zoom_level = ?1 AND tile_column BETWEEN ?2 AND ?3 AND tile_row BETWEEN ?4 AND ?5"
				);
				let mut stmt = conn.prepare(&sql)?;
				let mut rows = stmt.query(params![rect.zoom, rect.x[0], rect.x[1], rect.y[0], rect.y[1]])?;
				while let Some(row) = rows.next()? {
					let z: u8 = row.get(0)?;
					let x: u32 = row.get(1)?;
					let y: u32 = row.get(2)?;
					let key = format!("{z}/{x}/{y}");
					match kind {
						ExtraInfoKind::Hash => {
							if let Some(hash) = row.get::<_, Option<String>>(3)? {
								result.insert(key, ExtraInfoValue::Hash(hash));
							}
						}
						ExtraInfoKind::Created => {
							if let Some(created) = row.get::<_, Option<i64>>(3)? {
								result.insert(key, ExtraInfoValue::Created(created));
							}
						}
					}
				}
			}
			Ok(result)
		})
		.await
	}

	async fn calculate_extra_info(&self) -> Result<()> {
		// XYZ tiles are hashed on write; a rescan only has work to do for
		// rows that predate the md5 sidecar (hash IS NULL), matching the
		// MBTiles behavior of §4.E.
		let pool = self.index_pool.clone();
		let root = self.root.clone();
		spawn_blocking(move || -> Result<()> {
			loop {
				let conn = pool.get()?;
				let mut stmt = conn.prepare("SELECT zoom_level, tile_column, tile_row FROM md5s WHERE hash IS NULL LIMIT 1000")?;
				let rows: Vec<(u8, u32, u32)> = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?.collect::<Result<_, _>>()?;
				if rows.is_empty() {
					return Ok(());
				}
				let transaction = conn.unchecked_transaction()?;
				for (z, x, y) in &rows {
					let mut found = None;
					for ext in ["png", "jpeg", "jpg", "webp", "gif", "pbf"] {
						let path = root.join(z.to_string()).join(x.to_string()).join(format!("{y}.{ext}"));
						if let Ok(bytes) = std::fs::read(&path) {
							found = Some(bytes);
							break;
						}
					}
					let Some(bytes) = found else { continue };
					let hash = calculate_md5(&bytes);
					transaction.execute(
						"UPDATE md5s SET hash = ?1, created = ?2 WHERE zoom_level = ?3 AND tile_column = ?4 AND tile_row = ?5",
						params![hash, now_millis(), z, x, y],
					)?;
				}
				transaction.commit()?;
			}
		})
		.await
	}

	async fn add_overviews(&self, concurrency: usize, tile_size: u32) -> Result<()> {
		crate::overviews::add_overviews_generic(self, concurrency, tile_size).await?;
		self.prune_empty_dirs().await
	}
}

impl XyzBackend {
	async fn derive_bounds(&self, zoom: u8) -> Result<BBox> {
		let pool = self.index_pool.clone();
		let (x0, x1, y0, y1): (u32, u32, u32, u32) = spawn_blocking(move || -> Result<(u32, u32, u32, u32)> {
			let conn = pool.get()?;
			Ok(conn.query_row(
				"SELECT MIN(tile_column), MAX(tile_column), MIN(tile_row), MAX(tile_row) FROM md5s WHERE zoom_level = ?1",
				params![zoom],
				|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
			)?)
		})
		.await?;
		tilecache_core::types::bbox_from_tiles(x0, y0, x1, y1, zoom, TileScheme::Xyz)
	}

	async fn sample_tile(&self, zoom: u8) -> Option<Vec<u8>> {
		let pool = self.index_pool.clone();
		let coord: Option<(u8, u32, u32)> = spawn_blocking(move || -> Result<Option<(u8, u32, u32)>> {
			let conn = pool.get()?;
			Ok(conn
				.query_row("SELECT zoom_level, tile_column, tile_row FROM md5s WHERE zoom_level = ?1 LIMIT 1", params![zoom], |row| {
					Ok((row.get(0)?, row.get(1)?, row.get(2)?))
				})
				.optional()
				.ok()
				.flatten())
		})
		.await
		.ok()
		.flatten();
		let (z, x, y) = coord?;
		self.existing_tile_path(TileCoord { z, x, y }).and_then(|path| std::fs::read(path).ok())
	}

	/// Prunes now-empty parent directories after an export/overview run
	/// (§4.G step 6), walking bottom-up under `<root>/<z>/<x>/`.
	pub async fn prune_empty_dirs(&self) -> Result<()> {
		let mut stack = vec![self.root.clone()];
		let mut dirs = Vec::new();
		while let Some(dir) = stack.pop() {
			let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { continue };
			let mut has_children = false;
			while let Ok(Some(entry)) = entries.next_entry().await {
				has_children = true;
				if entry.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
					stack.push(entry.path());
				}
			}
			if has_children {
				dirs.push(dir);
			}
		}
		// Remove deepest directories first so a parent empties out once its
		// children are gone.
		dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
		for dir in dirs {
			if dir == self.root {
				continue;
			}
			let is_empty = tokio::fs::read_dir(&dir).await.map(|mut e| matches!(e.next_entry().await, Ok(None))).unwrap_or(false);
			if is_empty {
				let _ = tokio::fs::remove_dir(&dir).await;
			}
		}
		Ok(())
	}
}

fn now_millis() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
	use super::*;

	fn png() -> Vec<u8> {
		let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		bytes
	}

	async fn open_temp() -> (tempfile::TempDir, XyzBackend) {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().join("caches/xyzs/osm");
		let backend = XyzBackend::open(root, true, Duration::from_secs(1)).await.unwrap();
		(dir, backend)
	}

	#[tokio::test]
	async fn put_writes_file_and_index_row() {
		let (_dir, backend) = open_temp().await;
		let coord = TileCoord::new(3, 4, 5).unwrap();
		backend.put_tile(coord, &png(), true).await.unwrap();
		assert_eq!(backend.get_tile(coord).await.unwrap(), png());
		let info = backend.get_extra_info_for_coverages(&Coverage::single(3, BBox::new(-180.0, -85.0, 180.0, 85.0).unwrap()), ExtraInfoKind::Hash).await.unwrap();
		assert!(!info.is_empty());
	}

	#[tokio::test]
	async fn remove_deletes_file_and_row() {
		let (_dir, backend) = open_temp().await;
		let coord = TileCoord::new(3, 4, 5).unwrap();
		backend.put_tile(coord, &png(), true).await.unwrap();
		backend.remove_tile(coord).await.unwrap();
		assert!(matches!(backend.get_tile(coord).await, Err(StorageError::NotFound)));
	}

	#[tokio::test]
	async fn scheme_is_xyz() {
		let (_dir, backend) = open_temp().await;
		assert_eq!(backend.scheme(), TileScheme::Xyz);
	}
}
