//! PostgreSQL backend (§4.E): one table per tile source, BYTEA tile data,
//! `$1..$n` placeholders, `deadpool-postgres`/`tokio-postgres` pooling. No
//! direct teacher counterpart (`versatiles-rs` never ships a SQL backend);
//! grounded on the teacher's r2d2-pool-per-source shape from
//! `container::mbtiles` and on `deadpool-postgres`'s own `Pool`/`Manager`
//! API, both already workspace dependencies.

use crate::traits::{ExtraInfoKind, ExtraInfoValue, MetadataPatch, StorageBackend, StorageError};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tilecache_core::format::{calculate_md5, is_fully_transparent_png, sniff};
use tilecache_core::protobuf::sniff_vector_layer_names;
use tilecache_core::types::{BBox, Coverage, TileCoord, TileFormat, TileJson, TileJsonType, TileScheme};
use tokio_postgres::NoTls;

/// Identifies one source's table within a shared database, sanitized to the
/// subset of characters Postgres accepts unquoted (callers derive this from
/// the repository id, itself validated at config-load time).
pub struct PostgresBackend {
	pool: Pool,
	table: String,
}

impl PostgresBackend {
	pub async fn open(base_uri: &str, source_id: &str) -> Result<Self> {
		let table = sanitize_table_name(source_id)?;
		let mut config = Config::new();
		config.url = Some(base_uri.to_string());
		config.manager = Some(ManagerConfig { recycling_method: RecyclingMethod::Fast });
		let pool = config.create_pool(Some(Runtime::Tokio1), NoTls).context("building postgres connection pool")?;

		let conn = pool.get().await.context("connecting to postgres")?;
		conn.batch_execute(&format!(
			"CREATE TABLE IF NOT EXISTS {table} (
				zoom_level INTEGER NOT NULL,
				tile_column INTEGER NOT NULL,
				tile_row INTEGER NOT NULL,
				tile_data BYTEA NOT NULL,
				hash TEXT,
				created BIGINT,
				PRIMARY KEY (zoom_level, tile_column, tile_row)
			);
			CREATE TABLE IF NOT EXISTS {table}_metadata (name TEXT PRIMARY KEY, value TEXT);"
		))
		.await
		.with_context(|| format!("creating schema for table {table}"))?;
		for (column, ty) in [("hash", "TEXT"), ("created", "BIGINT")] {
			let _ = conn.batch_execute(&format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column} {ty}")).await;
		}

		Ok(PostgresBackend { pool, table })
	}
}

/// Postgres identifiers this backend generates are always
/// `tiles_<source_id>`; restricting to `[a-z0-9_]` means the identifier
/// never needs quoting and can't be used to inject SQL via table name.
fn sanitize_table_name(source_id: &str) -> Result<String> {
	if source_id.is_empty() || !source_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
		bail!("BadRequest: source id {source_id:?} is not a valid postgres table suffix");
	}
	let sanitized = source_id.replace('-', "_").to_ascii_lowercase();
	Ok(format!("tiles_{sanitized}"))
}

#[async_trait]
impl StorageBackend for PostgresBackend {
	fn scheme(&self) -> TileScheme {
		TileScheme::Xyz
	}

	async fn get_tile(&self, coord: TileCoord) -> Result<Vec<u8>, StorageError> {
		let conn = self.pool.get().await.map_err(|err| StorageError::Other(anyhow!(err)))?;
		let row = conn
			.query_opt(
				&format!("SELECT tile_data FROM {} WHERE zoom_level = $1 AND tile_column = $2 AND tile_row = $3", self.table),
				&[&i32::from(coord.z), &(coord.x as i32), &(coord.y as i32)],
			)
			.await
			.map_err(|err| StorageError::Other(err.into()))?;
		match row {
			Some(row) => Ok(row.get::<_, Vec<u8>>(0)),
			None => Err(StorageError::NotFound),
		}
	}

	async fn put_tile(&self, coord: TileCoord, bytes: &[u8], store_transparent: bool) -> Result<()> {
		let sniffed = sniff(bytes)?;
		if !store_transparent && is_fully_transparent_png(sniffed.format == TileFormat::Png, bytes) {
			return Ok(());
		}
		let hash = calculate_md5(bytes);
		let created = now_millis();
		let conn = self.pool.get().await.context("connecting to postgres")?;
		conn.execute(
			&format!(
				"INSERT INTO {} (zoom_level, tile_column, tile_row, tile_data, hash, created) VALUES ($1, $2, $3, $4, $5, $6)
				 ON CONFLICT (zoom_level, tile_column, tile_row) DO UPDATE SET tile_data = excluded.tile_data, hash = excluded.hash, created = excluded.created",
				self.table
			),
			&[&i32::from(coord.z), &(coord.x as i32), &(coord.y as i32), &bytes, &hash, &created],
		)
		.await
		.context("inserting tile")?;
		Ok(())
	}

	async fn remove_tile(&self, coord: TileCoord) -> Result<()> {
		let conn = self.pool.get().await.context("connecting to postgres")?;
		conn.execute(
			&format!("DELETE FROM {} WHERE zoom_level = $1 AND tile_column = $2 AND tile_row = $3", self.table),
			&[&i32::from(coord.z), &(coord.x as i32), &(coord.y as i32)],
		)
		.await
		.context("deleting tile")?;
		Ok(())
	}

	async fn get_metadata(&self) -> Result<TileJson> {
		let conn = self.pool.get().await.context("connecting to postgres")?;
		let mut tile_json = TileJson::default();
		let rows = conn.query(&format!("SELECT name, value FROM {}_metadata", self.table), &[]).await.context("reading metadata table")?;
		for row in rows {
			apply_metadata_row(&mut tile_json, row.get::<_, String>(0).as_str(), row.get::<_, String>(1).as_str());
		}

		let zoom_row = conn
			.query_opt(&format!("SELECT MIN(zoom_level), MAX(zoom_level) FROM {}", self.table), &[])
			.await
			.context("reading zoom range")?;
		let (z0, z1): (Option<i32>, Option<i32>) = zoom_row.map(|row| (row.get(0), row.get(1))).unwrap_or((None, None));

		if tile_json.bounds.is_none() {
			if let (Some(z0), Some(z1)) = (z0, z1) {
				tile_json.minzoom = z0 as u8;
				tile_json.maxzoom = z1 as u8;
				if let Ok(bbox) = self.derive_bounds(&conn, z0 as u8).await {
					tile_json.bounds = Some(bbox.as_array());
				}
			}
		}

		if tile_json.format.is_none() || (tile_json.format == Some(TileFormat::Pbf) && tile_json.vector_layers.is_none()) {
			if let Some(sample) = conn
				.query_opt(&format!("SELECT tile_data FROM {} LIMIT 1", self.table), &[])
				.await
				.ok()
				.flatten()
				.map(|row| row.get::<_, Vec<u8>>(0))
			{
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

		tile_json.fill_missing_center();
		Ok(tile_json)
	}

	async fn update_metadata(&self, patch: MetadataPatch) -> Result<()> {
		let conn = self.pool.get().await.context("connecting to postgres")?;
		if let Some(v) = patch.name {
			set_metadata(&conn, &self.table, "name", v).await?;
		}
		if let Some(v) = patch.description {
			set_metadata(&conn, &self.table, "description", v).await?;
		}
		if let Some(v) = patch.attribution {
			set_metadata(&conn, &self.table, "attribution", v).await?;
		}
		if let Some(v) = patch.version {
			set_metadata(&conn, &self.table, "version", v).await?;
		}
		if let Some(v) = patch.format {
			set_metadata(&conn, &self.table, "format", v.extension().to_string()).await?;
		}
		if let Some(v) = patch.minzoom {
			set_metadata(&conn, &self.table, "minzoom", v.to_string()).await?;
		}
		if let Some(v) = patch.maxzoom {
			set_metadata(&conn, &self.table, "maxzoom", v.to_string()).await?;
		}
		if let Some(v) = patch.bounds {
			set_metadata(&conn, &self.table, "bounds", v.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",")).await?;
		}
		if let Some(v) = patch.center {
			set_metadata(&conn, &self.table, "center", format!("{},{}", v[0], v[1])).await?;
		}
		if let Some(v) = patch.vector_layers {
			set_metadata(&conn, &self.table, "vector_layers", serde_json::to_string(&v)?).await?;
		}
		Ok(())
	}

	async fn count_tiles(&self) -> Result<u64> {
		let conn = self.pool.get().await.context("connecting to postgres")?;
		let row = conn.query_one(&format!("SELECT COUNT(*) FROM {}", self.table), &[]).await.context("counting tiles")?;
		Ok(row.get::<_, i64>(0) as u64)
	}

	async fn size_bytes(&self) -> Result<u64> {
		let conn = self.pool.get().await.context("connecting to postgres")?;
		let row = conn.query_one("SELECT pg_total_relation_size($1)", &[&self.table]).await.context("reading table size")?;
		Ok(row.get::<_, i64>(0).max(0) as u64)
	}

	async fn get_extra_info_for_coverages(&self, coverage: &Coverage, kind: ExtraInfoKind) -> Result<HashMap<String, ExtraInfoValue>> {
		let conn = self.pool.get().await.context("connecting to postgres")?;
		let expanded = tilecache_core::types::tile_bounds(coverage, TileScheme::Xyz)?;
		let column = match kind {
			ExtraInfoKind::Hash => "hash",
			ExtraInfoKind::Created => "created",
		};
		let mut result = HashMap::new();
		for rect in expanded.tile_bounds {
			let sql = format!(
				"SELECT zoom_level, tile_column, tile_row, {column} FROM {}
				 WHERE zoom_level = $1 AND tile_column BETWEEN $2 AND $3 AND tile_row BETWEEN $4 AND $5",
				self.table
			);
			let rows = conn
				.query(&sql, &[&i32::from(rect.zoom), &(rect.x[0] as i32), &(rect.x[1] as i32), &(rect.y[0] as i32), &(rect.y[1] as i32)])
				.await
				.context("querying extra info")?;
			for row in rows {
				let z: i32 = row.get(0);
				let x: i32 = row.get(1);
				let y: i32 = row.get(2);
				let key = format!("{z}/{x}/{y}");
				match kind {
					ExtraInfoKind::Hash => {
						if let Some(hash) = row.get::<_, Option<String>>(3) {
							result.insert(key, ExtraInfoValue::Hash(hash));
						}
					}
					ExtraInfoKind::Created => {
						if let Some(created) = row.get::<_, Option<i64>>(3) {
							result.insert(key, ExtraInfoValue::Created(created));
						}
					}
				}
			}
		}
		Ok(result)
	}

	async fn calculate_extra_info(&self) -> Result<()> {
		let conn = self.pool.get().await.context("connecting to postgres")?;
		loop {
			let rows = conn
				.query(&format!("SELECT zoom_level, tile_column, tile_row, tile_data FROM {} WHERE hash IS NULL LIMIT 1000", self.table), &[])
				.await
				.context("scanning rows missing extra info")?;
			if rows.is_empty() {
				return Ok(());
			}
			for row in &rows {
				let (z, x, y): (i32, i32, i32) = (row.get(0), row.get(1), row.get(2));
				let data: Vec<u8> = row.get(3);
				let hash = calculate_md5(&data);
				conn.execute(
					&format!("UPDATE {} SET hash = $1, created = $2 WHERE zoom_level = $3 AND tile_column = $4 AND tile_row = $5", self.table),
					&[&hash, &now_millis(), &z, &x, &y],
				)
				.await
				.context("updating extra info")?;
			}
		}
	}

	async fn add_overviews(&self, concurrency: usize, tile_size: u32) -> Result<()> {
		crate::overviews::add_overviews_generic(self, concurrency, tile_size).await
	}
}

impl PostgresBackend {
	async fn derive_bounds(&self, conn: &deadpool_postgres::Client, zoom: u8) -> Result<BBox> {
		let row = conn
			.query_one(
				&format!("SELECT MIN(tile_column), MAX(tile_column), MIN(tile_row), MAX(tile_row) FROM {} WHERE zoom_level = $1", self.table),
				&[&i32::from(zoom)],
			)
			.await?;
		let (x0, x1, y0, y1): (i32, i32, i32, i32) = (row.get(0), row.get(1), row.get(2), row.get(3));
		tilecache_core::types::bbox_from_tiles(x0 as u32, y0 as u32, x1 as u32, y1 as u32, zoom, TileScheme::Xyz)
	}
}

async fn set_metadata(conn: &deadpool_postgres::Client, table: &str, name: &str, value: String) -> Result<()> {
	conn.execute(
		&format!("INSERT INTO {table}_metadata (name, value) VALUES ($1, $2) ON CONFLICT (name) DO UPDATE SET value = excluded.value"),
		&[&name, &value],
	)
	.await?;
	Ok(())
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

fn now_millis() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sanitizes_table_name() {
		assert_eq!(sanitize_table_name("osm-bright").unwrap(), "tiles_osm_bright");
	}

	#[test]
	fn rejects_unsafe_source_id() {
		assert!(sanitize_table_name("osm; DROP TABLE tiles;").is_err());
	}
}
