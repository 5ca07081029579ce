//! Storage backends for tilecache (§4.E): MBTiles, PMTiles, XYZ-on-disk, and
//! PostgreSQL, unified behind one [`StorageBackend`] trait and one
//! [`TileSource`] tagged variant (§9 "dynamic dispatch over storage
//! backends" — replaces duck-typing on `sourceType`).

mod mbtiles;
mod overviews;
mod pmtiles;
mod postgres;
mod sqlite_support;
mod traits;
mod xyz;

pub use mbtiles::MbtilesBackend;
pub use pmtiles::PmtilesBackend;
pub use postgres::PostgresBackend;
pub use traits::{ExtraInfoKind, ExtraInfoValue, MetadataPatch, StorageBackend, StorageError};
pub use xyz::XyzBackend;

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tilecache_core::types::{Coverage, TileCoord, TileJson, TileScheme};

/// `sourceType` from the registry document (§3 "Tile source (entity)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
	Mbtiles,
	Pmtiles,
	Xyz,
	Pg,
}

/// The tagged variant over storage backends (§9): every caller (resolver,
/// exporter, seeder) matches on this enum's capability set through
/// [`StorageBackend`] rather than branching on a type tag at each call site.
pub enum TileSource {
	Mbtiles(MbtilesBackend),
	Pmtiles(PmtilesBackend),
	Xyz(XyzBackend),
	Postgres(PostgresBackend),
}

/// How a PMTiles archive's bytes are reached: a local path or a remote URL
/// (§4.E "local file or HTTP").
pub enum PmtilesLocation {
	File(PathBuf),
	Url(String),
}

impl TileSource {
	/// Opens (or creates) a source given its `sourceType` and
	/// `pathOrURI` (§4.E `open(pathOrURI, createIfMissing, timeout)`).
	/// `postgres_base_uri` is only consulted for `SourceType::Pg`, where
	/// `path_or_uri` is the table-qualifying source id.
	pub async fn open(
		source_type: SourceType,
		path_or_uri: &str,
		create_if_missing: bool,
		timeout: Duration,
		postgres_base_uri: Option<&str>,
	) -> Result<Self> {
		match source_type {
			SourceType::Mbtiles => Ok(TileSource::Mbtiles(MbtilesBackend::open(PathBuf::from(path_or_uri), create_if_missing, timeout).await?)),
			SourceType::Xyz => Ok(TileSource::Xyz(XyzBackend::open(PathBuf::from(path_or_uri), create_if_missing, timeout).await?)),
			SourceType::Pmtiles => {
				let location = pmtiles_location(path_or_uri);
				Ok(TileSource::Pmtiles(match location {
					PmtilesLocation::File(path) => PmtilesBackend::open_file(&path).await?,
					PmtilesLocation::Url(url) => PmtilesBackend::open_url(url).await?,
				}))
			}
			SourceType::Pg => {
				let Some(base_uri) = postgres_base_uri else {
					bail!("BadRequest: postgres source {path_or_uri:?} requires POSTGRESQL_BASE_URI to be configured");
				};
				Ok(TileSource::Postgres(PostgresBackend::open(base_uri, path_or_uri).await?))
			}
		}
	}

	fn as_backend(&self) -> &dyn StorageBackend {
		match self {
			TileSource::Mbtiles(b) => b,
			TileSource::Pmtiles(b) => b,
			TileSource::Xyz(b) => b,
			TileSource::Postgres(b) => b,
		}
	}
}

fn pmtiles_location(path_or_uri: &str) -> PmtilesLocation {
	if path_or_uri.starts_with("http://") || path_or_uri.starts_with("https://") {
		PmtilesLocation::Url(path_or_uri.to_string())
	} else {
		PmtilesLocation::File(PathBuf::from(path_or_uri))
	}
}

/// Delegates every capability-set method to the wrapped backend, so callers
/// can hold a `TileSource` instead of a `Box<dyn StorageBackend>` while still
/// matching on the concrete variant where it matters (e.g. `download`,
/// which only file-backed sources support).
#[async_trait]
impl StorageBackend for TileSource {
	fn scheme(&self) -> TileScheme {
		self.as_backend().scheme()
	}

	async fn get_tile(&self, coord: TileCoord) -> Result<Vec<u8>, StorageError> {
		self.as_backend().get_tile(coord).await
	}

	async fn put_tile(&self, coord: TileCoord, bytes: &[u8], store_transparent: bool) -> Result<()> {
		self.as_backend().put_tile(coord, bytes, store_transparent).await
	}

	async fn remove_tile(&self, coord: TileCoord) -> Result<()> {
		self.as_backend().remove_tile(coord).await
	}

	async fn get_metadata(&self) -> Result<TileJson> {
		self.as_backend().get_metadata().await
	}

	async fn update_metadata(&self, patch: MetadataPatch) -> Result<()> {
		self.as_backend().update_metadata(patch).await
	}

	async fn count_tiles(&self) -> Result<u64> {
		self.as_backend().count_tiles().await
	}

	async fn size_bytes(&self) -> Result<u64> {
		self.as_backend().size_bytes().await
	}

	async fn get_extra_info_for_coverages(&self, coverage: &Coverage, kind: ExtraInfoKind) -> Result<HashMap<String, ExtraInfoValue>> {
		self.as_backend().get_extra_info_for_coverages(coverage, kind).await
	}

	async fn calculate_extra_info(&self) -> Result<()> {
		self.as_backend().calculate_extra_info().await
	}

	async fn add_overviews(&self, concurrency: usize, tile_size: u32) -> Result<()> {
		self.as_backend().add_overviews(concurrency, tile_size).await
	}
}

impl TileSource {
	/// The local file path backing this source, if any (§6 `/datas/:id/download`
	/// and `/datas/:id/md5`, both of which are only meaningful for file-backed
	/// sources).
	pub fn local_file_path(&self) -> Option<PathBuf> {
		match self {
			TileSource::Mbtiles(b) => Some(b.path().to_path_buf()),
			TileSource::Xyz(b) => Some(b.root().to_path_buf()),
			TileSource::Pmtiles(b) => b.local_path().map(|p| p.to_path_buf()),
			TileSource::Postgres(_) => None,
		}
	}

	/// Prunes now-empty directories after a bulk write; a no-op for every
	/// backend but XYZ, whose tile tree is the only one that can end up with
	/// dangling empty `<z>/<x>/` directories (§4.G step 6).
	pub async fn prune_if_xyz(&self) -> Result<()> {
		if let TileSource::Xyz(backend) = self {
			backend.prune_empty_dirs().await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn opens_mbtiles_and_xyz_through_the_tagged_variant() {
		let dir = tempfile::tempdir().unwrap();
		let mbtiles_path = dir.path().join("test.mbtiles");
		let source = TileSource::open(SourceType::Mbtiles, mbtiles_path.to_str().unwrap(), true, Duration::from_secs(1), None).await.unwrap();
		assert_eq!(source.scheme(), TileScheme::Tms);

		let xyz_root = dir.path().join("xyzs/osm");
		let source = TileSource::open(SourceType::Xyz, xyz_root.to_str().unwrap(), true, Duration::from_secs(1), None).await.unwrap();
		assert_eq!(source.scheme(), TileScheme::Xyz);
	}

	#[tokio::test]
	async fn postgres_without_base_uri_is_rejected() {
		let result = TileSource::open(SourceType::Pg, "osm", true, Duration::from_secs(1), None).await;
		assert!(result.is_err());
	}
}
