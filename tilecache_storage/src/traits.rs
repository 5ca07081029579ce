//! The capability set every storage backend implements (§4.E), as a tagged
//! variant the resolver/exporter drive through one trait object rather than
//! duck-typing on a `sourceType` string (§9 "dynamic dispatch over storage
//! backends").

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use tilecache_core::types::{Coverage, TileCoord, TileJson};

/// Replaces the distilled spec's "throw 'Tile does not exist'" control flow
/// with a typed result (§9 "exception-for-control-flow"). Backends never
/// construct `Other` from a miss; only genuine I/O/SQL/HTTP failures do.
#[derive(Debug)]
pub enum StorageError {
	NotFound,
	Other(anyhow::Error),
}

impl fmt::Display for StorageError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StorageError::NotFound => write!(f, "Tile does not exist"),
			StorageError::Other(err) => write!(f, "{err}"),
		}
	}
}

impl std::error::Error for StorageError {}

impl From<anyhow::Error> for StorageError {
	fn from(err: anyhow::Error) -> Self {
		StorageError::Other(err)
	}
}

/// Which column an extra-info batch query reads (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraInfoKind {
	Hash,
	Created,
}

/// One extra-info value: either a tile's content hash or its creation time
/// in unix milliseconds. `hash` is always `Option<String>` stored as SQL
/// `NULL` when absent — never a separate "undefined" sentinel (§9 Open
/// Question #4).
#[derive(Debug, Clone, PartialEq)]
pub enum ExtraInfoValue {
	Hash(String),
	Created(i64),
}

/// A partial metadata update, merged into whatever the backend already has
/// on `update_metadata` (used by the exporter to set `bounds` post-copy and
/// by lazy derivation to persist what it just computed).
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
	pub name: Option<String>,
	pub description: Option<String>,
	pub attribution: Option<String>,
	pub version: Option<String>,
	pub format: Option<tilecache_core::types::TileFormat>,
	pub minzoom: Option<u8>,
	pub maxzoom: Option<u8>,
	pub bounds: Option<[f64; 4]>,
	pub center: Option<[f64; 2]>,
	pub vector_layers: Option<Vec<String>>,
}

/// The common capability set of every storage backend (§4.E). Each method
/// maps 1:1 onto a distilled-spec operation; `scheme()` tells callers
/// whether `y` needs XYZ↔TMS translation before reaching this backend
/// (MBTiles is the only TMS-native backend).
#[async_trait]
pub trait StorageBackend: Send + Sync {
	fn scheme(&self) -> tilecache_core::types::TileScheme;

	async fn get_tile(&self, coord: TileCoord) -> Result<Vec<u8>, StorageError>;

	async fn put_tile(&self, coord: TileCoord, bytes: &[u8], store_transparent: bool) -> anyhow::Result<()>;

	async fn remove_tile(&self, coord: TileCoord) -> anyhow::Result<()>;

	async fn get_metadata(&self) -> anyhow::Result<TileJson>;

	async fn update_metadata(&self, patch: MetadataPatch) -> anyhow::Result<()>;

	async fn count_tiles(&self) -> anyhow::Result<u64>;

	async fn size_bytes(&self) -> anyhow::Result<u64>;

	/// `getExtraInfoForCoverages`: one batch query per coverage, merged into
	/// a single `"z/x/y" -> value` map in XYZ keys regardless of the
	/// backend's native scheme.
	async fn get_extra_info_for_coverages(
		&self,
		coverage: &Coverage,
		kind: ExtraInfoKind,
	) -> anyhow::Result<HashMap<String, ExtraInfoValue>>;

	/// Scans rows with a NULL hash and fills `hash`+`created` in batches of
	/// 1000 (§4.E).
	async fn calculate_extra_info(&self) -> anyhow::Result<()>;

	/// Generates lower-zoom tiles from 2x2 mosaics of their children,
	/// walking from `maxzoom` down (§4.E "Add overviews").
	async fn add_overviews(&self, concurrency: usize, tile_size: u32) -> anyhow::Result<()>;
}
