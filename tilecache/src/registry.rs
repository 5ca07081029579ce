//! Repository registry (§4.I): name → opened source handle, built once at
//! startup from a declarative YAML document. Grounded on
//! `versatiles::server::tile_server::TileServer`'s `DashMap`-backed source
//! table for lock-free reads and `ArcSwap`-backed static-source list,
//! even though this registry itself never hot-reloads after startup
//! (§4.I "a restart is required").

use crate::cancel::RunSlot;
use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tilecache_core::types::TileScheme;
use tilecache_storage::{SourceType, TileSource};

/// One `data` entry's cache-forward settings (§3 "optional cache-forward").
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
	/// Template with `{z}`/`{x}`/`{y}`.
	pub source_url: String,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default = "default_scheme")]
	pub scheme: TileScheme,
	#[serde(default = "default_true")]
	pub store_cache: bool,
	#[serde(default = "default_true")]
	pub store_transparent: bool,
}

fn default_scheme() -> TileScheme {
	TileScheme::Xyz
}
fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataEntry {
	pub id: String,
	#[serde(default)]
	pub mbtiles: Option<String>,
	#[serde(default)]
	pub pmtiles: Option<String>,
	#[serde(default)]
	pub xyz: Option<String>,
	#[serde(default)]
	pub pg: Option<String>,
	#[serde(default)]
	pub cache: Option<CacheConfig>,
}

impl DataEntry {
	fn source_type_and_path(&self) -> Result<(SourceType, &str)> {
		let set: Vec<(SourceType, &Option<String>)> =
			vec![(SourceType::Mbtiles, &self.mbtiles), (SourceType::Pmtiles, &self.pmtiles), (SourceType::Xyz, &self.xyz), (SourceType::Pg, &self.pg)];
		let mut found = set.into_iter().filter_map(|(t, p)| p.as_deref().map(|p| (t, p)));
		let first = found.next().ok_or_else(|| anyhow!("BadRequest: data entry {:?} sets none of mbtiles/pmtiles/xyz/pg", self.id))?;
		if found.next().is_some() {
			anyhow::bail!("BadRequest: data entry {:?} sets more than one of mbtiles/pmtiles/xyz/pg", self.id);
		}
		Ok(first)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
	pub id: String,
	/// Directory on disk this resource's files live under.
	pub root: String,
	#[serde(default)]
	pub cache: Option<CacheConfig>,
}

/// A loaded entry for fonts/sprites/geojsons/styles: plain files under
/// `root`, with the same cache-forward contract as tile data (§4.F
/// "the same contract applies to sprites… fonts… GeoJSON… and styles").
pub struct FileResource {
	pub id: String,
	pub root: PathBuf,
	pub cache: Option<CacheConfig>,
}

/// A loaded `data` entry: the opened backend plus its cache-forward
/// settings and single-flight export slot (§4.G/§4.H).
pub struct DataSource {
	pub id: String,
	pub source: TileSource,
	pub cache: Option<CacheConfig>,
	pub run_slot: RunSlot,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryDoc {
	#[serde(default)]
	pub datas: Vec<DataEntry>,
	#[serde(default)]
	pub fonts: Vec<FileEntry>,
	#[serde(default)]
	pub sprites: Vec<FileEntry>,
	#[serde(default)]
	pub geojsons: Vec<FileEntry>,
	#[serde(default)]
	pub styles: Vec<FileEntry>,
}

impl RegistryDoc {
	pub fn from_path(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).with_context(|| format!("reading registry file {path:?}"))?;
		Ok(serde_yaml_ng::from_str(&text)?)
	}
}

/// The built-once repository of opened sources (§4.I). Lives for the
/// process lifetime; individual entries are never swapped after `load`.
pub struct Registry {
	pub config: Config,
	pub datas: Arc<DashMap<String, Arc<DataSource>>>,
	pub fonts: Arc<DashMap<String, Arc<FileResource>>>,
	pub sprites: Arc<DashMap<String, Arc<FileResource>>>,
	pub geojsons: Arc<DashMap<String, Arc<FileResource>>>,
	pub styles: Arc<DashMap<String, Arc<FileResource>>>,
}

impl Registry {
	/// Opens every entry in `doc`. Entries that fail to load are skipped
	/// with a logged error (§4.I); the registry itself never fails to build
	/// just because one source is broken.
	pub async fn load(config: Config, doc: &RegistryDoc) -> Result<Self> {
		let datas = DashMap::new();
		for entry in &doc.datas {
			match open_data_entry(&config, entry).await {
				Ok(source) => {
					datas.insert(entry.id.clone(), Arc::new(source));
				}
				Err(err) => log::error!("skipping data source {:?}: {err:#}", entry.id),
			}
		}

		let fonts = load_file_entries(&config, &doc.fonts);
		let sprites = load_file_entries(&config, &doc.sprites);
		let geojsons = load_file_entries(&config, &doc.geojsons);
		let styles = load_file_entries(&config, &doc.styles);

		Ok(Registry {
			config,
			datas: Arc::new(datas),
			fonts: Arc::new(fonts),
			sprites: Arc::new(sprites),
			geojsons: Arc::new(geojsons),
			styles: Arc::new(styles),
		})
	}
}

async fn open_data_entry(config: &Config, entry: &DataEntry) -> Result<DataSource> {
	let (source_type, raw_path) = entry.source_type_and_path()?;
	let path_or_uri = resolve_path(config, raw_path);
	let source = TileSource::open(source_type, &path_or_uri, true, Duration::from_secs(5), config.postgresql_base_uri.as_deref())
		.await
		.with_context(|| format!("opening data source {:?}", entry.id))?;
	Ok(DataSource { id: entry.id.clone(), source, cache: entry.cache.clone(), run_slot: RunSlot::new() })
}

fn load_file_entries(config: &Config, entries: &[FileEntry]) -> DashMap<String, Arc<FileResource>> {
	let map = DashMap::new();
	for entry in entries {
		let root = PathBuf::from(resolve_path(config, &entry.root));
		map.insert(entry.id.clone(), Arc::new(FileResource { id: entry.id.clone(), root, cache: entry.cache.clone() }));
	}
	map
}

/// Relative paths resolve under `DATA_DIR`; absolute paths and URIs
/// (PostgreSQL connection strings, `http(s)://` PMTiles URLs) pass through.
fn resolve_path(config: &Config, raw: &str) -> String {
	if raw.starts_with("http://") || raw.starts_with("https://") || raw.contains("://") || Path::new(raw).is_absolute() {
		raw.to_string()
	} else {
		config.data_dir.join(raw).to_string_lossy().into_owned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_data_entry_with_no_backend_set() {
		let entry = DataEntry { id: "x".into(), mbtiles: None, pmtiles: None, xyz: None, pg: None, cache: None };
		assert!(entry.source_type_and_path().is_err());
	}

	#[test]
	fn rejects_data_entry_with_multiple_backends_set() {
		let entry = DataEntry { id: "x".into(), mbtiles: Some("a.mbtiles".into()), pmtiles: Some("a.pmtiles".into()), xyz: None, pg: None, cache: None };
		assert!(entry.source_type_and_path().is_err());
	}

	#[test]
	fn resolve_path_keeps_absolute_and_uri_paths_unchanged() {
		let config = Config { data_dir: PathBuf::from("/data"), postgresql_base_uri: None, serve_front_page: true, serve_swagger: true, service_name: "t".into() };
		assert_eq!(resolve_path(&config, "osm.mbtiles"), "/data/osm.mbtiles");
		assert_eq!(resolve_path(&config, "https://example.org/x.pmtiles"), "https://example.org/x.pmtiles");
		assert_eq!(resolve_path(&config, "/abs/x.mbtiles"), "/abs/x.mbtiles");
	}

	#[tokio::test]
	async fn loads_an_mbtiles_data_entry() {
		let dir = tempfile::tempdir().unwrap();
		let config = Config { data_dir: dir.path().to_path_buf(), postgresql_base_uri: None, serve_front_page: true, serve_swagger: true, service_name: "t".into() };
		let doc = RegistryDoc {
			datas: vec![DataEntry { id: "osm".into(), mbtiles: Some("osm.mbtiles".into()), pmtiles: None, xyz: None, pg: None, cache: None }],
			..Default::default()
		};
		let registry = Registry::load(config, &doc).await.unwrap();
		assert!(registry.datas.contains_key("osm"));
	}

	#[tokio::test]
	async fn broken_entry_is_skipped_not_fatal() {
		let dir = tempfile::tempdir().unwrap();
		let config = Config { data_dir: dir.path().to_path_buf(), postgresql_base_uri: None, serve_front_page: true, serve_swagger: true, service_name: "t".into() };
		let doc = RegistryDoc { datas: vec![DataEntry { id: "bad".into(), mbtiles: None, pmtiles: None, xyz: None, pg: None, cache: None }], ..Default::default() };
		let registry = Registry::load(config, &doc).await.unwrap();
		assert!(registry.datas.is_empty());
	}
}
