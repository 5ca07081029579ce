//! Command-line entry point: `serve` runs the HTTP surface (§6), `export`
//! and `seed` drive the batch paths (§4.G/§4.H) without going through HTTP.

mod cancel;
mod config;
mod exporter;
mod http;
mod registry;
mod resolver;
mod seed;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use registry::{Registry, RegistryDoc};
use std::path::PathBuf;
use std::sync::Arc;
use tilecache_core::concurrency::CancelToken;
use tilecache_core::types::{BBox, Coverage};
use tilecache_storage::SourceType;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true)]
struct Cli {
	#[command(subcommand)]
	command: Commands,

	/// Increase log verbosity; repeat for more (-v, -vv, -vvv).
	#[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
	verbose: u8,

	/// Decrease log verbosity; repeat for less (-q, -qq).
	#[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count, global = true)]
	quiet: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Serve tiles, fonts, sprites and styles via http
	Serve(ServeArgs),
	/// Export a registered source's coverage into a target backend
	Export(ExportArgs),
	/// Run every seed/cleanup entry declared in a seed document
	Seed(SeedArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
	/// Path to the registry document (styles/geojsons/datas/fonts/sprites).
	#[arg(short = 'r', long, value_name = "FILE")]
	registry: PathBuf,

	/// Serve via socket ip.
	#[arg(short = 'i', long, default_value = "0.0.0.0")]
	ip: String,

	/// Serve via port.
	#[arg(short = 'p', long, default_value_t = 8080)]
	port: u16,
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
	/// Path to the registry document.
	#[arg(short = 'r', long, value_name = "FILE")]
	registry: PathBuf,

	/// Id of the registered source to export.
	source_id: String,

	/// Target backend type.
	#[arg(long, value_enum)]
	target_type: CliSourceType,

	/// Target path or URI.
	#[arg(long)]
	target_path: String,

	/// Bounding box to export: west,south,east,north.
	#[arg(long, value_delimiter = ',')]
	bbox: Vec<f64>,

	/// Inclusive minimum zoom.
	#[arg(long)]
	min_zoom: u8,

	/// Inclusive maximum zoom.
	#[arg(long)]
	max_zoom: u8,

	/// Concurrent in-flight tile fetches.
	#[arg(long, default_value_t = 4)]
	concurrency: usize,

	/// Write fully transparent PNG tiles to the target.
	#[arg(long, default_value_t = true)]
	store_transparent: bool,

	/// Re-export every tile regardless of what the target already has.
	#[arg(long, default_value_t = false)]
	force: bool,
}

/// Mirrors [`SourceType`] for clap's `ValueEnum` derive, which a crate
/// outside the CLI binary has no reason to depend on.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliSourceType {
	Mbtiles,
	Pmtiles,
	Xyz,
	Pg,
}

impl From<CliSourceType> for SourceType {
	fn from(value: CliSourceType) -> Self {
		match value {
			CliSourceType::Mbtiles => SourceType::Mbtiles,
			CliSourceType::Pmtiles => SourceType::Pmtiles,
			CliSourceType::Xyz => SourceType::Xyz,
			CliSourceType::Pg => SourceType::Pg,
		}
	}
}

#[derive(clap::Args, Debug)]
struct SeedArgs {
	/// Path to the registry document.
	#[arg(short = 'r', long, value_name = "FILE")]
	registry: PathBuf,

	/// Path to the seed document (seeds/cleanups).
	seed_file: PathBuf,
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	init_logger(cli.verbose, cli.quiet);

	let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().context("building tokio runtime")?;
	runtime.block_on(run(cli))
}

fn init_logger(verbose: u8, quiet: u8) {
	let level = match i16::from(verbose) - i16::from(quiet) {
		i16::MIN..=-1 => log::LevelFilter::Error,
		0 => log::LevelFilter::Warn,
		1 => log::LevelFilter::Info,
		2 => log::LevelFilter::Debug,
		_ => log::LevelFilter::Trace,
	};
	env_logger::Builder::new().filter_level(level).format_timestamp(None).init();
}

async fn run(cli: Cli) -> Result<()> {
	match cli.command {
		Commands::Serve(args) => run_serve(args).await,
		Commands::Export(args) => run_export_cmd(args).await,
		Commands::Seed(args) => run_seed_cmd(args).await,
	}
}

async fn load_registry(registry_path: &std::path::Path) -> Result<Arc<Registry>> {
	let config = Config::from_env();
	let doc = RegistryDoc::from_path(registry_path).with_context(|| format!("reading registry document {registry_path:?}"))?;
	Ok(Arc::new(Registry::load(config, &doc).await.context("loading registry")?))
}

async fn run_serve(args: ServeArgs) -> Result<()> {
	let registry = load_registry(&args.registry).await?;
	let service_name = registry.config.service_name.clone();
	let state = http::AppState::new(registry);
	let app = http::build_router(state);

	let addr = format!("{}:{}", args.ip, args.port);
	let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
	log::info!("{} listening on {}", service_name.bold(), format!("http://{addr}").green());

	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("serving http")?;
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		log::warn!("failed to install ctrl-c handler: {err}");
	}
}

async fn run_export_cmd(args: ExportArgs) -> Result<()> {
	let registry = load_registry(&args.registry).await?;
	anyhow::ensure!(args.bbox.len() == 4, "--bbox expects exactly 4 comma-separated values: west,south,east,north");
	let bbox = BBox::new(args.bbox[0], args.bbox[1], args.bbox[2], args.bbox[3])?;
	let coverage = Coverage::from_bbox_zoom_range(bbox, args.min_zoom, args.max_zoom);

	let config = exporter::ExportConfig {
		target_type: args.target_type.into(),
		target_path: args.target_path,
		metadata_patch: tilecache_storage::MetadataPatch::default(),
		coverage,
		concurrency: args.concurrency,
		store_transparent: args.store_transparent,
		refresh: if args.force { exporter::RefreshPolicy::Always } else { exporter::RefreshPolicy::Md5Compare },
	};

	let summary = exporter::run_export(registry, &args.source_id, config, CancelToken::new()).await?;
	log::info!("export finished: {summary:?}");
	Ok(())
}

async fn run_seed_cmd(args: SeedArgs) -> Result<()> {
	let registry = load_registry(&args.registry).await?;
	let doc = seed::SeedDoc::from_path(&args.seed_file).with_context(|| format!("reading seed document {:?}", args.seed_file))?;
	seed::run_all(registry, &doc).await;
	Ok(())
}
