//! Handlers for the `/datas/:id/...` surface (§6): tile fetch, TileJSON,
//! MD5, raw-file download, extra-info, and export start/cancel.

use super::error::ApiError;
use super::state::AppState;
use crate::exporter::{ExportConfig, RefreshPolicy, run_export};
use crate::resolver::resolve_tile;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::collections::HashMap;
use tilecache_core::error::CoreError;
use tilecache_core::format::calculate_md5_of_file;
use tilecache_core::types::{Coverage, TileCoord, TileFormat};
use tilecache_storage::{ExtraInfoKind, ExtraInfoValue, MetadataPatch, SourceType, StorageBackend};

/// `GET /datas/:id/:z/:x/:y.:format` (§6).
pub async fn tile_handler(State(state): State<AppState>, Path((id, z, x, y_and_format)): Path<(String, u8, u32, String)>) -> Response {
	let Some((y_str, format_str)) = y_and_format.rsplit_once('.') else {
		return ApiError::tile(CoreError::bad_request("missing tile format extension")).into_response();
	};
	let Ok(y) = y_str.parse::<u32>() else {
		return ApiError::tile(CoreError::bad_request(format!("invalid y coordinate {y_str:?}"))).into_response();
	};
	let Some(requested_format) = TileFormat::from_extension(format_str) else {
		return ApiError::tile(CoreError::bad_request(format!("unrecognized format {format_str:?}"))).into_response();
	};
	let Ok(coord) = TileCoord::new(z, x, y) else {
		return ApiError::tile(CoreError::bad_request(format!("tile ({z},{x},{y}) out of range"))).into_response();
	};

	// An unknown id is a 404 (no such resource); a missing tile within a
	// known id is a 204 (empty-tile convention) — two different NotFound
	// causes the resolver's error kind alone can't distinguish (§6).
	if !state.registry.datas.contains_key(&id) {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	}

	match resolve_tile(&state.registry, &id, coord, Some(requested_format)).await {
		Ok(resolved) => {
			let mut headers = HeaderMap::new();
			headers.insert(header::CONTENT_TYPE, resolved.content_type.parse().unwrap());
			if let Some(encoding) = resolved.content_encoding {
				headers.insert(header::CONTENT_ENCODING, encoding.parse().unwrap());
			}
			(StatusCode::OK, headers, resolved.data).into_response()
		}
		Err(err) => ApiError::tile(err).into_response(),
	}
}

/// `GET /datas/:id.json` (§6): TileJSON 2.2.0, `tiles` templated with the
/// current request's host.
pub async fn tilejson_handler(State(state): State<AppState>, Path(id): Path<String>, headers: HeaderMap) -> Response {
	let Some(entry) = state.registry.datas.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	};
	let mut tile_json = match entry.source.get_metadata().await {
		Ok(meta) => meta,
		Err(err) => return ApiError::json(CoreError::from_anyhow(&err)).into_response(),
	};
	let host = headers.get(header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("localhost");
	let ext = tile_json.format.map(TileFormat::extension).unwrap_or("png");
	tile_json.tiles = vec![format!("http://{host}/datas/{id}/{{z}}/{{x}}/{{y}}.{ext}")];
	axum::Json(tile_json).into_response()
}

/// `GET /datas/:id/md5` (§6): `ETag` header with the backing file's MD5.
/// Only meaningful for file-backed sources (MBTiles/XYZ/PMTiles).
pub async fn md5_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
	let Some(entry) = state.registry.datas.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	};
	let Some(path) = entry.source.local_file_path() else {
		return ApiError::json(CoreError::bad_request("source has no single backing file to hash")).into_response();
	};
	match calculate_md5_of_file(&path).await {
		Ok(hash) => {
			let mut headers = HeaderMap::new();
			headers.insert(header::ETAG, format!("\"{hash}\"").parse().unwrap());
			(StatusCode::OK, headers).into_response()
		}
		Err(err) => ApiError::json(CoreError::not_found(err.to_string())).into_response(),
	}
}

/// `GET /datas/:id/download` (§6): streams the raw backing file
/// (MBTiles/PMTiles only; XYZ and Postgres have no single file).
pub async fn download_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
	let Some(entry) = state.registry.datas.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	};
	let Some(path) = entry.source.local_file_path() else {
		return ApiError::json(CoreError::bad_request("source has no single backing file to download")).into_response();
	};
	match tokio::fs::read(&path).await {
		Ok(bytes) => {
			let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("download").to_string();
			let mut headers = HeaderMap::new();
			headers.insert(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\"").parse().unwrap());
			(StatusCode::OK, headers, Body::from(bytes)).into_response()
		}
		Err(err) => ApiError::json(CoreError::not_found(err.to_string())).into_response(),
	}
}

#[derive(Debug, Deserialize)]
pub struct ExtraInfoQuery {
	#[serde(rename = "type")]
	pub kind: String,
}

/// `POST /datas/:id/extra-info` (§6): body is a coverage, `type=hash|created`
/// selects the column.
pub async fn extra_info_post_handler(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Query(query): Query<ExtraInfoQuery>,
	axum::Json(coverage): axum::Json<Coverage>,
) -> Response {
	let Some(entry) = state.registry.datas.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	};
	let kind = match query.kind.as_str() {
		"hash" => ExtraInfoKind::Hash,
		"created" => ExtraInfoKind::Created,
		other => return ApiError::json(CoreError::bad_request(format!("unknown extra-info type {other:?}"))).into_response(),
	};
	match entry.source.get_extra_info_for_coverages(&coverage, kind).await {
		Ok(map) => axum::Json(extra_info_to_json(&map)).into_response(),
		Err(err) => ApiError::json(CoreError::from_anyhow(&err)).into_response(),
	}
}

fn extra_info_to_json(map: &HashMap<String, ExtraInfoValue>) -> serde_json::Value {
	let object = map
		.iter()
		.map(|(k, v)| {
			let value = match v {
				ExtraInfoValue::Hash(h) => serde_json::Value::String(h.clone()),
				ExtraInfoValue::Created(c) => serde_json::Value::Number((*c).into()),
			};
			(k.clone(), value)
		})
		.collect();
	serde_json::Value::Object(object)
}

/// `GET /datas/:id/extra-info` (§6): triggers background hash/created
/// calculation; returns immediately.
pub async fn extra_info_get_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
	let Some(entry) = state.registry.datas.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	};
	tokio::spawn(async move {
		if let Err(err) = entry.source.calculate_extra_info().await {
			log::warn!("calculate_extra_info for {id:?} failed: {err:#}");
		}
	});
	StatusCode::ACCEPTED.into_response()
}

#[derive(Debug, Deserialize)]
pub struct ExportBody {
	pub coverage: Coverage,
	#[serde(default)]
	pub target_type: Option<SourceType>,
	#[serde(default)]
	pub target_path: Option<String>,
	#[serde(default = "default_concurrency")]
	pub concurrency: usize,
	#[serde(default = "default_true")]
	pub store_transparent: bool,
	#[serde(default)]
	pub refresh_before: Option<crate::seed::RefreshBeforeRaw>,
}

fn default_concurrency() -> usize {
	4
}
fn default_true() -> bool {
	true
}

/// `POST /datas/:id/export` (§6): starts an export; rejects with `Conflict`
/// if one is already running for `id` (§7). Runs in the background; the
/// handler returns as soon as the run is accepted (§8 scenario 5 "handler
/// returns 200").
pub async fn export_start_handler(State(state): State<AppState>, Path(id): Path<String>, axum::Json(body): axum::Json<ExportBody>) -> Response {
	let Some(data_source) = state.registry.datas.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	};
	let Some(cancel) = data_source.run_slot.try_start() else {
		return ApiError::json(CoreError::conflict(format!("export already running for {id:?}"))).into_response();
	};

	let target_type = body.target_type.unwrap_or(source_type_of(&data_source.source));
	let target_path = body.target_path.unwrap_or_else(|| data_source.source.local_file_path().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default());

	let config = ExportConfig {
		target_type,
		target_path,
		metadata_patch: MetadataPatch::default(),
		coverage: body.coverage,
		concurrency: body.concurrency,
		store_transparent: body.store_transparent,
		refresh: body.refresh_before.map(crate::seed::RefreshBeforeRaw::into_policy).unwrap_or(RefreshPolicy::Always),
	};

	let registry = state.registry.clone();
	let id_for_task = id.clone();
	tokio::spawn(async move {
		let result = run_export(registry, &id_for_task, config, cancel).await;
		data_source.run_slot.finish();
		if let Err(err) = result {
			log::warn!("export {id_for_task:?} failed: {err:#}");
		}
	});

	StatusCode::OK.into_response()
}

fn source_type_of(source: &tilecache_storage::TileSource) -> SourceType {
	match source {
		tilecache_storage::TileSource::Mbtiles(_) => SourceType::Mbtiles,
		tilecache_storage::TileSource::Pmtiles(_) => SourceType::Pmtiles,
		tilecache_storage::TileSource::Xyz(_) => SourceType::Xyz,
		tilecache_storage::TileSource::Postgres(_) => SourceType::Pg,
	}
}

#[derive(Debug, Deserialize)]
pub struct ExportCancelQuery {
	#[serde(default)]
	pub cancel: bool,
}

/// `GET /datas/:id/export` (§6): `?cancel=true` requests cancellation of a
/// running export (§8 scenario 5); otherwise reports whether one is running.
pub async fn export_status_handler(State(state): State<AppState>, Path(id): Path<String>, Query(query): Query<ExportCancelQuery>) -> Response {
	let Some(entry) = state.registry.datas.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("Tile source {id:?} does not exist"))).into_response();
	};
	if query.cancel {
		let cancelled = entry.run_slot.request_cancel();
		return axum::Json(serde_json::json!({ "cancelled": cancelled })).into_response();
	}
	axum::Json(serde_json::json!({ "running": entry.run_slot.is_running() })).into_response()
}
