//! Handlers for the plain file-backed resources (§4.F "the same contract
//! applies to sprites… GeoJSON… and styles") plus the font merge route.

use super::error::ApiError;
use super::state::AppState;
use crate::resolver::resolve_font_merge;
use crate::resolver::resolve_file;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use tilecache_core::error::CoreError;

fn headers_for(content_type: &str, content_encoding: Option<&'static str>) -> HeaderMap {
	let mut headers = HeaderMap::new();
	headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
	if let Some(encoding) = content_encoding {
		headers.insert(header::CONTENT_ENCODING, encoding.parse().unwrap());
	}
	headers
}

/// `GET /fonts/:ids/:range.pbf`: `ids` is a comma-separated list merged by
/// glyph id, first writer wins (§4.F "Font merge").
pub async fn font_handler(State(state): State<AppState>, Path((ids, range)): Path<(String, String)>) -> Response {
	let range = range.strip_suffix(".pbf").unwrap_or(&range);
	match resolve_font_merge(&state.registry, &ids, range).await {
		Ok(resolved) => (headers_for(&resolved.content_type, resolved.content_encoding), resolved.data).into_response(),
		Err(err) => ApiError::json(err).into_response(),
	}
}

/// `GET /sprites/:id/:file`: `file` is e.g. `sprite.json`, `sprite.png`, or
/// `sprite@2x.png`; the sprite set resolves as a plain named file the same
/// way a single GeoJSON/style document does.
pub async fn sprite_handler(State(state): State<AppState>, Path((id, file)): Path<(String, String)>) -> Response {
	let Some(resource) = state.registry.sprites.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("sprite set {id:?} does not exist"))).into_response();
	};
	match resolve_file(&resource, &file).await {
		Ok(resolved) => (headers_for(&resolved.content_type, resolved.content_encoding), resolved.data).into_response(),
		Err(err) => ApiError::json(err).into_response(),
	}
}

/// `GET /geojsons/:id/:file`: a named GeoJSON document under a registered
/// root, same cache-forward contract as tiles.
pub async fn geojson_handler(State(state): State<AppState>, Path((id, file)): Path<(String, String)>) -> Response {
	let Some(resource) = state.registry.geojsons.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("geojson set {id:?} does not exist"))).into_response();
	};
	match resolve_file(&resource, &file).await {
		Ok(resolved) => (headers_for(&resolved.content_type, resolved.content_encoding), resolved.data).into_response(),
		Err(err) => ApiError::json(err).into_response(),
	}
}

/// `GET /styles/:id/:file`: a named style document (e.g. `style.json`),
/// same cache-forward contract as tiles.
pub async fn style_handler(State(state): State<AppState>, Path((id, file)): Path<(String, String)>) -> Response {
	let Some(resource) = state.registry.styles.get(&id).map(|e| e.value().clone()) else {
		return ApiError::json(CoreError::not_found(format!("style set {id:?} does not exist"))).into_response();
	};
	match resolve_file(&resource, &file).await {
		Ok(resolved) => (headers_for(&resolved.content_type, resolved.content_encoding), resolved.data).into_response(),
		Err(err) => ApiError::json(err).into_response(),
	}
}
