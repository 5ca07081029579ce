//! Router composition for the §6 route table. Kept declarative, splitting
//! route wiring from handler bodies; the global backpressure/protection
//! stack (innermost to outermost: LoadShed → ConcurrencyLimit → Buffer →
//! Timeout → CatchPanic → HandleError) mirrors a conventional tower-based
//! tile-server middleware ordering.

use super::files::{font_handler, geojson_handler, sprite_handler, style_handler};
use super::state::AppState;
use super::tiles::{download_handler, export_start_handler, export_status_handler, extra_info_get_handler, extra_info_post_handler, md5_handler, tile_handler, tilejson_handler};
use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{BoxError, response::IntoResponse};
use std::time::Duration;
use tower::ServiceBuilder;
use tower::buffer::BufferLayer;
use tower::limit::ConcurrencyLimitLayer;
use tower::load_shed::LoadShedLayer;
use tower::timeout::TimeoutLayer;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;

const GLOBAL_CONCURRENCY: usize = 512;
const GLOBAL_BUFFER: usize = 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_router(state: AppState) -> Router {
	let router = Router::new()
		.route("/datas/{id}/{z}/{x}/{y}", get(tile_handler))
		.route("/datas/{id}.json", get(tilejson_handler))
		.route("/datas/{id}/md5", get(md5_handler))
		.route("/datas/{id}/download", get(download_handler))
		.route("/datas/{id}/extra-info", post(extra_info_post_handler).get(extra_info_get_handler))
		.route("/datas/{id}/export", post(export_start_handler).get(export_status_handler))
		.route("/fonts/{ids}/{range}", get(font_handler))
		.route("/sprites/{id}/{file}", get(sprite_handler))
		.route("/geojsons/{id}/{file}", get(geojson_handler))
		.route("/styles/{id}/{file}", get(style_handler))
		.route("/health", get(|| async { StatusCode::OK }))
		.with_state(state)
		.layer(CorsLayer::permissive());

	let overload_handler = HandleErrorLayer::new(|_err: BoxError| async move { (StatusCode::SERVICE_UNAVAILABLE, "service overloaded, try later").into_response() });

	let protection = ServiceBuilder::new()
		.layer(overload_handler)
		.layer(CatchPanicLayer::new())
		.layer(TimeoutLayer::new(REQUEST_TIMEOUT))
		.layer(BufferLayer::new(GLOBAL_BUFFER))
		.layer(ConcurrencyLimitLayer::new(GLOBAL_CONCURRENCY))
		.layer(LoadShedLayer::new());

	router.layer(protection)
}
