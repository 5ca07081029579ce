//! Maps [`CoreError`] to HTTP responses (§7). The mapping is route-dependent
//! for `NotFound` (204 on the tile route, 404 elsewhere),
//! so this isn't a blanket `IntoResponse` impl on `CoreError` itself — each
//! handler picks `tile_not_found_status` or `json_not_found_status`
//! explicitly via [`ApiError`]'s two constructors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tilecache_core::error::CoreError;

/// Which status a `NotFound` maps to at this call site (§7 "Surfaces as 204
/// for tiles… 404 for JSON resources").
#[derive(Debug, Clone, Copy)]
pub enum NotFoundStyle {
	/// `/datas/:id/:z/:x/:y.:format` — empty-tile convention.
	EmptyTile,
	/// Every other JSON/file resource.
	Json,
}

pub struct ApiError {
	pub core: CoreError,
	pub style: NotFoundStyle,
}

impl ApiError {
	pub fn tile(core: CoreError) -> Self {
		ApiError { core, style: NotFoundStyle::EmptyTile }
	}

	pub fn json(core: CoreError) -> Self {
		ApiError { core, style: NotFoundStyle::Json }
	}
}

impl From<CoreError> for ApiError {
	fn from(core: CoreError) -> Self {
		ApiError::json(core)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		match &self.core {
			CoreError::NotFound(msg) => {
				let status = match self.style {
					NotFoundStyle::EmptyTile => StatusCode::NO_CONTENT,
					NotFoundStyle::Json => StatusCode::NOT_FOUND,
				};
				log::debug!("{status}: {msg}");
				(status, String::new()).into_response()
			}
			CoreError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()).into_response(),
			CoreError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()).into_response(),
			CoreError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()).into_response(),
			CoreError::Upstream(status, msg) => {
				let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
				(status, msg.clone()).into_response()
			}
			CoreError::Internal(msg) => {
				log::error!("internal error: {msg}");
				(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
			}
		}
	}
}
