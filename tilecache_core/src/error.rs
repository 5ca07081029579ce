//! Typed error kinds crossing the resolver/HTTP seam.
//!
//! Everything below the resolver (SQLite, file I/O, upstream HTTP plumbing)
//! keeps using `anyhow::Result`; `CoreError` exists only at the boundary
//! where a caller needs to branch on *kind*, not just print a message.

use std::fmt;

/// The six error kinds a tile request, export, or seed run can surface.
#[derive(Debug, Clone)]
pub enum CoreError {
	/// Tile, record or file does not exist.
	NotFound(String),
	/// Schema validation, format mismatch, malformed coverage.
	BadRequest(String),
	/// Export/seed already running for this source.
	Conflict(String),
	/// Lock acquisition or upstream fetch exceeded its deadline.
	Timeout(String),
	/// Non-2xx response from a forward fetch; status preserved.
	Upstream(u16, String),
	/// Anything else.
	Internal(String),
}

impl CoreError {
	pub fn not_found(msg: impl Into<String>) -> Self {
		CoreError::NotFound(msg.into())
	}

	pub fn bad_request(msg: impl Into<String>) -> Self {
		CoreError::BadRequest(msg.into())
	}

	pub fn conflict(msg: impl Into<String>) -> Self {
		CoreError::Conflict(msg.into())
	}

	pub fn timeout(msg: impl Into<String>) -> Self {
		CoreError::Timeout(msg.into())
	}

	pub fn upstream(status: u16, msg: impl Into<String>) -> Self {
		CoreError::Upstream(status, msg.into())
	}

	pub fn internal(msg: impl Into<String>) -> Self {
		CoreError::Internal(msg.into())
	}

	/// Storage backends and core types raise plain `anyhow::Error`s prefixed
	/// by kind ("NotFound: …", "BadRequest: …", "Timeout: …", "Conflict: …");
	/// this reclassifies a generic error from below the resolver boundary
	/// into the matching `CoreError` kind instead of flattening everything
	/// into `Internal`.
	pub fn from_anyhow(err: &anyhow::Error) -> Self {
		let msg = err.to_string();
		if let Some(rest) = msg.strip_prefix("NotFound: ") {
			CoreError::NotFound(rest.to_string())
		} else if let Some(rest) = msg.strip_prefix("BadRequest: ") {
			CoreError::BadRequest(rest.to_string())
		} else if let Some(rest) = msg.strip_prefix("Timeout: ") {
			CoreError::Timeout(rest.to_string())
		} else if let Some(rest) = msg.strip_prefix("Conflict: ") {
			CoreError::Conflict(rest.to_string())
		} else if msg.contains("does not exist") {
			CoreError::NotFound(msg)
		} else {
			CoreError::Internal(msg)
		}
	}
}

impl fmt::Display for CoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CoreError::NotFound(m) => write!(f, "not found: {m}"),
			CoreError::BadRequest(m) => write!(f, "bad request: {m}"),
			CoreError::Conflict(m) => write!(f, "conflict: {m}"),
			CoreError::Timeout(m) => write!(f, "timeout: {m}"),
			CoreError::Upstream(status, m) => write!(f, "upstream {status}: {m}"),
			CoreError::Internal(m) => write!(f, "internal error: {m}"),
		}
	}
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reclassifies_not_found_from_anyhow() {
		let err = anyhow::anyhow!("Tile does not exist");
		assert!(matches!(CoreError::from_anyhow(&err), CoreError::NotFound(_)));
	}

	#[test]
	fn falls_back_to_internal() {
		let err = anyhow::anyhow!("disk on fire");
		assert!(matches!(CoreError::from_anyhow(&err), CoreError::Internal(_)));
	}

	#[test]
	fn display_includes_kind() {
		assert!(CoreError::conflict("export running").to_string().contains("conflict"));
	}
}
