//! Process-wide configuration, read once at startup from environment
//! variables (§6 "Environment variables") and injected as context rather
//! than consulted as an ambient global (§9 "global state").

use std::path::PathBuf;

/// Startup configuration. A single instance is built in `main` and handed
/// down to the registry, resolver, and HTTP server; worker processes would
/// each build their own (§9).
#[derive(Debug, Clone)]
pub struct Config {
	pub data_dir: PathBuf,
	pub postgresql_base_uri: Option<String>,
	pub serve_front_page: bool,
	pub serve_swagger: bool,
	pub service_name: String,
}

impl Config {
	/// Reads `DATA_DIR` (default `data`), `POSTGRESQL_BASE_URI`,
	/// `SERVE_FRONT_PAGE`, `SERVE_SWAGGER`, and `SERVICE_NAME` from the
	/// process environment.
	pub fn from_env() -> Self {
		Config {
			data_dir: std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("data")),
			postgresql_base_uri: std::env::var("POSTGRESQL_BASE_URI").ok(),
			serve_front_page: env_flag("SERVE_FRONT_PAGE", true),
			serve_swagger: env_flag("SERVE_SWAGGER", true),
			service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "tilecache".to_string()),
		}
	}

	pub fn caches_dir(&self) -> PathBuf {
		self.data_dir.join("caches")
	}
}

fn env_flag(name: &str, default: bool) -> bool {
	match std::env::var(name) {
		Ok(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"),
		Err(_) => default,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_when_unset() {
		// SAFETY: test-only, single-threaded access to process env.
		unsafe {
			std::env::remove_var("DATA_DIR");
			std::env::remove_var("SERVE_FRONT_PAGE");
		}
		let cfg = Config::from_env();
		assert_eq!(cfg.data_dir, PathBuf::from("data"));
		assert!(cfg.serve_front_page);
	}

	#[test]
	fn env_flag_parses_common_falsy_values() {
		// SAFETY: test-only, single-threaded access to process env.
		unsafe {
			std::env::set_var("SERVE_SWAGGER", "false");
		}
		assert!(!env_flag("SERVE_SWAGGER", true));
		unsafe {
			std::env::remove_var("SERVE_SWAGGER");
		}
	}
}
