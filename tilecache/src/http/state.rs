//! Shared Axum state: the registry plus process config, handed to every
//! handler by value (it's an `Arc` wrapper, so clones are cheap).

use crate::registry::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
	pub registry: Arc<Registry>,
}

impl AppState {
	pub fn new(registry: Arc<Registry>) -> Self {
		AppState { registry }
	}
}
