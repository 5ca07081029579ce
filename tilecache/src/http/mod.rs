//! The HTTP surface (§6): Axum router, shared state, and the route-dependent
//! error mapping (§7). Implemented in-tree rather than as an external
//! collaborator since the binary needs to be runnable and testable
//! end-to-end on its own.

mod error;
mod files;
mod state;
mod tiles;

pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;

mod routes;
