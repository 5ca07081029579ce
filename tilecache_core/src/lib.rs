//! Shared primitives for tilecache's storage backends and resolver: tile
//! geometry, format detection/integrity, file locking, bounded concurrency,
//! and the typed error kinds crossing the resolver/HTTP boundary.

pub mod concurrency;
pub mod error;
pub mod filelock;
pub mod format;
pub mod protobuf;
pub mod types;

pub use error::CoreError;
