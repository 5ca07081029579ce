use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::path::Path;

/// `calculateMD5`: lowercase hex digest of a buffer.
pub fn calculate_md5(bytes: &[u8]) -> String {
	let mut hasher = Md5::new();
	hasher.update(bytes);
	hex_lower(&hasher.finalize())
}

/// `calculateMD5OfFile`: lowercase hex digest, read from disk.
pub async fn calculate_md5_of_file(path: &Path) -> Result<String> {
	let bytes = tokio::fs::read(path).await.with_context(|| format!("reading {path:?} for md5"))?;
	Ok(calculate_md5(&bytes))
}

fn hex_lower(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn matches_known_digest() {
		assert_eq!(calculate_md5(b"hello"), "5d41402abc4b2a76b9719d911017c592");
	}

	#[tokio::test]
	async fn reads_file_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tile.bin");
		tokio::fs::write(&path, b"hello").await.unwrap();
		assert_eq!(calculate_md5_of_file(&path).await.unwrap(), "5d41402abc4b2a76b9719d911017c592");
	}
}
