//! Atomic file create/delete guarded by a per-path advisory lock (§4.A).
//!
//! XYZ caching writes millions of small files concurrently across workers;
//! without a file-scoped lock a reader can observe a partial write. The
//! lock itself is a sidecar `<path>.lock` file created with
//! `OpenOptions::create_new`, which is atomic on every platform this crate
//! targets — no extra crate is needed for a primitive this narrow, the same
//! judgment call the teacher makes for `ConcurrencyLimits`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::{Instant, sleep};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct LockGuard {
	lock_path: PathBuf,
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.lock_path);
	}
}

async fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard> {
	let lock_path = lock_path_for(path);
	if let Some(parent) = lock_path.parent() {
		fs::create_dir_all(parent).await.with_context(|| format!("creating parent dir for {lock_path:?}"))?;
	}
	let deadline = Instant::now() + timeout;
	loop {
		match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path).await {
			Ok(_) => return Ok(LockGuard { lock_path }),
			Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
				if Instant::now() >= deadline {
					anyhow::bail!("Timeout: could not acquire lock on {path:?} within {timeout:?}");
				}
				sleep(POLL_INTERVAL).await;
			}
			Err(err) => return Err(err).with_context(|| format!("creating lock file {lock_path:?}")),
		}
	}
}

fn lock_path_for(path: &Path) -> PathBuf {
	let mut s = path.as_os_str().to_owned();
	s.push(".lock");
	PathBuf::from(s)
}

/// Atomically writes `bytes` to `path`, guarded by a per-path advisory lock.
pub async fn create_file_with_lock(path: &Path, bytes: &[u8], timeout: Duration) -> Result<()> {
	let _guard = acquire(path, timeout).await?;
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await.with_context(|| format!("creating parent dir for {path:?}"))?;
	}
	let tmp_path = path.with_extension(format!("{}.tmp", uuid_like_suffix()));
	fs::write(&tmp_path, bytes).await.with_context(|| format!("writing {tmp_path:?}"))?;
	fs::rename(&tmp_path, path).await.with_context(|| format!("renaming {tmp_path:?} to {path:?}"))?;
	Ok(())
}

/// Deletes `path`, guarded by the same per-path lock.
pub async fn remove_file_with_lock(path: &Path, timeout: Duration) -> Result<()> {
	let _guard = acquire(path, timeout).await?;
	match fs::remove_file(path).await {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(err) => Err(err).with_context(|| format!("removing {path:?}")),
	}
}

/// Removes lock files older than `max_age`, run once at startup to clean up
/// after a crashed worker that never released its lock.
pub async fn clean_stale_locks(root: &Path, max_age: Duration) -> Result<()> {
	let mut stack = vec![root.to_path_buf()];
	while let Some(dir) = stack.pop() {
		let Ok(mut entries) = fs::read_dir(&dir).await else { continue };
		while let Ok(Some(entry)) = entries.next_entry().await {
			let path = entry.path();
			let Ok(metadata) = entry.metadata().await else { continue };
			if metadata.is_dir() {
				stack.push(path);
				continue;
			}
			if path.extension().is_some_and(|ext| ext == "lock") {
				if let Ok(modified) = metadata.modified() {
					if modified.elapsed().unwrap_or_default() > max_age {
						let _ = fs::remove_file(&path).await;
					}
				}
			}
		}
	}
	Ok(())
}

fn uuid_like_suffix() -> String {
	use std::time::{SystemTime, UNIX_EPOCH};
	format!("{}", SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn creates_and_reads_back() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a/b/tile.png");
		create_file_with_lock(&path, b"hello", Duration::from_secs(1)).await.unwrap();
		assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
		assert!(!lock_path_for(&path).exists());
	}

	#[tokio::test]
	async fn remove_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tile.png");
		remove_file_with_lock(&path, Duration::from_secs(1)).await.unwrap();
	}

	#[tokio::test]
	async fn second_writer_times_out_while_locked() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tile.png");
		let _held = acquire(&path, Duration::from_secs(1)).await.unwrap();
		let result = create_file_with_lock(&path, b"x", Duration::from_millis(50)).await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn clean_stale_locks_removes_old_lock_files() {
		let dir = tempfile::tempdir().unwrap();
		let lock = dir.path().join("tile.png.lock");
		tokio::fs::write(&lock, b"").await.unwrap();
		clean_stale_locks(dir.path(), Duration::from_secs(0)).await.unwrap();
		assert!(!lock.exists());
	}
}
