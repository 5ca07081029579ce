//! `getBytes(offset, length)` source abstraction (§4.E): local files read via
//! `pread`-equivalent seek+read on the blocking pool, remote archives via
//! HTTP `Range` requests, grounded on the teacher's
//! `versatiles_container::container::pmtiles::reader`'s dual local/http
//! `DataReaderTrait` implementations.

use anyhow::{Context, Result, bail, ensure};
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub enum ByteSource {
	File(Arc<PathBuf>),
	Http { client: reqwest::Client, url: String },
}

impl ByteSource {
	pub async fn file(path: &Path) -> Result<Self> {
		ensure!(tokio::fs::metadata(path).await.is_ok(), "pmtiles file not found: {path:?}");
		Ok(ByteSource::File(Arc::new(path.to_path_buf())))
	}

	pub fn http(url: String) -> Self {
		ByteSource::Http { client: reqwest::Client::new(), url }
	}

	pub async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
		match self {
			ByteSource::File(path) => {
				let path = path.clone();
				tokio::task::spawn_blocking(move || read_file_range(&path, offset, length)).await.context("pmtiles blocking read task panicked")?
			}
			ByteSource::Http { client, url } => read_http_range(client, url, offset, length).await,
		}
	}

	pub fn local_path(&self) -> Option<&Path> {
		match self {
			ByteSource::File(path) => Some(path.as_path()),
			ByteSource::Http { .. } => None,
		}
	}

	pub async fn len(&self) -> Result<u64> {
		match self {
			ByteSource::File(path) => Ok(tokio::fs::metadata(path.as_path()).await?.len()),
			ByteSource::Http { client, url } => {
				let resp = client.head(url).send().await.context("pmtiles HEAD request failed")?;
				Ok(resp.content_length().unwrap_or(0))
			}
		}
	}
}

fn read_file_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
	let mut file = std::fs::File::open(path).with_context(|| format!("opening pmtiles file {path:?}"))?;
	file.seek(SeekFrom::Start(offset))?;
	let mut buf = vec![0u8; length as usize];
	file.read_exact(&mut buf)?;
	Ok(buf)
}

async fn read_http_range(client: &reqwest::Client, url: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
	let end = offset + length.saturating_sub(1);
	let resp = client
		.get(url)
		.header(RANGE, format!("bytes={offset}-{end}"))
		.send()
		.await
		.with_context(|| format!("pmtiles range request to {url} failed"))?;
	if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT && resp.status() != reqwest::StatusCode::OK {
		bail!("pmtiles: unexpected HTTP status {} from {url}", resp.status());
	}
	let has_content_range = resp.headers().contains_key(CONTENT_RANGE);
	let bytes = resp.bytes().await.context("reading pmtiles HTTP response body")?;
	if !has_content_range && bytes.len() as u64 > length {
		bail!("pmtiles: server at {url} ignored Range header and returned the full body");
	}
	Ok(bytes.to_vec())
}
