//! Streaming downloads into the sandbox.
//!
//! Bytes are streamed through a [`Hasher`] into a staging file and published
//! with an atomic rename. Any response, including 4xx/5xx, is a completed
//! exchange whose body lands at the destination; a failure to obtain or
//! finish reading a response leaves the destination untouched.

use crate::error::{Error, Result};
use crate::hash::{Hash, Hasher};
use crate::store::FileStore;
use crate::transport::{Headers, HttpTransport, Response, Transport, TransportOptions};
use futures_util::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

/// Options for [`Downloader::download`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Report the digest of the downloaded bytes.
    pub hash: bool,
    /// Fail with an integrity error unless the bytes have this digest.
    pub expected_hash: Option<Hash>,
}

/// Outcome of a completed exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadResult {
    pub uri: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub status: u16,
    pub headers: Headers,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
}

/// Downloads remote resources into a [`FileStore`].
#[derive(Clone)]
pub struct Downloader {
    store: FileStore,
    transport: Arc<dyn Transport>,
}

impl Downloader {
    pub fn new(store: FileStore, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    /// Build a downloader using [`HttpTransport`].
    pub fn with_http(store: FileStore, options: &TransportOptions) -> Result<Self> {
        let transport = HttpTransport::new(options)?;
        Ok(Self::new(store, Arc::new(transport)))
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Download `url` to the logical path `destination`.
    pub async fn download(
        &self,
        url: &str,
        destination: &str,
        options: DownloadOptions,
    ) -> Result<DownloadResult> {
        let path = self.store.resolve(destination)?;
        self.download_to(url, &path, options).await
    }

    /// Download `url` to an already-resolved path.
    pub(crate) async fn download_to(
        &self,
        url: &str,
        path: &Path,
        options: DownloadOptions,
    ) -> Result<DownloadResult> {
        let parsed = parse_url(url)?;
        self.store.ensure_parent_dir(path).await?;
        if tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(Error::is_a_directory(path));
        }

        let Response {
            status,
            headers,
            mut body,
        } = self.transport.fetch(&parsed).await?;
        debug!(url, status, "streaming response body");

        let algorithm = options
            .expected_hash
            .map(|h| h.algorithm())
            .unwrap_or_else(|| self.store.algorithm());
        let mut hasher = Hasher::new(algorithm);

        // The staging file is removed if anything below fails or the
        // future is dropped before publish.
        let (mut file, staged) = self.store.stage_file().await?;
        let mut size: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::transport(url, e.to_string()))?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = hasher.finalize();
        if let Some(expected) = options.expected_hash {
            if expected != actual {
                debug!(url, expected = %expected, actual = %actual, "digest mismatch");
                return Err(Error::integrity(path, expected.to_hex(), actual.to_hex()));
            }
        }

        self.store.publish(staged, path).await?;
        info!(url, path = %path.display(), status, size, "downloaded");

        let report_hash = options.hash || options.expected_hash.is_some();
        Ok(DownloadResult {
            uri: self.store.uri(path),
            path: path.to_path_buf(),
            status,
            headers,
            size,
            hash: report_hash.then_some(actual),
        })
    }
}

fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::invalid_url(url, e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(Error::invalid_url(
            url,
            format!("unsupported scheme: {}", other),
        )),
    }
}
