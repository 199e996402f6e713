//! # Sandcas Core
//!
//! A sandboxed local file store with a content-addressed download cache.
//!
//! Every path a caller supplies is resolved against a single sandbox root and
//! rejected if it would land outside of it. On top of that the crate provides
//! streaming, integrity-checked downloads and an asset cache that names files
//! by their content hash.
//!
//! ## Features
//!
//! - Path confinement: `..`, absolute paths, `file://` URIs and symlinks are
//!   all checked after canonicalization
//! - Atomic writes: data is staged and renamed into place
//! - Streaming downloads with MD5 or BLAKE3 verification
//! - Asset cache keyed by content hash, with explicit pruning
//!
//! ## Example
//!
//! ```no_run
//! use sandcas_core::{
//!     AssetCache, DownloadOptions, Downloader, FileStore, Manifest, StoreOptions,
//!     TransportOptions,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // Initialize a new store
//! let store = FileStore::init("./sandbox", StoreOptions::default())?;
//!
//! // Plain file operations stay inside the sandbox
//! store.write("notes.txt", "hello, world").await?;
//! assert!(store.write("../escape.txt", "nope").await.is_err());
//!
//! // Download with a digest
//! let downloader = Downloader::with_http(store.clone(), &TransportOptions::default())?;
//! let options = DownloadOptions { hash: true, ..Default::default() };
//! let result = downloader
//!     .download("https://example.com/data.json", "data.json", options)
//!     .await?;
//! println!("{} ({} bytes, status {})", result.uri, result.size, result.status);
//!
//! // Materialize a manifest asset into the cache
//! let manifest = Manifest::load("./assets.json".as_ref(), store.algorithm()).await?;
//! let cache = AssetCache::new(downloader, manifest, "asset");
//! let entry = cache.download("avatar").await?;
//! println!("cached at {:?}", entry.local_uri);
//! # Ok(())
//! # }
//! ```

mod asset;
mod download;
mod error;
mod hash;
mod manifest;
mod paths;
mod store;
mod transport;

pub use asset::{AssetCache, CacheEntry, DEFAULT_CACHE_PREFIX, PruneStats};
pub use download::{DownloadOptions, DownloadResult, Downloader};
pub use error::{Error, Result};
pub use hash::{Algorithm, Hash, Hasher};
pub use manifest::{AssetMetadata, Manifest};
pub use paths::PathResolver;
pub use store::{
    DEFAULT_CACHE_DIR, DeleteOptions, FileInfo, FileStore, InfoOptions, MkdirOptions,
    STAGING_DIR, StoreOptions,
};
pub use transport::{
    BodyStream, DEFAULT_CONNECT_TIMEOUT, Headers, HttpTransport, Response, Transport,
    TransportOptions,
};
