//! Store management and sandboxed file operations.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::paths::PathResolver;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::{TempDir, TempPath};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Staging directory for in-flight writes, downloads, and swaps.
pub const STAGING_DIR: &str = ".tmp";

/// Default cache directory, relative to the root.
pub const DEFAULT_CACHE_DIR: &str = "cache";

/// Options fixed for the lifetime of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Digest used for `info` hashes and cache verification.
    pub algorithm: Algorithm,
    /// Cache directory, relative to the root.
    pub cache_dir: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            cache_dir: DEFAULT_CACHE_DIR.to_string(),
        }
    }
}

/// Options for [`FileStore::info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfoOptions {
    /// Resolve the path relative to the cache directory.
    pub cache: bool,
    /// Compute the content digest of a file.
    pub hash: bool,
}

/// Options for [`FileStore::delete`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Treat a missing target as success.
    pub idempotent: bool,
}

/// Options for [`FileStore::make_directory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MkdirOptions {
    /// Create missing ancestors, and succeed if the directory already exists.
    pub intermediates: bool,
}

/// Metadata about a path in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    pub exists: bool,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
    pub uri: String,
}

impl FileInfo {
    fn missing(uri: String) -> Self {
        Self {
            exists: false,
            is_directory: false,
            size: None,
            modification_time: None,
            hash: None,
            uri,
        }
    }
}

/// A file store confined to a sandbox root.
///
/// Cloning is cheap; clones share the same resolver.
#[derive(Debug, Clone)]
pub struct FileStore {
    resolver: Arc<PathResolver>,
    algorithm: Algorithm,
    cache_dir: PathBuf,
    staging_dir: PathBuf,
}

impl FileStore {
    /// Initialize a new store at the given path.
    ///
    /// Creates the directory structure:
    /// - the root itself (document scope)
    /// - `<cache_dir>/` for cached assets
    /// - `.tmp/` for staging
    pub fn init<P: AsRef<Path>>(root: P, options: StoreOptions) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        let resolver = Arc::new(PathResolver::new(root)?);
        Self::with_resolver(resolver, options)
    }

    /// Open an existing store at the given path.
    ///
    /// The root must exist; missing internal directories are recreated.
    pub fn open<P: AsRef<Path>>(root: P, options: StoreOptions) -> Result<Self> {
        let resolver = Arc::new(PathResolver::new(root)?);
        Self::with_resolver(resolver, options)
    }

    /// Build a store around an existing resolver.
    pub fn with_resolver(resolver: Arc<PathResolver>, options: StoreOptions) -> Result<Self> {
        let staging_dir = resolver.root().join(STAGING_DIR);
        fs::create_dir_all(&staging_dir)?;

        let cache_dir = resolver.resolve(&options.cache_dir)?;
        if resolver.is_root(&cache_dir) || cache_dir.starts_with(&staging_dir) {
            return Err(Error::invalid_store(
                resolver.root(),
                format!("invalid cache directory: {}", options.cache_dir),
            ));
        }
        fs::create_dir_all(&cache_dir)?;

        debug!(root = %resolver.root().display(), algorithm = %options.algorithm, "opened store");

        Ok(Self {
            resolver,
            algorithm: options.algorithm,
            cache_dir,
            staging_dir,
        })
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Get the cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Get the staging directory.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Get the algorithm used by this store.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Get the shared path resolver.
    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    /// Resolve a logical path against the root.
    ///
    /// The staging directory is not part of the caller-visible sandbox.
    pub fn resolve(&self, logical: &str) -> Result<PathBuf> {
        let path = self.resolver.resolve(logical)?;
        self.reject_staging(path, logical)
    }

    /// Resolve a logical path against the cache directory.
    pub fn resolve_cache(&self, logical: &str) -> Result<PathBuf> {
        let path = self.resolver.resolve_in(&self.cache_dir, logical)?;
        self.reject_staging(path, logical)
    }

    /// The `file://` URI of a resolved path.
    pub fn uri(&self, path: &Path) -> String {
        self.resolver.to_uri(path)
    }

    fn reject_staging(&self, path: PathBuf, logical: &str) -> Result<PathBuf> {
        if path.starts_with(&self.staging_dir) {
            return Err(Error::out_of_scope(logical));
        }
        Ok(path)
    }

    fn reject_root(&self, path: &Path, logical: &str) -> Result<()> {
        if self.resolver.is_root(path) {
            return Err(Error::out_of_scope(logical));
        }
        Ok(())
    }

    /// Get metadata about a path. A missing path is not an error.
    pub async fn info(&self, logical: &str, options: InfoOptions) -> Result<FileInfo> {
        let path = if options.cache {
            self.resolve_cache(logical)?
        } else {
            self.resolve(logical)?
        };
        let uri = self.uri(&path);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if is_missing(&e) => return Ok(FileInfo::missing(uri)),
            Err(e) => return Err(e.into()),
        };

        let is_directory = metadata.is_dir();
        let modification_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64());

        let hash = if options.hash && !is_directory {
            Some(Hash::hash_file(self.algorithm, &path).await?)
        } else {
            None
        };

        Ok(FileInfo {
            exists: true,
            is_directory,
            size: (!is_directory).then(|| metadata.len()),
            modification_time,
            hash,
            uri,
        })
    }

    /// Read a file's full contents.
    pub async fn read(&self, logical: &str) -> Result<Vec<u8>> {
        let path = self.resolve(logical)?;
        debug!(path = %path.display(), "read");
        tokio::fs::read(&path).await.map_err(|e| io_error(e, &path))
    }

    /// Read a file as UTF-8 text.
    pub async fn read_to_string(&self, logical: &str) -> Result<String> {
        let bytes = self.read(logical).await?;
        String::from_utf8(bytes).map_err(|e| Error::from(e.utf8_error()))
    }

    /// Write a file, replacing any previous contents atomically.
    ///
    /// Never creates directories: the parent must already exist.
    pub async fn write(&self, logical: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.resolve(logical)?;
        self.ensure_parent_dir(&path).await?;
        if is_dir(&path).await {
            return Err(Error::is_a_directory(path));
        }

        let contents = contents.as_ref();
        let (mut file, staged) = self.stage_file().await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        self.publish(staged, &path).await?;
        debug!(path = %path.display(), bytes = contents.len(), "wrote file");
        Ok(())
    }

    /// Delete a file or a directory with its subtree.
    pub async fn delete(&self, logical: &str, options: DeleteOptions) -> Result<()> {
        let path = self.resolve(logical)?;
        self.reject_root(&path, logical)?;

        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if is_missing(&e) => {
                return if options.idempotent {
                    Ok(())
                } else {
                    Err(Error::not_found(path))
                };
            }
            Err(e) => return Err(e.into()),
        };

        let result = if metadata.is_dir() {
            // Detach the subtree first so it disappears in one step.
            let holder = self.staging_holder().await?;
            let detached = holder.path().join("deleted");
            match tokio::fs::rename(&path, &detached).await {
                Ok(()) => {
                    self.discard_holder(holder).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::remove_file(&path).await
        };

        match result {
            Ok(()) => {
                debug!(path = %path.display(), "deleted");
                Ok(())
            }
            Err(e) if is_missing(&e) && options.idempotent => Ok(()),
            Err(e) => Err(io_error(e, &path)),
        }
    }

    /// Move a file or directory, replacing the destination.
    pub async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        self.reject_root(&source, from)?;
        self.reject_root(&dest, to)?;

        let source_meta = tokio::fs::symlink_metadata(&source)
            .await
            .map_err(|e| io_error(e, &source))?;
        self.ensure_parent_dir(&dest).await?;

        if source == dest {
            return Ok(());
        }
        if dest.starts_with(&source) {
            return Err(Error::from(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot move {} into itself", source.display()),
            )));
        }

        let dest_is_dir = is_dir(&dest).await;
        if dest_is_dir || (source_meta.is_dir() && path_exists(&dest).await) {
            let holder = self.staging_holder().await?;
            swap_into_place(&source, &dest, &holder).await?;
            self.discard_holder(holder).await;
        } else {
            rename_or_copy(&source, &dest).await?;
        }

        debug!(from = %source.display(), to = %dest.display(), "moved");
        Ok(())
    }

    /// Copy a file or directory tree, replacing (not merging) the destination.
    pub async fn copy_path(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        self.reject_root(&source, from)?;
        self.reject_root(&dest, to)?;

        if !path_exists(&source).await {
            return Err(Error::not_found(source));
        }
        self.ensure_parent_dir(&dest).await?;

        if source == dest {
            return Ok(());
        }

        // Build the copy in staging, then swap it in.
        let holder = self.staging_holder().await?;
        let staged = holder.path().join("copy");
        let result = match copy_tree(&source, &staged).await {
            Ok(()) => swap_into_place(&staged, &dest, &holder).await,
            Err(e) => Err(e),
        };
        self.discard_holder(holder).await;
        result?;

        debug!(from = %source.display(), to = %dest.display(), "copied");
        Ok(())
    }

    /// Create a directory.
    pub async fn make_directory(&self, logical: &str, options: MkdirOptions) -> Result<()> {
        let path = self.resolve(logical)?;

        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            return if options.intermediates && metadata.is_dir() {
                Ok(())
            } else {
                Err(Error::already_exists(path))
            };
        }

        if !options.intermediates {
            self.ensure_parent_dir(&path).await?;
            tokio::fs::create_dir(&path)
                .await
                .map_err(|e| io_error(e, &path))?;
            debug!(path = %path.display(), "created directory");
            return Ok(());
        }

        // Find the missing chain, nearest existing ancestor last.
        let mut missing = Vec::new();
        let mut cursor = path.as_path();
        loop {
            match tokio::fs::metadata(cursor).await {
                Ok(metadata) if metadata.is_dir() => break,
                Ok(_) => return Err(Error::not_a_directory(cursor)),
                Err(e) if is_missing(&e) => {
                    missing.push(cursor.to_path_buf());
                    cursor = cursor
                        .parent()
                        .ok_or_else(|| Error::parent_missing(&path))?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut created: Vec<PathBuf> = Vec::new();
        for dir in missing.into_iter().rev() {
            if let Err(e) = tokio::fs::create_dir(&dir).await {
                if e.kind() == io::ErrorKind::AlreadyExists && is_dir(&dir).await {
                    continue;
                }
                for done in created.iter().rev() {
                    if let Err(cleanup) = tokio::fs::remove_dir(done).await {
                        warn!(path = %done.display(), error = %cleanup, "Failed to roll back directory");
                    }
                }
                return Err(io_error(e, &dir));
            }
            created.push(dir);
        }

        debug!(path = %path.display(), created = created.len(), "created directories");
        Ok(())
    }

    /// List the names of a directory's direct children, sorted.
    pub async fn read_directory(&self, logical: &str) -> Result<Vec<String>> {
        let path = self.resolve(logical)?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, &path))?;
        if !metadata.is_dir() {
            return Err(Error::not_a_directory(path));
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path() == self.staging_dir {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        names.sort();
        Ok(names)
    }

    /// Remove staging leftovers older than `max_age`.
    ///
    /// Returns the number of entries removed.
    pub async fn cleanup_stale_staging(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.staging_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }

            let result = if metadata.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await
            } else {
                tokio::fs::remove_file(entry.path()).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = ?entry.path(), error = %e, "Failed to cleanup stale staging entry")
                }
            }
        }

        debug!(removed, "cleaned staging directory");
        Ok(removed)
    }

    /// Fail with ParentMissing unless the parent of `path` is an existing directory.
    pub(crate) async fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if is_dir(parent).await => Ok(()),
            _ => Err(Error::parent_missing(path)),
        }
    }

    /// Create an empty staging file. Dropping the returned path deletes it.
    pub(crate) async fn stage_file(&self) -> Result<(tokio::fs::File, TempPath)> {
        let dir = self.staging_dir.clone();
        let (file, path) = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("stage-")
                .tempfile_in(&dir)
                .map(|t| t.into_parts())
        })
        .await??;
        Ok((tokio::fs::File::from_std(file), path))
    }

    /// Atomically rename a staging file onto its destination.
    pub(crate) async fn publish(&self, staged: TempPath, dest: &Path) -> Result<()> {
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || staged.persist(&dest)).await??;
        Ok(())
    }

    /// Create a scratch directory in staging, removed when discarded.
    async fn staging_holder(&self) -> Result<TempDir> {
        let dir = self.staging_dir.clone();
        let holder = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix("hold-").tempdir_in(&dir)
        })
        .await??;
        Ok(holder)
    }

    async fn discard_holder(&self, holder: TempDir) {
        let path = holder.path().to_path_buf();
        let result = tokio::task::spawn_blocking(move || holder.close()).await;
        if !matches!(result, Ok(Ok(()))) {
            warn!(path = %path.display(), "Failed to cleanup staging directory");
        }
    }
}

/// Rename `incoming` onto `dest`, first moving an existing `dest` aside into
/// `holder`. Restores the displaced entry if the rename fails.
async fn swap_into_place(incoming: &Path, dest: &Path, holder: &TempDir) -> Result<()> {
    let displaced = holder.path().join("displaced");
    let had_dest = path_exists(dest).await;
    if had_dest {
        tokio::fs::rename(dest, &displaced).await?;
    }

    if let Err(e) = rename_or_copy(incoming, dest).await {
        if had_dest {
            if let Err(restore) = tokio::fs::rename(&displaced, dest).await {
                warn!(path = %dest.display(), error = %restore, "Failed to restore displaced entry");
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Rename, falling back to copy + delete across devices.
async fn rename_or_copy(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(from = %from.display(), to = %to.display(), "rename crosses devices, copying");
            if let Err(copy_err) = copy_tree(from, to).await {
                if let Err(cleanup) = remove_any(to).await {
                    warn!(path = %to.display(), error = %cleanup, "Failed to cleanup partial copy");
                }
                return Err(copy_err);
            }
            if let Err(cleanup) = remove_any(from).await {
                warn!(path = %from.display(), error = %cleanup, "Failed to remove moved source");
            }
            Ok(())
        }
        Err(e) => Err(io_error(e, from)),
    }
}

/// Copy a file, or a directory recursively. Nested symlinks are skipped.
async fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(from)
        .await
        .map_err(|e| io_error(e, from))?;
    if !metadata.is_dir() {
        tokio::fs::copy(from, to).await?;
        return Ok(());
    }

    tokio::fs::create_dir(to).await?;
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = dst.join(entry.file_name());

            if file_type.is_dir() {
                tokio::fs::create_dir(&target).await?;
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &target).await?;
            } else {
                warn!(path = ?entry.path(), "Skipping symlink or special file during copy");
            }
        }
    }

    Ok(())
}

async fn remove_any(path: &Path) -> io::Result<()> {
    if is_dir(path).await {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// A path is missing if it, or one of its ancestors, does not exist as a directory.
fn is_missing(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

fn io_error(e: io::Error, path: &Path) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Error::not_found(path),
        io::ErrorKind::IsADirectory => Error::is_a_directory(path),
        io::ErrorKind::AlreadyExists => Error::already_exists(path),
        _ => Error::from(e),
    }
}
