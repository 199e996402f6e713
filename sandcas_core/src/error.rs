//! Error types for sandcas_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using sandcas_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during sandbox, download, and cache operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Path canonicalizes outside the sandbox root.
    #[error("Path is out of scope: {path}")]
    OutOfScope { path: String },

    /// Operation target (or a required ancestor) does not exist.
    #[error("File or directory not found: {path}")]
    NotFound { path: PathBuf },

    /// Non-intermediate directory creation collided with an existing entry.
    #[error("Path already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// Parent directory of the target does not exist.
    #[error("Parent directory does not exist: {path}")]
    ParentMissing { path: PathBuf },

    /// Directory-only operation invoked on something that is not a directory.
    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// File-only operation invoked on a directory.
    #[error("Is a directory: {path}")]
    IsADirectory { path: PathBuf },

    /// The network layer failed to produce a complete response.
    #[error("Transport error for {url}: {reason}")]
    Transport { url: String, reason: String },

    /// Downloaded or cached content does not match its expected digest.
    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Remote URL could not be parsed or is not fetchable.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// Sandbox root is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Asset identifier is not in the manifest.
    #[error("Unknown asset: {id}")]
    UnknownAsset { id: String },

    /// Asset manifest is malformed.
    #[error("Invalid manifest: {reason}")]
    Manifest { reason: String },

    /// UTF-8 encoding error.
    #[error("UTF-8 error: {source}")]
    Utf8Error {
        #[from]
        source: std::str::Utf8Error,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an OutOfScope error.
    pub fn out_of_scope(path: impl Into<String>) -> Self {
        Error::OutOfScope { path: path.into() }
    }

    /// Create a NotFound error.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Error::NotFound { path: path.into() }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<PathBuf>) -> Self {
        Error::AlreadyExists { path: path.into() }
    }

    /// Create a ParentMissing error.
    pub fn parent_missing(path: impl Into<PathBuf>) -> Self {
        Error::ParentMissing { path: path.into() }
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<PathBuf>) -> Self {
        Error::NotADirectory { path: path.into() }
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<PathBuf>) -> Self {
        Error::IsADirectory { path: path.into() }
    }

    /// Create a Transport error.
    pub fn transport(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Transport {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create an Integrity error.
    pub fn integrity(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Error::Integrity {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an InvalidUrl error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnknownAsset error.
    pub fn unknown_asset(id: impl Into<String>) -> Self {
        Error::UnknownAsset { id: id.into() }
    }

    /// Create a Manifest error.
    pub fn manifest(reason: impl Into<String>) -> Self {
        Error::Manifest {
            reason: reason.into(),
        }
    }

    /// Whether this error means the target did not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// Additional From implementations for external error types

impl From<tempfile::PathPersistError> for Error {
    fn from(err: tempfile::PathPersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io {
            source: std::io::Error::other(err.to_string()),
        }
    }
}
