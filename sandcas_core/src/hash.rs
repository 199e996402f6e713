//! Content digests (MD5 and BLAKE3), computed incrementally.

use crate::error::{Error, Result};
use md5::Digest;
use serde::{Serialize, Serializer};
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Largest digest size in bytes (BLAKE3 produces 256-bit hashes).
pub const MAX_HASH_SIZE: usize = 32;

/// Read buffer used when hashing files.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    /// MD5 with 128-bit output. Asset manifests declare MD5 digests.
    #[default]
    Md5,
    /// BLAKE3 with 256-bit output.
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Blake3 => "blake3-256",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Algorithm::Md5),
            "blake3" | "blake3-256" => Ok(Algorithm::Blake3),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Algorithm::Md5 => 16,
            Algorithm::Blake3 => 32,
        }
    }

    /// Digest length in hex characters.
    pub fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content digest tagged with the algorithm that produced it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    algorithm: Algorithm,
    bytes: [u8; MAX_HASH_SIZE],
}

impl Hash {
    /// Create a Hash from a raw digest.
    pub fn from_digest(algorithm: Algorithm, digest: &[u8]) -> Result<Self> {
        if digest.len() != algorithm.digest_len() {
            return Err(Error::invalid_hash(format!(
                "Expected {} bytes for {}, got {}",
                algorithm.digest_len(),
                algorithm,
                digest.len()
            )));
        }

        let mut bytes = [0u8; MAX_HASH_SIZE];
        bytes[..digest.len()].copy_from_slice(digest);
        Ok(Hash { algorithm, bytes })
    }

    /// Create a Hash from a hex string of the algorithm's length.
    pub fn from_hex(algorithm: Algorithm, hex_str: &str) -> Result<Self> {
        if hex_str.len() != algorithm.hex_len() {
            return Err(Error::invalid_hash(format!(
                "Expected {} hex characters for {}, got {}",
                algorithm.hex_len(),
                algorithm,
                hex_str.len()
            )));
        }

        let digest =
            hex::decode(hex_str).map_err(|e| Error::invalid_hash(format!("Invalid hex: {}", e)))?;
        Self::from_digest(algorithm, &digest)
    }

    /// Parse a hex string, inferring the algorithm from its length.
    pub fn parse_hex(hex_str: &str) -> Result<Self> {
        let algorithm = if hex_str.len() == Algorithm::Md5.hex_len() {
            Algorithm::Md5
        } else if hex_str.len() == Algorithm::Blake3.hex_len() {
            Algorithm::Blake3
        } else {
            return Err(Error::invalid_hash(format!(
                "Cannot infer algorithm from {} hex characters",
                hex_str.len()
            )));
        };
        Self::from_hex(algorithm, hex_str)
    }

    /// Convert to lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// The algorithm that produced this digest.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Get the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.algorithm.digest_len()]
    }

    /// Hash raw bytes.
    pub fn hash_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash data from a reader.
    pub fn hash_reader<R: Read>(algorithm: Algorithm, mut reader: R) -> Result<Self> {
        let mut hasher = Hasher::new(algorithm);
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finalize())
    }

    /// Hash a file without loading it into memory.
    pub async fn hash_file(algorithm: Algorithm, path: &Path) -> Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Hasher::new(algorithm);
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finalize())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}:{})", self.algorithm, self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

enum HasherState {
    Md5(md5::Md5),
    Blake3(Box<blake3::Hasher>),
}

/// Incremental hasher. Feeding the same bytes in any chunking yields the same digest.
pub struct Hasher {
    state: HasherState,
}

impl Hasher {
    /// Create a hasher for the given algorithm.
    pub fn new(algorithm: Algorithm) -> Self {
        let state = match algorithm {
            Algorithm::Md5 => HasherState::Md5(md5::Md5::new()),
            Algorithm::Blake3 => HasherState::Blake3(Box::new(blake3::Hasher::new())),
        };
        Self { state }
    }

    /// The algorithm this hasher computes.
    pub fn algorithm(&self) -> Algorithm {
        match self.state {
            HasherState::Md5(_) => Algorithm::Md5,
            HasherState::Blake3(_) => Algorithm::Blake3,
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Consume the hasher and produce the digest.
    pub fn finalize(self) -> Hash {
        let mut bytes = [0u8; MAX_HASH_SIZE];
        let algorithm = self.algorithm();
        match self.state {
            HasherState::Md5(h) => bytes[..16].copy_from_slice(&h.finalize()),
            HasherState::Blake3(h) => bytes.copy_from_slice(h.finalize().as_bytes()),
        }
        Hash { algorithm, bytes }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}
