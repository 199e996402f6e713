//! Bundled asset metadata.
//!
//! A manifest is a JSON document:
//!
//! ```json
//! {
//!   "base_url": "https://cdn.example.com/assets",
//!   "assets": {
//!     "avatar": { "name": "avatar2", "type": "png", "hash": "1e02045c10b8f1145edc7c8375998f87" }
//!   }
//! }
//! ```
//!
//! An asset's URL is its `url` field if present, else `<base_url>/<name>.<type>`.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// Metadata for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetMetadata {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: Hash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    assets: BTreeMap<String, RawAsset>,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    hash: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    url: Option<String>,
}

/// Asset metadata keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    assets: BTreeMap<String, AssetMetadata>,
}

impl Manifest {
    /// Parse a manifest, validating hashes with `algorithm`.
    pub fn from_json(json: &str, algorithm: Algorithm) -> Result<Self> {
        let raw: RawManifest =
            serde_json::from_str(json).map_err(|e| Error::manifest(e.to_string()))?;

        let mut assets = BTreeMap::new();
        for (id, asset) in raw.assets {
            let hash = Hash::from_hex(algorithm, &asset.hash)
                .map_err(|e| Error::manifest(format!("asset {}: {}", id, e)))?;
            let url = asset_url(&id, &asset, raw.base_url.as_deref())?;

            assets.insert(
                id.clone(),
                AssetMetadata {
                    id,
                    name: asset.name,
                    kind: asset.kind,
                    hash,
                    width: asset.width,
                    height: asset.height,
                    url,
                },
            );
        }

        Ok(Self { assets })
    }

    /// Load a manifest file.
    pub async fn load(path: &Path, algorithm: Algorithm) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json, algorithm)
    }

    /// Build a manifest from already-validated entries.
    pub fn from_assets(assets: impl IntoIterator<Item = AssetMetadata>) -> Self {
        Self {
            assets: assets.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&AssetMetadata> {
        self.assets.get(id)
    }

    /// Iterate over assets in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &AssetMetadata> {
        self.assets.values()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

fn asset_url(id: &str, asset: &RawAsset, base_url: Option<&str>) -> Result<String> {
    let url = match (&asset.url, base_url) {
        (Some(url), _) => url.clone(),
        (None, Some(base)) if asset.kind.is_empty() => {
            format!("{}/{}", base.trim_end_matches('/'), asset.name)
        }
        (None, Some(base)) => format!(
            "{}/{}.{}",
            base.trim_end_matches('/'),
            asset.name,
            asset.kind
        ),
        (None, None) => {
            return Err(Error::manifest(format!(
                "asset {} has no url and the manifest has no base_url",
                id
            )));
        }
    };

    Url::parse(&url).map_err(|e| Error::manifest(format!("asset {}: invalid url {}: {}", id, url, e)))?;
    Ok(url)
}
