//! Per-architecture image layer size hints shipped next to the bundle.
//!
//! ```json
//! { "arm64": { "fs_block_size": 4096,
//!              "layers": { "sha256:…": { "size": 1, "usage": 2, "archive_size": 3 } } } }
//! ```

use std::collections::BTreeMap;

use composeapp_oci::Digest;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Annotation marking the layers-meta layer of an app manifest.
pub const ANNOTATION_LAYERS_META: &str = "layers-meta";
pub const LAYERS_META_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMeta {
    pub size: u64,
    /// Bytes on disk once extracted by the daemon.
    pub usage: u64,
    #[serde(default)]
    pub archive_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayersMeta {
    pub fs_block_size: u64,
    #[serde(default)]
    pub layers: BTreeMap<Digest, LayerMeta>,
}

impl LayersMeta {
    /// Pick the entry for `arch` out of the per-architecture document.
    /// A missing architecture is not an error.
    pub fn parse_for_arch(bytes: &[u8], arch: &str) -> Result<Option<Self>> {
        let mut doc: BTreeMap<String, LayersMeta> = serde_json::from_slice(bytes)?;
        Ok(doc.remove(arch))
    }

    pub fn layer(&self, digest: &Digest) -> Option<&LayerMeta> {
        self.layers.get(digest)
    }
}
