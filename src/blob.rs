//! Per-blob bookkeeping for updates.

use std::time::SystemTime;

use composeapp_oci::{BlobProvider, ContentStore, Descriptor, OciError, ReadOpts};
use serde::{Deserialize, Serialize};

use crate::app::{BlobType, LayersMeta, TreeNode};
use crate::usage::align_up;
use crate::Result;

/// Fallback inflation factor for compressed layers without size hints.
const LAYER_RUNTIME_FACTOR: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobState {
    #[default]
    Undefined,
    Ok,
    Missing,
    SizeInvalid,
    DigestInvalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub descriptor: Descriptor,
    pub state: BlobState,
    pub blob_type: BlobType,
    /// Bytes the blob takes in the store.
    pub store_size: u64,
    /// Bytes the blob takes once extracted by the daemon.
    pub runtime_size: u64,
    #[serde(default)]
    pub bytes_fetched: u64,
    #[serde(default)]
    pub fetch_start: Option<SystemTime>,
    /// Bytes per second over the last sample.
    #[serde(default)]
    pub read_speed_cur: u64,
    /// Bytes per second since `fetch_start`.
    #[serde(default)]
    pub read_speed_avg: u64,
}

impl BlobInfo {
    pub fn new(
        node: &TreeNode,
        state: BlobState,
        block_size: u64,
        layers_meta: Option<&LayersMeta>,
    ) -> Self {
        let size = node.descriptor.size;
        let runtime_size = match node.blob_type {
            BlobType::ImageLayer => match layers_meta.and_then(|m| m.layer(&node.descriptor.digest)) {
                Some(hint) => align_up(hint.usage, layers_meta.map_or(block_size, |m| m.fs_block_size)),
                None => size.saturating_mul(LAYER_RUNTIME_FACTOR),
            },
            _ => align_up(size, block_size),
        };
        Self {
            descriptor: node.descriptor.clone(),
            state,
            blob_type: node.blob_type,
            store_size: align_up(size, block_size),
            runtime_size,
            bytes_fetched: 0,
            fetch_start: None,
            read_speed_cur: 0,
            read_speed_avg: 0,
        }
    }
}

/// Verify a blob in the store by draining it through an integrity reader.
pub async fn check_blob(store: &ContentStore, desc: &Descriptor) -> Result<BlobState> {
    let opts = ReadOpts::new()
        .digest(desc.digest.clone())
        .size(desc.size);
    let stream = match store.open_blob(&opts).await {
        Ok(s) => s,
        Err(OciError::NotFound(_)) => return Ok(BlobState::Missing),
        Err(e) => return Err(e.into()),
    };
    match composeapp_oci::reader::drain(stream).await {
        Ok(_) => Ok(BlobState::Ok),
        Err(OciError::SizeMismatch { .. }) => Ok(BlobState::SizeInvalid),
        Err(OciError::DigestMismatch { .. }) => Ok(BlobState::DigestInvalid),
        Err(e) => Err(e.into()),
    }
}
