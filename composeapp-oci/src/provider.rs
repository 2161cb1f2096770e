//! Polymorphic sources of blob byte streams.
//!
//! Every provider hands out readers wrapped in an [`IntegrityReader`], so a
//! consumer that drains a stream to the end has verified the blob.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::digest::Digest;
use crate::reader::{read_all, BlobStream, IntegrityReader};
use crate::reference::Reference;
use crate::{OciError, Result};

/// Options for a single blob read.
#[derive(Debug, Clone, Default)]
pub struct ReadOpts {
    /// Remote location, `host/repo@sha256:<hex>`.
    pub reference: Option<String>,
    pub expected_digest: Option<Digest>,
    pub expected_size: Option<u64>,
    pub read_limit: Option<u64>,
    /// Media type hint; selects the registry endpoint for remote reads.
    pub media_type: Option<String>,
    /// Start reading at this byte offset (resumed fetches).
    pub offset: u64,
}

impl ReadOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn digest(mut self, digest: Digest) -> Self {
        self.expected_digest = Some(digest);
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.read_limit = Some(limit);
        self
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// The digest to verify against: the explicit one, else the `@sha256:`
    /// suffix of the reference.
    pub fn resolve_digest(&self) -> Result<Digest> {
        if let Some(d) = &self.expected_digest {
            return Ok(d.clone());
        }
        match &self.reference {
            Some(raw) => Reference::parse(raw)?
                .digest
                .ok_or_else(|| OciError::DigestRequired(raw.clone())),
            None => Err(OciError::DigestRequired("<no reference>".to_string())),
        }
    }

    /// Wrap `inner`, which starts at `self.offset`, in an integrity reader.
    ///
    /// Ranged reads cannot see the prefix, so they verify size only; the
    /// store writer verifies the digest of a resumed blob at commit.
    pub fn wrap<R>(&self, inner: R, digest: Digest) -> Result<BlobStream>
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        let reader = if self.offset == 0 {
            IntegrityReader::new(inner, Some(digest), self.expected_size, self.read_limit)?
        } else {
            let size = self.expected_size.ok_or_else(|| {
                OciError::Manifest("a ranged read requires the blob size".to_string())
            })?;
            if self.offset > size {
                return Err(OciError::SizeMismatch {
                    expected: size,
                    got: self.offset,
                });
            }
            IntegrityReader::new(
                inner,
                None,
                Some(size - self.offset),
                self.read_limit.map(|l| l.saturating_sub(self.offset)),
            )?
        };
        Ok(Box::new(reader))
    }
}

/// A source of blob byte streams.
///
/// Cancellation is cooperative: dropping the returned stream (or the future
/// producing it) aborts the read.
#[async_trait]
pub trait BlobProvider: Send + Sync {
    async fn open_blob(&self, opts: &ReadOpts) -> Result<BlobStream>;
}

/// Read a whole blob of known digest and size.
pub async fn read_blob(
    provider: &dyn BlobProvider,
    reference: &str,
    digest: &Digest,
    size: u64,
) -> Result<Vec<u8>> {
    let opts = ReadOpts::new()
        .reference(reference)
        .digest(digest.clone())
        .size(size);
    read_all(provider.open_blob(&opts).await?).await
}

/// Read a whole blob whose size is unknown, refusing more than `limit`
/// bytes. The digest comes from the reference.
pub async fn read_blob_with_limit(
    provider: &dyn BlobProvider,
    reference: &str,
    limit: u64,
) -> Result<Vec<u8>> {
    let opts = ReadOpts::new().reference(reference).limit(limit);
    read_all(provider.open_blob(&opts).await?).await
}

// ---------------------------------------------------------------------------
// In-memory provider
// ---------------------------------------------------------------------------

/// Blobs held in a map, keyed by digest. Used for tests and for serving
/// blobs already loaded in memory.
#[derive(Default)]
pub struct MemoryProvider {
    blobs: RwLock<HashMap<Digest, Vec<u8>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` under its own digest.
    pub fn insert(&self, data: impl Into<Vec<u8>>) -> Digest {
        let data = data.into();
        let digest = Digest::of(&data);
        self.insert_raw(digest.clone(), data);
        digest
    }

    /// Store `data` under an arbitrary digest, even a wrong one.
    pub fn insert_raw(&self, digest: Digest, data: impl Into<Vec<u8>>) {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(digest, data.into());
        }
    }

    pub fn remove(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.blobs.write().ok()?.remove(digest)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(digest))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobProvider for MemoryProvider {
    async fn open_blob(&self, opts: &ReadOpts) -> Result<BlobStream> {
        let digest = opts.resolve_digest()?;
        let data = self
            .blobs
            .read()
            .map_err(|_| OciError::Registry("in-memory blob map poisoned".to_string()))?
            .get(&digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(digest.to_string()))?;
        let start = usize::try_from(opts.offset)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let tail = data[start..].to_vec();
        opts.wrap(std::io::Cursor::new(tail), digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(d: &Digest) -> String {
        format!("hub.io/factory/app@{d}")
    }

    #[tokio::test]
    async fn read_happy_path() {
        let provider = MemoryProvider::new();
        let data = b"some blob data";
        let d = provider.insert(&data[..]);
        let out = read_blob(&provider, &reference(&d), &d, 14).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn size_off_by_one() {
        let provider = MemoryProvider::new();
        let data = b"some blob data";
        let d = provider.insert(&data[..]);
        let shorter = read_blob(&provider, &reference(&d), &d, 13).await;
        assert!(matches!(shorter, Err(OciError::DigestMismatch { .. })));
        let longer = read_blob(&provider, &reference(&d), &d, 15).await;
        assert!(matches!(longer, Err(OciError::SizeMismatch { .. })));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let provider = MemoryProvider::new();
        let d = Digest::of(b"nothing");
        let err = read_blob(&provider, &reference(&d), &d, 7)
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::NotFound(_)));
    }

    #[tokio::test]
    async fn digest_is_required() {
        let provider = MemoryProvider::new();
        let opts = ReadOpts::new().size(3);
        assert!(matches!(
            provider.open_blob(&opts).await,
            Err(OciError::DigestRequired(_))
        ));
    }

    #[tokio::test]
    async fn ranged_read_returns_tail() {
        let provider = MemoryProvider::new();
        let d = provider.insert(&b"0123456789"[..]);
        let opts = ReadOpts::new().digest(d).size(10).offset(4);
        let out = read_all(provider.open_blob(&opts).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out, b"456789");
    }
}
