//! Filesystem-backed content-addressed store.
//!
//! ```text
//! <root>/
//!   blobs/sha256/<hex>          committed, verified blobs
//!   ingest/<sha256(ref)>/data   in-progress writes, keyed by fetch reference
//!   ingest/<sha256(ref)>/ref    the reference the write belongs to
//!   apps/<name>/<hex>/uri       app layouts (managed by the caller)
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::digest::Digest;
use crate::manifest::Descriptor;
use crate::provider::{BlobProvider, ReadOpts};
use crate::reader::BlobStream;
use crate::{OciError, Result};

const COPY_CHUNK: usize = 64 * 1024;

/// Content-addressed blob store stored under `<root>/blobs/sha256/<hex>`.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

/// Statistics from a prune run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub removed: Vec<Digest>,
    pub freed_bytes: u64,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Return a reference to the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds all blobs: `<root>/blobs/sha256/`.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    /// Directory that holds app layouts: `<root>/apps/`.
    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    fn ingest_dir(&self, ref_key: &str) -> PathBuf {
        self.root
            .join("ingest")
            .join(Digest::of(ref_key.as_bytes()).hex())
    }

    /// Return the expected path for a blob with the given digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    /// Check whether a blob for `digest` already exists on disk.
    pub async fn has_blob(&self, digest: &Digest) -> bool {
        fs::metadata(self.blob_path(digest))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Size of a committed blob.
    pub async fn info(&self, digest: &Digest) -> Result<u64> {
        match fs::metadata(self.blob_path(digest)).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(OciError::NotFound(digest.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OciError::NotFound(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Offset reached by an in-progress write keyed by `ref_key`, if any.
    pub async fn status(&self, ref_key: &str) -> Result<Option<u64>> {
        match fs::metadata(self.ingest_dir(ref_key).join("data")).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a writer for `expected`, resuming a previous partial write with
    /// the same `ref_key`. Fails with `AlreadyExists` when the blob is
    /// already committed.
    pub async fn writer(&self, ref_key: &str, expected: &Descriptor) -> Result<BlobWriter> {
        let target = self.blob_path(&expected.digest);
        if self.has_blob(&expected.digest).await {
            return Err(OciError::AlreadyExists(expected.digest.to_string()));
        }

        let dir = self.ingest_dir(ref_key);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join("ref"), ref_key.as_bytes()).await?;

        let data_path = dir.join("data");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&data_path)
            .await?;

        // Re-seed the hasher with whatever a previous attempt left behind.
        let mut hasher = Sha256::new();
        let mut offset = file.metadata().await?.len();
        if offset > expected.size {
            warn!(digest = %expected.digest, offset, "partial write larger than blob; restarting");
            file.set_len(0).await?;
            offset = 0;
        } else if offset > 0 {
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            debug!(digest = %expected.digest, offset, "resuming partial write");
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        Ok(BlobWriter {
            file,
            hasher,
            offset,
            expected: expected.clone(),
            ingest_dir: dir,
            data_path,
            target,
        })
    }

    /// Discard an in-progress write.
    pub async fn abort(&self, ref_key: &str) -> Result<()> {
        match fs::remove_dir_all(self.ingest_dir(ref_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a complete blob in one go.
    pub async fn put(&self, expected: &Descriptor, data: &[u8]) -> Result<()> {
        let key = format!("put-{}", expected.digest);
        self.abort(&key).await?;
        let mut writer = self.writer(&key, expected).await?;
        writer.write_all(data).await?;
        writer.commit().await
    }

    /// Remove a committed blob.
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => {
                debug!(%digest, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OciError::NotFound(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all committed blob digests.
    pub async fn list_blobs(&self) -> Result<Vec<Digest>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(self.blobs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            match Digest::from_hex(&name.to_string_lossy()) {
                Ok(d) => out.push(d),
                Err(_) => warn!(path = %entry.path().display(), "foreign file in blob directory"),
            }
        }
        out.sort();
        Ok(out)
    }

    /// Contents of every `apps/<name>/<hex>/uri` file.
    pub async fn list_app_uris(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut names = match fs::read_dir(self.apps_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(name) = names.next_entry().await? {
            if !name.file_type().await?.is_dir() {
                continue;
            }
            let mut versions = fs::read_dir(name.path()).await?;
            while let Some(version) = versions.next_entry().await? {
                let uri_path = version.path().join("uri");
                match fs::read_to_string(&uri_path).await {
                    Ok(uri) => out.push(uri.trim().to_string()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %version.path().display(), "app layout without uri file");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Remove every committed blob not in `keep`.
    pub async fn prune(&self, keep: &HashSet<Digest>) -> Result<PruneStats> {
        let mut stats = PruneStats::default();
        for digest in self.list_blobs().await? {
            if keep.contains(&digest) {
                continue;
            }
            let size = self.info(&digest).await.unwrap_or(0);
            self.delete(&digest).await?;
            stats.freed_bytes += size;
            stats.removed.push(digest);
        }
        info!(
            removed = stats.removed.len(),
            freed_bytes = stats.freed_bytes,
            "pruned blob store"
        );
        Ok(stats)
    }
}

#[async_trait]
impl BlobProvider for ContentStore {
    async fn open_blob(&self, opts: &ReadOpts) -> Result<BlobStream> {
        let digest = opts.resolve_digest()?;
        let path = self.blob_path(&digest);
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OciError::NotFound(digest.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if opts.offset > 0 {
            file.seek(std::io::SeekFrom::Start(opts.offset)).await?;
        }
        opts.wrap(file, digest)
    }
}

/// An in-progress blob write. Nothing becomes visible under `blobs/` until
/// [`BlobWriter::commit`] has verified size and digest.
pub struct BlobWriter {
    file: fs::File,
    hasher: Sha256,
    offset: u64,
    expected: Descriptor,
    ingest_dir: PathBuf,
    data_path: PathBuf,
    target: PathBuf,
}

impl BlobWriter {
    /// Bytes written so far, including a resumed prefix.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn expected(&self) -> &Descriptor {
        &self.expected
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.offset + data.len() as u64 > self.expected.size {
            return Err(OciError::SizeMismatch {
                expected: self.expected.size,
                got: self.offset + data.len() as u64,
            });
        }
        self.file.write_all(data).await?;
        self.hasher.update(data);
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Copy `stream` into the writer chunk by chunk so the on-disk offset
    /// tracks progress.
    pub async fn copy_from(&mut self, stream: &mut BlobStream) -> Result<u64> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            let n = stream.read(&mut buf).await.map_err(OciError::from_io)?;
            if n == 0 {
                break;
            }
            self.write_all(&buf[..n]).await?;
            self.file.flush().await?;
            copied += n as u64;
        }
        Ok(copied)
    }

    /// Verify and atomically move the blob into place.
    pub async fn commit(mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        if self.offset != self.expected.size {
            return Err(OciError::SizeMismatch {
                expected: self.expected.size,
                got: self.offset,
            });
        }
        let calculated = Digest::from_hasher(self.hasher);
        if calculated != self.expected.digest {
            // The partial data is useless; start over next time.
            let _ = fs::remove_dir_all(&self.ingest_dir).await;
            return Err(OciError::DigestMismatch {
                expected: self.expected.digest.to_string(),
                calculated: calculated.to_string(),
            });
        }

        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&self.data_path, &self.target).await?;
        let _ = fs::remove_dir_all(&self.ingest_dir).await;
        debug!(digest = %self.expected.digest, size = self.offset, "committed blob");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
