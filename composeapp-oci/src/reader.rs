//! Streaming reader that enforces an expected digest, an expected size and a
//! read-byte limit on every blob read.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::digest::Digest;
use crate::{OciError, Result};

/// Boxed byte stream handed out by blob providers.
pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// Wraps a byte stream and verifies it while it is being consumed.
///
/// At least one of `expected_size` or `read_limit` must be set, and when
/// both are, `read_limit >= expected_size`. Verification happens when the
/// consumer reaches end-of-stream; the reader is single pass.
pub struct IntegrityReader<R> {
    inner: R,
    hasher: Sha256,
    read: u64,
    expected_digest: Option<Digest>,
    expected_size: Option<u64>,
    read_limit: Option<u64>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> IntegrityReader<R> {
    pub fn new(
        inner: R,
        expected_digest: Option<Digest>,
        expected_size: Option<u64>,
        read_limit: Option<u64>,
    ) -> Result<Self> {
        match (expected_size, read_limit) {
            (None, None) => {
                return Err(OciError::Manifest(
                    "either an expected size or a read limit is required".to_string(),
                ));
            }
            (Some(size), Some(limit)) if limit < size => {
                return Err(OciError::SizeLimitExceeded { limit });
            }
            _ => {}
        }
        Ok(Self {
            inner,
            hasher: Sha256::new(),
            read: 0,
            expected_digest,
            expected_size,
            read_limit,
            finished: false,
        })
    }

    /// Bytes delivered so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Maximum number of bytes this reader will pull from `inner`. Without a
    /// known size one extra byte is allowed so an oversized blob is detected.
    fn cap(&self) -> u64 {
        match (self.expected_size, self.read_limit) {
            (Some(size), _) => size,
            (None, Some(limit)) => limit.saturating_add(1),
            (None, None) => u64::MAX,
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        if let Some(expected) = self.expected_size {
            // The cap prevents reading past `expected`.
            debug_assert!(self.read <= expected);
            if self.read < expected {
                return Err(OciError::SizeMismatch {
                    expected,
                    got: self.read,
                });
            }
        }
        if let Some(expected) = &self.expected_digest {
            let calculated = Digest::from_hasher(std::mem::take(&mut self.hasher));
            if &calculated != expected {
                return Err(OciError::DigestMismatch {
                    expected: expected.to_string(),
                    calculated: calculated.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for IntegrityReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Ok(()));
        }

        let remaining = this.cap() - this.read;
        if remaining == 0 || buf.remaining() == 0 {
            if remaining == 0 {
                return Poll::Ready(this.finish().map_err(OciError::into_io));
            }
            return Poll::Ready(Ok(()));
        }

        let max = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let n = {
            let mut limited = buf.take(max);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
            let filled = limited.filled();
            if this.expected_size.is_none() {
                if let Some(limit) = this.read_limit {
                    if this.read + filled.len() as u64 > limit {
                        this.finished = true;
                        return Poll::Ready(Err(
                            OciError::SizeLimitExceeded { limit }.into_io()
                        ));
                    }
                }
            }
            this.hasher.update(filled);
            filled.len()
        };

        if n == 0 {
            return Poll::Ready(this.finish().map_err(OciError::into_io));
        }

        // SAFETY: `limited` wrote `n` initialised bytes into the unfilled
        // region of `buf`.
        unsafe {
            buf.assume_init(n);
        }
        buf.advance(n);
        this.read += n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Drain a blob stream into memory, surfacing integrity failures as typed
/// errors.
pub async fn read_all(mut stream: BlobStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    stream
        .read_to_end(&mut out)
        .await
        .map_err(OciError::from_io)?;
    Ok(out)
}

/// Drain a blob stream and discard the bytes; used to validate blobs on disk.
pub async fn drain(mut stream: BlobStream) -> Result<u64> {
    tokio::io::copy(&mut stream, &mut tokio::io::sink())
        .await
        .map_err(OciError::from_io)
}
