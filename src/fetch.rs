//! Copies missing blobs from a remote provider into the content store.
//!
//! Copies run one after another. A sampler running alongside polls the
//! store for write offsets every `poll_interval` and publishes
//! [`FetchProgress`] snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use composeapp_oci::{BlobProvider, ContentStore, Digest, OciError, ReadOpts};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::{BlobInfo, BlobState};
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobProgress {
    pub state: BlobState,
    pub bytes_fetched: u64,
    pub fetch_start: Option<SystemTime>,
    pub read_speed_cur: u64,
    pub read_speed_avg: u64,
}

/// One progress sample. `current_bytes` and `fetched_count` never decrease
/// over the samples of one fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchProgress {
    pub fetched_count: usize,
    pub total_count: usize,
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub blobs: BTreeMap<Digest, BlobProgress>,
}

impl FetchProgress {
    fn new(blobs: &BTreeMap<Digest, BlobInfo>) -> Self {
        Self {
            fetched_count: 0,
            total_count: blobs.len(),
            current_bytes: 0,
            total_bytes: blobs.values().map(|b| b.descriptor.size).sum(),
            blobs: blobs
                .keys()
                .map(|d| {
                    let p = BlobProgress {
                        state: BlobState::Missing,
                        ..BlobProgress::default()
                    };
                    (d.clone(), p)
                })
                .collect(),
        }
    }

    /// Percentage of bytes fetched; 100 when there is nothing to fetch.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        (u128::from(self.current_bytes) * 100 / u128::from(self.total_bytes)).min(100) as u8
    }
}

#[derive(Default)]
struct CopyState {
    started: HashMap<Digest, (SystemTime, Instant)>,
    done: HashSet<Digest>,
}

pub struct Fetcher<'a> {
    store: &'a ContentStore,
    remote: &'a dyn BlobProvider,
    poll_interval: Duration,
    force: bool,
}

impl<'a> Fetcher<'a> {
    pub fn new(store: &'a ContentStore, remote: &'a dyn BlobProvider) -> Self {
        Self {
            store,
            remote,
            poll_interval: DEFAULT_POLL_INTERVAL,
            force: false,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replace blobs that already exist in the store.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Fetch every blob in `blobs`. `on_progress` sees each sample,
    /// including a final one after the copies end or are cancelled.
    pub async fn fetch<F>(
        &self,
        blobs: &BTreeMap<Digest, BlobInfo>,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<FetchProgress>
    where
        F: FnMut(&FetchProgress),
    {
        let state = Mutex::new(CopyState::default());
        let copy_done = CancellationToken::new();

        let copy = async {
            let result = self.copy_all(blobs, cancel, &state).await;
            copy_done.cancel();
            result
        };

        let sampler = async {
            let mut snapshot = FetchProgress::new(blobs);
            let mut last = Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = copy_done.cancelled() => break,
                    _ = cancel.cancelled() => break,
                }
                self.sample(blobs, &state, &mut snapshot, last.elapsed()).await;
                last = Instant::now();
                on_progress(&snapshot);
            }
            self.sample(blobs, &state, &mut snapshot, last.elapsed()).await;
            on_progress(&snapshot);
            snapshot
        };

        let (result, snapshot) = tokio::join!(copy, sampler);
        result?;
        info!(
            blobs = snapshot.fetched_count,
            bytes = snapshot.current_bytes,
            "fetch finished"
        );
        Ok(snapshot)
    }

    async fn copy_all(
        &self,
        blobs: &BTreeMap<Digest, BlobInfo>,
        cancel: &CancellationToken,
        state: &Mutex<CopyState>,
    ) -> Result<()> {
        for (digest, blob) in blobs {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Ok(mut s) = state.lock() {
                s.started
                    .insert(digest.clone(), (SystemTime::now(), Instant::now()));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.copy_blob(blob) => r?,
            }
            if let Ok(mut s) = state.lock() {
                s.done.insert(digest.clone());
            }
        }
        Ok(())
    }

    async fn copy_blob(&self, blob: &BlobInfo) -> Result<()> {
        let desc = &blob.descriptor;
        let reference = desc.reference().ok_or_else(|| {
            Error::Internal(format!("blob {} has no remote location", desc.digest))
        })?;

        let mut retried = false;
        loop {
            let mut writer = match self.store.writer(reference, desc).await {
                Ok(w) => w,
                Err(OciError::AlreadyExists(_)) if self.force && !retried => {
                    warn!(digest = %desc.digest, "replacing blob already in store");
                    self.store.delete(&desc.digest).await?;
                    retried = true;
                    continue;
                }
                Err(OciError::AlreadyExists(_)) => {
                    debug!(digest = %desc.digest, "blob already in store");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            if writer.offset() < desc.size {
                debug!(
                    digest = %desc.digest,
                    offset = writer.offset(),
                    size = desc.size,
                    "fetching blob"
                );
                let opts = ReadOpts::new()
                    .reference(reference)
                    .digest(desc.digest.clone())
                    .size(desc.size)
                    .media_type(desc.media_type.as_str())
                    .offset(writer.offset());
                let mut stream = self.remote.open_blob(&opts).await?;
                if let Err(e) = writer.copy_from(&mut stream).await {
                    if e.is_integrity() {
                        // The partial data cannot be trusted for a resume.
                        drop(writer);
                        self.store.abort(reference).await?;
                    }
                    return Err(e.into());
                }
            }
            writer.commit().await?;
            return Ok(());
        }
    }

    async fn sample(
        &self,
        blobs: &BTreeMap<Digest, BlobInfo>,
        state: &Mutex<CopyState>,
        snapshot: &mut FetchProgress,
        elapsed: Duration,
    ) {
        let (started, done) = match state.lock() {
            Ok(s) => (s.started.clone(), s.done.clone()),
            Err(_) => return,
        };

        for (digest, blob) in blobs {
            let Some(progress) = snapshot.blobs.get_mut(digest) else {
                continue;
            };
            let size = blob.descriptor.size;
            let observed = if done.contains(digest) {
                size
            } else if started.contains_key(digest) {
                let committed = self.store.info(digest).await.ok();
                let partial = match blob.descriptor.reference() {
                    Some(r) => self.store.status(r).await.unwrap_or_else(|e| {
                        warn!(%digest, error = %e, "failed to sample write offset");
                        None
                    }),
                    None => None,
                };
                match (committed, partial) {
                    (Some(c), Some(p)) => c.max(p),
                    (Some(c), None) => c,
                    (None, Some(p)) => p,
                    (None, None) => progress.bytes_fetched,
                }
            } else {
                continue;
            };

            let bytes = observed.max(progress.bytes_fetched).min(size);
            let delta = bytes - progress.bytes_fetched;
            if let Some((wall, mono)) = started.get(digest) {
                progress.fetch_start = Some(*wall);
                let since = mono.elapsed().as_millis().max(1) as u64;
                progress.read_speed_avg = bytes.saturating_mul(1000) / since;
            }
            let window = elapsed.as_millis().max(1) as u64;
            progress.read_speed_cur = delta.saturating_mul(1000) / window;
            progress.bytes_fetched = bytes;
            if done.contains(digest) {
                progress.state = BlobState::Ok;
            }
        }

        snapshot.current_bytes = snapshot.blobs.values().map(|p| p.bytes_fetched).sum();
        snapshot.fetched_count = snapshot
            .blobs
            .values()
            .filter(|p| p.state == BlobState::Ok)
            .count();
    }
}
