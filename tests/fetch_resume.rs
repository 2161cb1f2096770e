//! Interrupted fetches resume from the bytes already in the store, and
//! concurrent callers serialize on the update store.

mod common;

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use common::Device;
use composeapp::app::{BlobType, TreeNode};
use composeapp::blob::{check_blob, BlobInfo, BlobState};
use composeapp::fetch::Fetcher;
use composeapp::ErrorKind;
use composeapp_oci::{
    BlobProvider, BlobStream, ContentStore, Descriptor, Digest, OciError, ReadOpts,
};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

const BLOB_SIZE: usize = 300_000;
const STALL_AT: u64 = 70_000;

/// A reader that never yields data or EOF.
struct Stall;

impl AsyncRead for Stall {
    fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

/// Serves one blob, stalling after `stall_at` bytes until told otherwise.
struct FlakyRemote {
    data: Vec<u8>,
    digest: Digest,
    stall_at: AtomicU64,
    offsets: Mutex<Vec<u64>>,
}

impl FlakyRemote {
    fn new(data: Vec<u8>, stall_at: u64) -> Self {
        Self {
            digest: Digest::of(&data),
            data,
            stall_at: AtomicU64::new(stall_at),
            offsets: Mutex::new(Vec::new()),
        }
    }

    fn heal(&self) {
        self.stall_at.store(u64::MAX, Ordering::SeqCst);
    }

    fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobProvider for FlakyRemote {
    async fn open_blob(&self, opts: &ReadOpts) -> composeapp_oci::Result<BlobStream> {
        let digest = opts.resolve_digest()?;
        if digest != self.digest {
            return Err(OciError::NotFound(digest.to_string()));
        }
        self.offsets.lock().unwrap().push(opts.offset);
        let start = opts.offset as usize;
        let stall_at = self.stall_at.load(Ordering::SeqCst);
        if stall_at < self.data.len() as u64 && start < stall_at as usize {
            let head = self.data[start..stall_at as usize].to_vec();
            opts.wrap(io::Cursor::new(head).chain(Stall), digest)
        } else {
            opts.wrap(io::Cursor::new(self.data[start..].to_vec()), digest)
        }
    }
}

fn missing_blob(digest: &Digest, size: u64) -> BTreeMap<Digest, BlobInfo> {
    let mut desc = Descriptor::new("application/vnd.oci.image.layer.v1.tar+gzip", digest.clone(), size);
    desc.urls.push(format!("hub.example.com/factory/web@{digest}"));
    let node = TreeNode::new(desc, BlobType::ImageLayer);
    BTreeMap::from([(digest.clone(), BlobInfo::new(&node, BlobState::Missing, 4096, None))])
}

async fn wait_for_offset(store: &ContentStore, reference: &str, at_least: u64) -> u64 {
    for _ in 0..1000 {
        if let Some(offset) = store.status(reference).await.unwrap() {
            if offset >= at_least {
                return offset;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("ingest of {reference} never reached {at_least} bytes");
}

#[tokio::test]
async fn interrupted_fetch_resumes_from_partial_data() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ContentStore::new(tmp.path());
    let data: Vec<u8> = (0..BLOB_SIZE).map(|i| (i % 251) as u8).collect();
    let remote = FlakyRemote::new(data, STALL_AT);
    let blobs = missing_blob(&remote.digest, BLOB_SIZE as u64);
    let reference = blobs[&remote.digest].descriptor.urls[0].clone();
    let fetcher = Fetcher::new(&store, &remote).poll_interval(Duration::from_millis(2));

    let cancel = CancellationToken::new();
    let (first, partial) = tokio::join!(fetcher.fetch(&blobs, &cancel, |_| {}), async {
        let offset = wait_for_offset(&store, &reference, STALL_AT).await;
        cancel.cancel();
        offset
    });
    assert_eq!(first.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(partial, STALL_AT);
    assert!(!store.has_blob(&remote.digest).await);
    assert_eq!(store.status(&reference).await.unwrap(), Some(STALL_AT));

    remote.heal();
    let mut last = None;
    let done = fetcher
        .fetch(&blobs, &CancellationToken::new(), |p| last = Some(p.clone()))
        .await
        .unwrap();
    assert_eq!(done.fetched_count, 1);
    assert_eq!(done.current_bytes, BLOB_SIZE as u64);
    assert_eq!(last.unwrap().percent(), 100);

    let offsets = remote.offsets();
    assert_eq!(offsets.first(), Some(&0));
    assert!(*offsets.last().unwrap() >= STALL_AT, "{offsets:?}");

    let desc = &blobs[&remote.digest].descriptor;
    assert_eq!(check_blob(&store, desc).await.unwrap(), BlobState::Ok);
    assert_eq!(store.status(&reference).await.unwrap(), None);
}

#[tokio::test]
async fn corrupt_partial_data_is_discarded() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ContentStore::new(tmp.path());
    let data: Vec<u8> = (0..BLOB_SIZE).map(|i| (i % 13) as u8).collect();
    let remote = FlakyRemote::new(data, u64::MAX);
    let blobs = missing_blob(&remote.digest, BLOB_SIZE as u64);
    let desc = blobs[&remote.digest].descriptor.clone();
    let reference = desc.urls[0].clone();

    // A previous attempt left bytes that are not a prefix of the blob.
    let mut writer = store.writer(&reference, &desc).await.unwrap();
    let mut garbage: BlobStream = Box::new(io::Cursor::new(vec![0xffu8; 4096]));
    assert_eq!(writer.copy_from(&mut garbage).await.unwrap(), 4096);
    drop(writer);
    assert_eq!(store.status(&reference).await.unwrap(), Some(4096));

    let fetcher = Fetcher::new(&store, &remote).poll_interval(Duration::from_millis(2));
    let err = fetcher
        .fetch(&blobs, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity, "{err}");
    assert_eq!(store.status(&reference).await.unwrap(), None);

    // The retry starts from scratch.
    fetcher
        .fetch(&blobs, &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(remote.offsets(), vec![4096, 0]);
    assert_eq!(check_blob(&store, &desc).await.unwrap(), BlobState::Ok);
}

#[tokio::test]
async fn concurrent_creates_admit_one_update() {
    let device = Device::new();
    let web_app = device.push_web_app("nginx-1.25");
    let a = device.runner();
    let b = device.runner();
    let uris = vec![web_app.app.uri.clone()];

    let (ra, rb) = tokio::join!(
        a.create("a", uris.clone(), false),
        b.create("b", uris.clone(), false)
    );
    let outcomes = [ra, rb];
    let created: Vec<_> = outcomes.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(created.len(), 1);
    for r in &outcomes {
        if let Err(e) = r {
            assert_eq!(e.kind(), ErrorKind::StateConflict, "{e}");
        }
    }
    assert_eq!(a.history().await.unwrap().len(), 1);
}
