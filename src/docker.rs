//! Container daemon client: image listing, image loading and removal over
//! the daemon's unix socket.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const TAR_BLOCK: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub repo_digests: Vec<String>,
}

impl ImageSummary {
    pub fn has_name(&self, name: &str) -> bool {
        self.repo_tags.iter().any(|t| t == name) || self.repo_digests.iter().any(|d| d == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub state: String,
}

/// One entry of a `docker load` `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageLoadManifest {
    /// Tar path of the config blob.
    pub config: String,
    pub repo_tags: Vec<String>,
    /// Tar paths of the layer blobs, base first.
    pub layers: Vec<String>,
    /// Host directory the daemon reads layers from instead of the tarball.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers_root: Option<PathBuf>,
}

/// A file to stream into the load tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFile {
    pub tar_path: String,
    pub host_path: PathBuf,
}

/// Everything one image-load request sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageLoadBundle {
    pub manifests: Vec<ImageLoadManifest>,
    pub files: Vec<LoadFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageLoadState {
    ImageWaiting,
    LayerLoading,
    LayerSyncing,
    LayerLoaded,
    ImageLoaded,
    ImageExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadEvent {
    pub state: ImageLoadState,
    pub image_id: String,
    pub layer_id: String,
    pub current: u64,
    pub total: u64,
}

impl LoadEvent {
    fn image(state: ImageLoadState, image_id: impl Into<String>) -> Self {
        Self {
            state,
            image_id: image_id.into(),
            layer_id: String::new(),
            current: 0,
            total: 0,
        }
    }
}

/// The local container image store and container list.
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    /// All containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Stream `bundle` to the daemon's image-load endpoint, reporting each
    /// decoded progress message.
    async fn load_images(
        &self,
        bundle: &ImageLoadBundle,
        on_event: &mut (dyn FnMut(LoadEvent) + Send),
    ) -> Result<()>;

    /// Remove an image by tag or digest reference.
    async fn remove_image(&self, reference: &str) -> Result<()>;
}

type RequestBody = UnsyncBoxBody<Bytes, io::Error>;

/// [`ImageHost`] backed by a Docker-compatible daemon.
pub struct DockerEngine {
    socket: PathBuf,
    client: Client<hyperlocal::UnixConnector, RequestBody>,
}

fn empty() -> RequestBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn transport(e: impl std::fmt::Display) -> Error {
    Error::Transport(format!("container daemon: {e}"))
}

impl DockerEngine {
    /// `docker_host` must be a `unix://` URL.
    pub fn new(docker_host: &str) -> Result<Self> {
        let socket = docker_host.strip_prefix("unix://").ok_or_else(|| {
            Error::InvalidInput(format!(
                "unsupported docker host {docker_host}: only unix:// sockets are supported"
            ))
        })?;
        let client = Client::builder(TokioExecutor::new()).build(hyperlocal::UnixConnector);
        Ok(Self {
            socket: PathBuf::from(socket),
            client,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn request(&self, method: Method, path: &str, body: RequestBody) -> Result<Request<RequestBody>> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket, path).into();
        Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "docker")
            .body(body)
            .map_err(|e| Error::Internal(format!("building daemon request: {e}")))
    }

    async fn call(&self, req: Request<RequestBody>) -> Result<(StatusCode, Bytes)> {
        let resp = self.client.request(req).await.map_err(transport)?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(transport)?
            .to_bytes();
        Ok((status, body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.call(self.request(Method::GET, path, empty())?).await?;
        if !status.is_success() {
            return Err(transport(format!(
                "GET {path} returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ImageHost for DockerEngine {
    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.get_json("/images/json").await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.get_json("/containers/json?all=true").await
    }

    async fn load_images(
        &self,
        bundle: &ImageLoadBundle,
        on_event: &mut (dyn FnMut(LoadEvent) + Send),
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
        let producer = tokio::spawn(write_load_tar(bundle.clone(), tx));
        let body = StreamBody::new(ReceiverStream::new(rx).map_ok(Frame::data)).boxed_unsync();
        let req = self.request(Method::POST, "/images/load?quiet=0", body)?;

        info!(images = bundle.manifests.len(), files = bundle.files.len(), "loading images");
        let resp = self.client.request(req).await.map_err(transport)?;
        let status = resp.status();
        let mut body = resp.into_body();
        let mut lines = LineBuffer::default();
        let mut failure = None;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(transport)?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            for line in lines.push(&data) {
                if !status.is_success() {
                    failure.get_or_insert_with(|| String::from_utf8_lossy(&line).into_owned());
                    continue;
                }
                match parse_load_message(&line) {
                    Ok(Some(event)) => on_event(event),
                    Ok(None) => {}
                    Err(e) => {
                        failure.get_or_insert_with(|| e.to_string());
                    }
                }
            }
        }
        if let Some(line) = lines.finish() {
            if let Ok(Some(event)) = parse_load_message(&line) {
                on_event(event);
            }
        }

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(transport(format!("streaming image tarball: {e}"))),
            Err(e) => return Err(Error::Internal(format!("image tarball task failed: {e}"))),
        }
        if !status.is_success() {
            return Err(transport(format!(
                "image load returned {status}: {}",
                failure.unwrap_or_default()
            )));
        }
        match failure {
            Some(msg) => Err(transport(format!("image load failed: {msg}"))),
            None => Ok(()),
        }
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        let path = format!("/images/{reference}");
        let (status, body) = self
            .call(self.request(Method::DELETE, &path, empty())?)
            .await?;
        match status {
            s if s.is_success() => {
                debug!(image = reference, "removed image");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("image {reference}"))),
            s => Err(transport(format!(
                "DELETE {path} returned {s}: {}",
                String::from_utf8_lossy(&body)
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Load tarball
// ---------------------------------------------------------------------------

fn tar_header(path: &str, size: u64) -> io::Result<Bytes> {
    let mut header = tar::Header::new_ustar();
    header.set_path(path)?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    Ok(Bytes::copy_from_slice(header.as_bytes()))
}

fn padding(size: u64) -> Option<Bytes> {
    let rem = (size % TAR_BLOCK as u64) as usize;
    (rem != 0).then(|| Bytes::from(vec![0u8; TAR_BLOCK - rem]))
}

/// Produce the `docker load` tarball: `manifest.json` followed by each
/// file, ending with two zero blocks. Stops quietly when the receiver is
/// gone.
pub async fn write_load_tar(bundle: ImageLoadBundle, tx: mpsc::Sender<io::Result<Bytes>>) -> io::Result<()> {
    async fn send(tx: &mpsc::Sender<io::Result<Bytes>>, chunk: Bytes) -> io::Result<()> {
        tx.send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "image load request closed"))
    }

    let result = async {
        let manifest = serde_json::to_vec(&bundle.manifests).map_err(io::Error::other)?;
        send(&tx, tar_header("manifest.json", manifest.len() as u64)?).await?;
        let len = manifest.len() as u64;
        send(&tx, Bytes::from(manifest)).await?;
        if let Some(pad) = padding(len) {
            send(&tx, pad).await?;
        }

        for file in &bundle.files {
            let mut f = tokio::fs::File::open(&file.host_path).await?;
            let size = f.metadata().await?.len();
            send(&tx, tar_header(&file.tar_path, size)?).await?;
            let mut remaining = size;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                let n = f.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} shrank while streaming", file.host_path.display()),
                    ));
                }
                send(&tx, Bytes::copy_from_slice(&buf[..n])).await?;
                remaining -= n as u64;
            }
            if let Some(pad) = padding(size) {
                send(&tx, pad).await?;
            }
        }
        send(&tx, Bytes::from(vec![0u8; 2 * TAR_BLOCK])).await
    }
    .await;

    if let Err(e) = &result {
        warn!(error = %e, "aborting image tarball");
        let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
    }
    result
}

// ---------------------------------------------------------------------------
// Load response
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let trimmed = line.trim_ascii();
            if !trimmed.is_empty() {
                out.push(trimmed.to_vec());
            }
        }
        out
    }

    fn finish(self) -> Option<Vec<u8>> {
        let trimmed = self.buf.trim_ascii();
        (!trimmed.is_empty()).then(|| trimmed.to_vec())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadMessage {
    status: Option<String>,
    stream: Option<String>,
    id: Option<String>,
    progress_detail: Option<ProgressDetail>,
    error: Option<String>,
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressDetail {
    #[serde(default)]
    current: u64,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// Decode one line of the daemon's streamed load response.
fn parse_load_message(line: &[u8]) -> Result<Option<LoadEvent>> {
    let msg: LoadMessage = serde_json::from_slice(line)?;
    if msg.error.is_some() || msg.error_detail.is_some() {
        let text = msg
            .error_detail
            .map(|d| d.message)
            .filter(|m| !m.is_empty())
            .or(msg.error)
            .unwrap_or_default();
        return Err(transport(text));
    }

    if let Some(stream) = msg.stream.as_deref().map(str::trim) {
        if let Some(image) = stream
            .strip_prefix("Loaded image: ")
            .or_else(|| stream.strip_prefix("Loaded image ID: "))
        {
            return Ok(Some(LoadEvent::image(ImageLoadState::ImageLoaded, image)));
        }
        if stream.contains("already exists") {
            return Ok(Some(LoadEvent::image(ImageLoadState::ImageExist, stream)));
        }
        return Ok(None);
    }

    let Some(status) = msg.status.as_deref() else {
        return Ok(None);
    };
    let layer_id = msg.id.unwrap_or_default();
    let (current, total) = msg
        .progress_detail
        .map(|p| (p.current, p.total))
        .unwrap_or((0, 0));
    let state = if status.starts_with("Waiting") {
        ImageLoadState::ImageWaiting
    } else if status.starts_with("Syncing") {
        ImageLoadState::LayerSyncing
    } else if status.starts_with("Loading layer") {
        if total > 0 && current >= total {
            ImageLoadState::LayerLoaded
        } else {
            ImageLoadState::LayerLoading
        }
    } else if status.starts_with("Loaded layer") || status.starts_with("Layer already exists") {
        ImageLoadState::LayerLoaded
    } else {
        return Ok(None);
    };
    Ok(Some(LoadEvent {
        state,
        image_id: String::new(),
        layer_id,
        current,
        total,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn docker_host_must_be_unix() {
        assert!(DockerEngine::new("tcp://127.0.0.1:2375").is_err());
    }

    #[tokio::test]
    async fn engine_parses_socket_path() {
        let engine = DockerEngine::new("unix:///run/docker.sock").unwrap();
        assert_eq!(engine.socket(), Path::new("/run/docker.sock"));
    }

    #[test]
    fn parses_layer_progress() {
        let e = parse_load_message(
            br#"{"status":"Loading layer","progressDetail":{"current":10,"total":20},"id":"abc"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(e.state, ImageLoadState::LayerLoading);
        assert_eq!((e.current, e.total), (10, 20));
        assert_eq!(e.layer_id, "abc");

        let e = parse_load_message(
            br#"{"status":"Loading layer","progressDetail":{"current":20,"total":20},"id":"abc"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(e.state, ImageLoadState::LayerLoaded);
    }

    #[test]
    fn parses_image_messages() {
        let e = parse_load_message(br#"{"stream":"Loaded image: hub.io/factory/web:1234567\n"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(e.state, ImageLoadState::ImageLoaded);
        assert_eq!(e.image_id, "hub.io/factory/web:1234567");
        assert!(parse_load_message(br#"{"stream":"\n"}"#).unwrap().is_none());
    }

    #[test]
    fn error_message_is_an_error() {
        let err = parse_load_message(
            br#"{"errorDetail":{"message":"no space left on device"},"error":"no space"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no space left on device"));
    }

    #[test]
    fn line_buffer_splits_across_chunks() {
        let mut lb = LineBuffer::default();
        assert!(lb.push(b"{\"a\":").is_empty());
        let lines = lb.push(b"1}\n\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert_eq!(lb.finish(), Some(b"{\"c\"".to_vec()));
    }

    #[tokio::test]
    async fn load_tarball_is_valid_tar() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        let layer = tmp.path().join("layer");
        std::fs::write(&cfg, b"{}").unwrap();
        std::fs::write(&layer, vec![7u8; 1000]).unwrap();
        let bundle = ImageLoadBundle {
            manifests: vec![ImageLoadManifest {
                config: "blobs/sha256/cfg".to_string(),
                repo_tags: vec!["hub.io/factory/web:1234567".to_string()],
                layers: vec!["blobs/sha256/layer".to_string()],
                layers_root: None,
            }],
            files: vec![
                LoadFile {
                    tar_path: "blobs/sha256/cfg".to_string(),
                    host_path: cfg,
                },
                LoadFile {
                    tar_path: "blobs/sha256/layer".to_string(),
                    host_path: layer,
                },
            ],
        };

        let (tx, mut rx) = mpsc::channel(4);
        let producer = tokio::spawn(write_load_tar(bundle.clone(), tx));
        let mut bytes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        producer.await.unwrap().unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            if name == "manifest.json" {
                let m: Vec<ImageLoadManifest> = serde_json::from_slice(&data).unwrap();
                assert_eq!(m, bundle.manifests);
            }
            if name == "blobs/sha256/layer" {
                assert_eq!(data.len(), 1000);
            }
            names.push(name);
        }
        assert_eq!(
            names,
            vec!["manifest.json", "blobs/sha256/cfg", "blobs/sha256/layer"]
        );
    }

    #[tokio::test]
    async fn missing_file_aborts_tarball() {
        let bundle = ImageLoadBundle {
            manifests: vec![],
            files: vec![LoadFile {
                tar_path: "blobs/sha256/x".to_string(),
                host_path: PathBuf::from("/nonexistent/blob"),
            }],
        };
        let (tx, mut rx) = mpsc::channel(4);
        let producer = tokio::spawn(write_load_tar(bundle, tx));
        let mut saw_error = false;
        while let Some(chunk) = rx.recv().await {
            saw_error |= chunk.is_err();
        }
        assert!(saw_error);
        assert!(producer.await.unwrap().is_err());
    }
}
