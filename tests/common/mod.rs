//! Shared fixtures: an in-memory registry, a fake container daemon and a
//! compose runner that records what it was asked to do.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use composeapp::app::ComposeProject;
use composeapp::compose::ComposeRunner;
use composeapp::config::Config;
use composeapp::docker::{
    ContainerSummary, ImageHost, ImageLoadBundle, ImageLoadState, ImageSummary, LoadEvent,
};
use composeapp::update::{Env, Runner};
use composeapp::{Error, Result};
use composeapp_oci::manifest::{
    MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_EMPTY, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCTET_STREAM,
};
use composeapp_oci::{ContentStore, Digest, MemoryProvider, Platform, PlatformMatcher};
use serde_json::json;
use tempfile::TempDir;

pub const REGISTRY: &str = "hub.example.com/factory";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

// ---------------------------------------------------------------------------
// Registry content
// ---------------------------------------------------------------------------

/// Blobs pushed for one image or app, with their sizes.
#[derive(Debug, Clone, Default)]
pub struct Pushed {
    pub uri: String,
    pub digest: Option<Digest>,
    pub blobs: BTreeMap<Digest, u64>,
}

impl Pushed {
    pub fn digest(&self) -> &Digest {
        self.digest.as_ref().expect("pushed root digest")
    }

    pub fn bytes(&self) -> u64 {
        self.blobs.values().sum()
    }

    fn push(&mut self, registry: &MemoryProvider, data: Vec<u8>) -> (Digest, u64) {
        let size = data.len() as u64;
        let digest = registry.insert(data);
        self.blobs.insert(digest.clone(), size);
        (digest, size)
    }

    fn absorb(&mut self, other: &Pushed) {
        self.blobs
            .extend(other.blobs.iter().map(|(d, s)| (d.clone(), *s)));
    }
}

fn image_manifest(registry: &MemoryProvider, out: &mut Pushed, seed: &str, arch: &str) -> (Digest, u64) {
    let config = json!({
        "architecture": arch,
        "os": "linux",
        "config": { "Cmd": ["/bin/sh", "-c", seed] },
    })
    .to_string()
    .into_bytes();
    let (config_digest, config_size) = out.push(registry, config);
    let (layer_digest, layer_size) = out.push(registry, layer_bytes(seed, arch));

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_MANIFEST,
        "config": {
            "mediaType": MEDIA_TYPE_OCI_CONFIG,
            "digest": config_digest.to_string(),
            "size": config_size,
        },
        "layers": [{
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": layer_digest.to_string(),
            "size": layer_size,
        }],
    })
    .to_string()
    .into_bytes();
    out.push(registry, manifest)
}

/// Content of the single layer of an image pushed with `seed`.
pub fn layer_bytes(seed: &str, arch: &str) -> Vec<u8> {
    format!("{seed}:{arch} layer data\n").repeat(64).into_bytes()
}

/// A single-platform image: manifest, config and one layer.
pub fn push_image(registry: &MemoryProvider, repo: &str, seed: &str) -> Pushed {
    let mut out = Pushed::default();
    let (digest, _) = image_manifest(registry, &mut out, seed, "amd64");
    out.uri = format!("{REGISTRY}/{repo}@{digest}");
    out.digest = Some(digest);
    out
}

/// A multi-platform image. Each platform is `os/arch[/variant]`. Returns
/// the pushed blobs of every platform and the child manifest digests in
/// platform order.
pub fn push_index_image(
    registry: &MemoryProvider,
    repo: &str,
    seed: &str,
    platforms: &[&str],
) -> (Pushed, Vec<Digest>) {
    let mut out = Pushed::default();
    let mut children = Vec::new();
    let mut entries = Vec::new();
    for raw in platforms {
        let mut parts = raw.split('/');
        let os = parts.next().unwrap_or("linux");
        let arch = parts.next().unwrap_or("amd64");
        let variant = parts.next();
        let (digest, size) = image_manifest(registry, &mut out, &format!("{seed}-{raw}"), arch);
        let mut platform = json!({ "os": os, "architecture": arch });
        if let Some(v) = variant {
            platform["variant"] = json!(v);
        }
        entries.push(json!({
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "digest": digest.to_string(),
            "size": size,
            "platform": platform,
        }));
        children.push(digest);
    }
    let index = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_INDEX,
        "manifests": entries,
    })
    .to_string()
    .into_bytes();
    let (digest, _) = out.push(registry, index);
    out.uri = format!("{REGISTRY}/{repo}@{digest}");
    out.digest = Some(digest);
    (out, children)
}

/// A gzipped tarball of `files`.
pub fn tgz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Compose file whose services use `images`, one service per entry.
pub fn compose_file(services: &[(&str, &Pushed)]) -> String {
    let mut out = String::from("services:\n");
    for (name, image) in services {
        out.push_str(&format!(
            "  {name}:\n    image: {}\n    restart: unless-stopped\n",
            image.uri
        ));
    }
    out
}

/// An app whose bundle holds `compose` and a `.env` file. Blob sizes of
/// `images` are folded into the result so `bytes()` is the whole tree.
pub fn push_app(
    registry: &MemoryProvider,
    name: &str,
    compose: &str,
    images: &[&Pushed],
    layers_meta: Option<&serde_json::Value>,
) -> Pushed {
    let mut out = Pushed::default();
    for image in images {
        out.absorb(image);
    }
    let bundle = tgz(&[
        ("docker-compose.yml", compose.as_bytes()),
        (".env", &b"GREETING=hello\n"[..]),
    ]);
    let (bundle_digest, bundle_size) = out.push(registry, bundle);

    let mut layers = vec![json!({
        "mediaType": MEDIA_TYPE_OCTET_STREAM,
        "digest": bundle_digest.to_string(),
        "size": bundle_size,
    })];
    if let Some(meta) = layers_meta {
        let (digest, size) = out.push(registry, meta.to_string().into_bytes());
        layers.push(json!({
            "mediaType": "application/json",
            "digest": digest.to_string(),
            "size": size,
            "annotations": { "layers-meta": "v1" },
        }));
    }
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_MANIFEST,
        "artifactType": "application/vnd.compose.app",
        "config": {
            "mediaType": MEDIA_TYPE_OCI_EMPTY,
            "digest": Digest::of(b"{}").to_string(),
            "size": 2,
        },
        "layers": layers,
        "annotations": { "org.opencontainers.image.title": name },
    })
    .to_string()
    .into_bytes();
    let (digest, _) = out.push(registry, manifest);
    out.uri = format!("{REGISTRY}/{name}@{digest}");
    out.digest = Some(digest);
    out
}

// ---------------------------------------------------------------------------
// Fake daemon
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HostState {
    images: Vec<ImageSummary>,
    containers: Vec<ContainerSummary>,
    loads: Vec<ImageLoadBundle>,
    removed: Vec<String>,
}

/// An [`ImageHost`] that keeps images and containers in memory.
#[derive(Default)]
pub struct FakeImageHost {
    state: Mutex<HostState>,
    /// Reject loads that ask the daemon to read layers from the host.
    pub reject_patched: bool,
}

impl FakeImageHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unpatched() -> Self {
        Self {
            reject_patched: true,
            ..Self::default()
        }
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .images
            .iter()
            .any(|i| i.has_name(name))
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn loads(&self) -> Vec<ImageLoadBundle> {
        self.state.lock().unwrap().loads.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Replace the containers of `project`.
    pub fn set_project_containers(&self, project: &str, containers: Vec<ContainerSummary>) {
        let mut state = self.state.lock().unwrap();
        state.containers.retain(|c| {
            c.labels.get("com.docker.compose.project").map(String::as_str) != Some(project)
        });
        state.containers.extend(containers);
    }
}

#[async_trait]
impl ImageHost for FakeImageHost {
    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.state.lock().unwrap().images.clone())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.state.lock().unwrap().containers.clone())
    }

    async fn load_images(
        &self,
        bundle: &ImageLoadBundle,
        on_event: &mut (dyn FnMut(LoadEvent) + Send),
    ) -> Result<()> {
        self.state.lock().unwrap().loads.push(bundle.clone());
        for file in &bundle.files {
            if !file.host_path.is_file() {
                return Err(Error::Transport(format!(
                    "load file {} is missing",
                    file.host_path.display()
                )));
            }
        }
        for m in &bundle.manifests {
            if let Some(root) = &m.layers_root {
                if self.reject_patched {
                    return Err(Error::Transport("unknown field LayersRoot".to_string()));
                }
                for layer in &m.layers {
                    if !root.join(layer).is_file() {
                        return Err(Error::Transport(format!("layer {layer} is missing")));
                    }
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        for (i, m) in bundle.manifests.iter().enumerate() {
            let id = format!("sha256:{i:064x}");
            on_event(LoadEvent {
                state: ImageLoadState::ImageLoaded,
                image_id: m.repo_tags.first().cloned().unwrap_or_default(),
                layer_id: String::new(),
                current: 0,
                total: 0,
            });
            state.images.push(ImageSummary {
                id,
                repo_tags: m.repo_tags.clone(),
                repo_digests: Vec::new(),
            });
        }
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.images.len();
        state.images.retain(|i| !i.has_name(reference));
        if state.images.len() == before {
            return Err(Error::NotFound(format!("no such image: {reference}")));
        }
        state.removed.push(reference.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compose runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeCall {
    pub verb: &'static str,
    pub dir: PathBuf,
    pub project: String,
}

/// Records every call and runs each service as a container in the fake
/// daemon.
pub struct RecordingCompose {
    host: Arc<FakeImageHost>,
    calls: Mutex<Vec<ComposeCall>>,
}

impl RecordingCompose {
    pub fn new(host: Arc<FakeImageHost>) -> Self {
        Self {
            host,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ComposeCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, verb: &'static str, dir: &Path, project: &str) {
        self.calls.lock().unwrap().push(ComposeCall {
            verb,
            dir: dir.to_path_buf(),
            project: project.to_string(),
        });
    }
}

#[async_trait]
impl ComposeRunner for RecordingCompose {
    async fn up(&self, dir: &Path, project: &str) -> Result<()> {
        self.record("up", dir, project);
        let compose = tokio::fs::read(dir.join("docker-compose.yml")).await?;
        let parsed = ComposeProject::parse(&compose)?;
        let containers = parsed
            .services
            .iter()
            .map(|s| {
                // Compose copies service labels onto the containers it starts.
                let mut labels: HashMap<String, String> =
                    s.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                labels.insert("com.docker.compose.project".to_string(), project.to_string());
                ContainerSummary {
                    id: format!("{project}-{}-1", s.name),
                    image: s.image.spec.clone(),
                    labels,
                    state: "running".to_string(),
                }
            })
            .collect();
        self.host.set_project_containers(project, containers);
        Ok(())
    }

    async fn down(&self, dir: &Path, project: &str) -> Result<()> {
        self.record("down", dir, project);
        self.host.set_project_containers(project, Vec::new());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A device with its own store, compose root and update store, wired to
/// an in-memory registry and fake daemon.
pub struct Device {
    pub tmp: TempDir,
    pub registry: Arc<MemoryProvider>,
    pub host: Arc<FakeImageHost>,
    pub compose: Arc<RecordingCompose>,
    pub config: Config,
}

impl Device {
    pub fn new() -> Self {
        Self::with_host(FakeImageHost::new())
    }

    pub fn with_host(host: FakeImageHost) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            store_root: tmp.path().join("store"),
            compose_root: tmp.path().join("compose"),
            platform: Some("linux/amd64".to_string()),
            usage_watermark: 95,
            db_path: Some(tmp.path().join("db").join("updates.db")),
            fetch_poll_interval_ms: 5,
            lock_timeout_secs: 5,
            ..Config::default()
        };
        let host = Arc::new(host);
        Self {
            registry: Arc::new(MemoryProvider::new()),
            compose: Arc::new(RecordingCompose::new(host.clone())),
            host,
            config,
            tmp,
        }
    }

    pub fn store(&self) -> ContentStore {
        ContentStore::new(self.config.store_root.clone())
    }

    pub fn matcher(&self) -> PlatformMatcher {
        PlatformMatcher::new(Platform::parse("linux/amd64").unwrap())
    }

    pub fn env(&self) -> Env {
        Env {
            config: self.config.clone(),
            store: self.store(),
            remote: self.registry.clone(),
            host: self.host.clone(),
            compose: self.compose.clone(),
            matcher: self.matcher(),
        }
    }

    pub fn runner(&self) -> Runner {
        Runner::new(self.env())
    }

    /// The `web-app` fixture: a web service on `web_seed` and a cache
    /// service that is the same in every version.
    pub fn push_web_app(&self, web_seed: &str) -> WebApp {
        let web = push_image(&self.registry, "nginx", web_seed);
        let cache = push_image(&self.registry, "redis", "redis-7");
        let compose = compose_file(&[("web", &web), ("cache", &cache)]);
        let app = push_app(&self.registry, "web-app", &compose, &[&web, &cache], None);
        WebApp { app, web, cache }
    }
}

pub struct WebApp {
    pub app: Pushed,
    pub web: Pushed,
    pub cache: Pushed,
}
