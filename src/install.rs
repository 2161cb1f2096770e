//! Projects fetched apps into the compose root and the daemon's image
//! store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use composeapp_oci::unpack::{extract_tgz, list_tgz_files};
use composeapp_oci::{ContentStore, PlatformMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::project::{stamp_config_hashes, ImageRef, COMPOSE_FILE};
use crate::app::{App, BlobType, TreeNode};
use crate::docker::{
    ImageHost, ImageLoadBundle, ImageLoadManifest, ImageLoadState, LoadEvent, LoadFile,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppInstallState {
    ExtractingBundle,
    LoadingImages,
    Checking,
    Installed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    pub app: String,
    pub app_state: AppInstallState,
    /// Set while images load.
    pub image: Option<LoadEvent>,
}

pub struct Installer<'a> {
    store: &'a ContentStore,
    host: &'a dyn ImageHost,
    compose_root: PathBuf,
    patched_daemon: bool,
    matcher: Option<&'a PlatformMatcher>,
}

impl<'a> Installer<'a> {
    pub fn new(store: &'a ContentStore, host: &'a dyn ImageHost, compose_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            host,
            compose_root: compose_root.into(),
            patched_daemon: true,
            matcher: None,
        }
    }

    /// Platform used to pick a manifest from a multi-platform image.
    pub fn platform(mut self, matcher: &'a PlatformMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Whether the daemon loads digest-tagged images and reads layers from
    /// a host directory.
    pub fn patched_daemon(mut self, patched: bool) -> Self {
        self.patched_daemon = patched;
        self
    }

    pub fn compose_dir(&self, app: &App) -> PathBuf {
        self.compose_root.join(app.name())
    }

    /// Install `app`, returning the image tags this call loaded.
    pub async fn install(
        &self,
        app: &App,
        on_progress: &mut (dyn FnMut(InstallProgress) + Send),
    ) -> Result<Vec<String>> {
        let name = app.name().to_string();
        let report = |state, image| InstallProgress {
            app: name.clone(),
            app_state: state,
            image,
        };

        on_progress(report(AppInstallState::ExtractingBundle, None));
        let dir = self.compose_dir(app);
        self.extract_bundle(app, &dir).await?;

        on_progress(report(AppInstallState::LoadingImages, None));
        let present = self.host.list_images().await?;
        let mut pending: Vec<(&ImageRef, &TreeNode)> = Vec::new();
        for service in &app.project.services {
            let aliases = service.image.aliases();
            if present.iter().any(|img| aliases.iter().any(|a| img.has_name(a))) {
                debug!(app = %name, image = %service.image.spec, "image already loaded");
                let event = LoadEvent {
                    state: ImageLoadState::ImageExist,
                    image_id: service.image.tag_ref(),
                    layer_id: String::new(),
                    current: 0,
                    total: 0,
                };
                on_progress(report(AppInstallState::LoadingImages, Some(event)));
                continue;
            }
            let root = app.image_root(service).ok_or_else(|| {
                Error::Internal(format!("no image tree for service {}", service.name))
            })?;
            if !pending.iter().any(|(img, _)| img.digest == service.image.digest) {
                pending.push((&service.image, root));
            }
        }

        let mut loaded = Vec::new();
        if !pending.is_empty() {
            let mut forward = |event: LoadEvent| {
                on_progress(report(AppInstallState::LoadingImages, Some(event)));
            };
            let patched = if self.patched_daemon {
                let bundle = self.load_bundle(&pending, true)?;
                match self.host.load_images(&bundle, &mut forward).await {
                    Ok(()) => Some(bundle),
                    Err(e) => {
                        warn!(app = %name, error = %e, "patched image load failed; retrying with inline layers");
                        None
                    }
                }
            } else {
                None
            };
            let bundle = match patched {
                Some(b) => b,
                None => {
                    let bundle = self.load_bundle(&pending, false)?;
                    self.host.load_images(&bundle, &mut forward).await?;
                    bundle
                }
            };
            for m in bundle.manifests {
                loaded.extend(m.repo_tags);
            }
        }

        on_progress(report(AppInstallState::Checking, None));
        self.check(app, &dir).await?;
        // After the size check: stamping rewrites the compose file.
        stamp_compose_file(&dir).await?;

        on_progress(report(AppInstallState::Installed, None));
        info!(app = %name, images = loaded.len(), "app installed");
        Ok(loaded)
    }

    async fn extract_bundle(&self, app: &App, dir: &Path) -> Result<()> {
        let bundle = app
            .bundle()
            .ok_or_else(|| Error::Internal(format!("app {} has no bundle node", app.app_ref)))?;
        let path = self.store.blob_path(&bundle.descriptor.digest);
        let dest = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            extract_tgz(file, &dest).map_err(Error::from)
        })
        .await
        .map_err(|e| Error::Internal(format!("bundle extract task failed: {e}")))??;
        debug!(app = %app.name(), files = files.len(), dir = %dir.display(), "extracted bundle");
        Ok(())
    }

    /// Build the load request for `images`. The patched form tags by digest
    /// too and lets the daemon read layers straight from the store.
    fn load_bundle(&self, images: &[(&ImageRef, &TreeNode)], patched: bool) -> Result<ImageLoadBundle> {
        let mut bundle = ImageLoadBundle::default();
        let mut files = BTreeSet::new();
        for (image, root) in images {
            let manifest = image_manifest(root, self.matcher).ok_or_else(|| {
                Error::Integrity(format!("image {} has no manifest for this platform", image.spec))
            })?;
            let config = manifest
                .children
                .iter()
                .find(|c| c.blob_type == BlobType::ImageConfig)
                .ok_or_else(|| Error::Integrity(format!("image {} has no config", image.spec)))?;

            let config_path = tar_path(config);
            files.insert(config_path.clone());
            let mut layers = Vec::new();
            for layer in manifest.children.iter().filter(|c| c.blob_type == BlobType::ImageLayer) {
                if patched {
                    layers.push(layer.descriptor.digest.hex().to_string());
                } else {
                    let path = tar_path(layer);
                    files.insert(path.clone());
                    layers.push(path);
                }
            }

            let mut repo_tags = vec![image.tag_ref()];
            if patched {
                repo_tags.push(image.digest_ref());
            }
            bundle.manifests.push(ImageLoadManifest {
                config: config_path,
                repo_tags,
                layers,
                layers_root: patched.then(|| self.store.blobs_dir()),
            });
        }

        let blobs_dir = self.store.blobs_dir();
        bundle.files = files
            .into_iter()
            .map(|tar_path| {
                let hex = tar_path.rsplit('/').next().unwrap_or_default().to_string();
                LoadFile {
                    host_path: blobs_dir.join(hex),
                    tar_path,
                }
            })
            .collect();
        Ok(bundle)
    }

    /// Every bundle file is in the compose dir with its size, and every
    /// service image is in the daemon.
    async fn check(&self, app: &App, dir: &Path) -> Result<()> {
        let bundle = app
            .bundle()
            .ok_or_else(|| Error::Internal(format!("app {} has no bundle node", app.app_ref)))?;
        let path = self.store.blob_path(&bundle.descriptor.digest);
        let expected = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            list_tgz_files(file).map_err(Error::from)
        })
        .await
        .map_err(|e| Error::Internal(format!("bundle scan task failed: {e}")))??;

        let mut bad = Vec::new();
        for f in &expected {
            match tokio::fs::metadata(dir.join(&f.path)).await {
                Ok(meta) if meta.len() == f.size => {}
                _ => bad.push(f.path.display().to_string()),
            }
        }
        if !bad.is_empty() {
            return Err(Error::InstallCheck(format!(
                "app {}: bundle files not installed: {}",
                app.name(),
                bad.join(", ")
            )));
        }

        let images = self.host.list_images().await?;
        let missing: Vec<&str> = app
            .project
            .services
            .iter()
            .filter(|s| {
                let aliases = s.image.aliases();
                !images.iter().any(|img| aliases.iter().any(|a| img.has_name(a)))
            })
            .map(|s| s.image.spec.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::InstallCheck(format!(
                "app {}: images missing from the daemon: {}",
                app.name(),
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

fn tar_path(node: &TreeNode) -> String {
    format!("blobs/sha256/{}", node.descriptor.digest.hex())
}

/// Label every service of the installed compose file with its config hash,
/// so running containers can be matched to their definition.
async fn stamp_compose_file(dir: &Path) -> Result<()> {
    let path = dir.join(COMPOSE_FILE);
    let bytes = tokio::fs::read(&path).await?;
    if let Some(stamped) = stamp_config_hashes(&bytes)? {
        tokio::fs::write(&path, stamped).await?;
        debug!(path = %path.display(), "stamped config hashes");
    }
    Ok(())
}

/// The manifest node of an image root: itself, or the child of an index
/// whose platform matches. Indexes that keep every child (skopeo) may list
/// several; without a platform match the first manifest is used.
fn image_manifest<'t>(root: &'t TreeNode, matcher: Option<&PlatformMatcher>) -> Option<&'t TreeNode> {
    if root.blob_type == BlobType::ImageManifest {
        return Some(root);
    }
    let mut manifests = root
        .children
        .iter()
        .filter(|c| c.blob_type == BlobType::ImageManifest);
    let first = manifests.next()?;
    let Some(matcher) = matcher else {
        return Some(first);
    };
    let matches = |n: &TreeNode| n.descriptor.platform.as_ref().is_some_and(|p| matcher.matches(p));
    if matches(first) {
        return Some(first);
    }
    manifests.find(|n| matches(*n)).or(Some(first))
}
